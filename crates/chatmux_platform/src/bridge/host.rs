#![forbid(unsafe_code)]

use std::sync::Arc;

/// Receives raw strings posted by page scripts. May be called from any thread.
pub type HostMessageHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Embedding surface of a hidden browser view.
///
/// Implementations live with the embedding application; the engine only
/// drives them.
#[async_trait::async_trait]
pub trait BrowserHost: Send + Sync + 'static {
	/// Create or wake the underlying view.
	async fn ensure_ready(&self) -> anyhow::Result<()>;

	async fn navigate(&self, url: &str) -> anyhow::Result<()>;

	/// Evaluate `code` in the page and return its result rendered as a string.
	async fn execute_script(&self, code: &str) -> anyhow::Result<String>;

	/// Replace the page message handler.
	fn register_message_handler(&self, handler: HostMessageHandler);

	fn unregister_message_handler(&self);
}
