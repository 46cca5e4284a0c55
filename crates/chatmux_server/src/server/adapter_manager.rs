#![forbid(unsafe_code)]

use std::sync::Arc;

use chatmux_domain::{ConnectionState, Platform};
use chatmux_platform::{AdapterNotice, ChatAdapter};
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Owns the configured adapters for the lifetime of the daemon.
pub struct AdapterManager {
	adapters: Vec<Arc<dyn ChatAdapter>>,
	cancel: CancellationToken,
}

impl AdapterManager {
	/// Takes ownership of `adapters` and starts logging their notices.
	pub fn new(adapters: Vec<Arc<dyn ChatAdapter>>) -> Self {
		let cancel = CancellationToken::new();
		for adapter in &adapters {
			Self::spawn_notice_logger(adapter.as_ref(), cancel.child_token());
		}
		Self { adapters, cancel }
	}

	pub fn len(&self) -> usize {
		self.adapters.len()
	}

	pub fn is_empty(&self) -> bool {
		self.adapters.is_empty()
	}

	/// Start every adapter concurrently. Returns how many reached `Connected`.
	pub async fn start_all(&self) -> usize {
		let results = join_all(
			self.adapters
				.iter()
				.map(|adapter| async move { (adapter.platform(), adapter.start(&self.cancel).await) }),
		)
		.await;

		let mut started = 0;
		for (platform, result) in results {
			match result {
				Ok(()) => started += 1,
				Err(e) => warn!(%platform, error = %e, "adapter failed to start"),
			}
		}
		info!(started, total = self.adapters.len(), "adapters started");
		started
	}

	/// Stop every adapter and end the notice loggers.
	pub async fn stop_all(&self) {
		join_all(self.adapters.iter().map(|adapter| adapter.stop())).await;
		self.cancel.cancel();
		info!(total = self.adapters.len(), "adapters stopped");
	}

	pub fn states(&self) -> Vec<(Platform, ConnectionState, Option<String>)> {
		self.adapters
			.iter()
			.map(|adapter| (adapter.platform(), adapter.state(), adapter.last_error()))
			.collect()
	}

	fn spawn_notice_logger(adapter: &dyn ChatAdapter, cancel: CancellationToken) {
		let mut notices = adapter.subscribe_notices();
		tokio::spawn(async move {
			loop {
				let notice = tokio::select! {
					_ = cancel.cancelled() => break,
					notice = notices.recv() => notice,
				};

				match notice {
					Ok(AdapterNotice::StateChanged { platform, old, new }) => {
						debug!(%platform, %old, %new, "adapter state changed");
						metrics::gauge!("chatmux_server_adapter_connected", "platform" => platform.as_str())
							.set(if new == ConnectionState::Connected { 1.0 } else { 0.0 });
					}
					Ok(AdapterNotice::AuthenticationFailed { platform, reason }) => {
						warn!(%platform, %reason, "credentials rejected; adapter stays in error until restarted");
					}
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						debug!(skipped, "adapter notice stream lagged");
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		});
	}
}
