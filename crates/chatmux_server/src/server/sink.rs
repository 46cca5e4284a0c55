#![forbid(unsafe_code)]

use std::sync::Arc;

use chatmux_domain::ChatMessage;
use chatmux_platform::{BusHandler, QuotaGovernor};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Bus consumer that counts every message and optionally logs it.
pub struct LogSink {
	log_messages: bool,
}

impl LogSink {
	pub fn new(log_messages: bool) -> Self {
		Self { log_messages }
	}
}

#[async_trait::async_trait]
impl BusHandler for LogSink {
	async fn handle(&self, message: Arc<ChatMessage>) -> anyhow::Result<()> {
		metrics::counter!(
			"chatmux_server_messages_total",
			"platform" => message.platform.as_str(),
			"kind" => message.kind.as_str()
		)
		.increment(1);

		if self.log_messages {
			info!(
				platform = %message.platform,
				kind = message.kind.as_str(),
				user = %message.display_name,
				donation = ?message.donation_amount,
				text = %message.text,
				"chat"
			);
		}
		Ok(())
	}

	async fn lagged(&self, dropped: u64) {
		warn!(dropped, "message log fell behind; messages skipped");
	}
}

/// Log quota tier transitions until the governor is dropped.
pub fn spawn_quota_logger(quota: &QuotaGovernor) {
	let mut changes = quota.subscribe();
	tokio::spawn(async move {
		loop {
			match changes.recv().await {
				Ok(change) => warn!(
					old = %change.old,
					new = %change.new,
					used = change.used,
					limit = change.limit,
					"youtube quota tier changed"
				),
				Err(broadcast::error::RecvError::Lagged(skipped)) => debug!(skipped, "quota notice stream lagged"),
				Err(broadcast::error::RecvError::Closed) => break,
			}
		}
	});
}
