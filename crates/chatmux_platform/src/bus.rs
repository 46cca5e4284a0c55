#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chatmux_domain::ChatMessage;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Configuration for `FanoutBus`.
#[derive(Debug, Clone)]
pub struct BusConfig {
	/// Maximum number of queued messages per subscriber.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for BusConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone)]
pub enum BusItem {
	Message(Arc<ChatMessage>),

	/// Indicates the subscriber is lagging and items were dropped.
	Lagged {
		dropped: u64,
	},
}

/// Consumer callback run on its own task.
///
/// Errors and panics are logged by the bus and never reach the publishing adapter.
#[async_trait::async_trait]
pub trait BusHandler: Send + Sync + 'static {
	async fn handle(&self, message: Arc<ChatMessage>) -> anyhow::Result<()>;

	/// Called when the subscription fell behind and messages were skipped.
	async fn lagged(&self, _dropped: u64) {}
}

/// Process-wide publish point shared by every adapter.
///
/// Cheap to clone. `publish` never blocks: each subscriber owns a bounded queue
/// and a full queue drops the message for that subscriber only, followed by a
/// `Lagged` marker once space frees up. Per-subscriber order matches the order
/// in which `publish` calls completed.
#[derive(Debug, Clone)]
pub struct FanoutBus {
	inner: Arc<Mutex<Inner>>,
	cfg: BusConfig,
}

impl Default for FanoutBus {
	fn default() -> Self {
		Self::new(BusConfig::default())
	}
}

impl FanoutBus {
	pub fn new(cfg: BusConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Subscribe with a channel receiver. Dropping it unsubscribes.
	pub fn subscribe(&self) -> BusSubscription {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity.max(1));

		let mut inner = self.inner.lock();
		prune_closed_subscribers(&mut inner);
		inner.subscribers.push(Subscriber { tx, pending_lag: 0 });

		if self.cfg.debug_logs {
			debug!(subs = inner.subscribers.len(), "bus: subscribed");
		}

		BusSubscription { rx }
	}

	/// Subscribe a handler driven by its own task. Dropping the guard unsubscribes.
	///
	/// Must be called from within a tokio runtime.
	pub fn subscribe_handler<H: BusHandler>(&self, handler: H) -> HandlerGuard {
		let mut sub = self.subscribe();
		let handler = Arc::new(handler);

		let task = tokio::spawn(async move {
			while let Some(item) = sub.recv().await {
				match item {
					BusItem::Message(message) => {
						let outcome = AssertUnwindSafe(handler.handle(message)).catch_unwind().await;
						match outcome {
							Ok(Ok(())) => {}
							Ok(Err(e)) => {
								metrics::counter!("chatmux_bus_handler_errors_total").increment(1);
								warn!(error = %e, "bus handler returned error");
							}
							Err(_) => {
								metrics::counter!("chatmux_bus_handler_panics_total").increment(1);
								warn!("bus handler panicked; continuing");
							}
						}
					}
					BusItem::Lagged { dropped } => {
						if AssertUnwindSafe(handler.lagged(dropped)).catch_unwind().await.is_err() {
							warn!("bus handler panicked in lagged callback");
						}
					}
				}
			}
			debug!("bus handler task exiting");
		});

		HandlerGuard {
			abort: task.abort_handle(),
		}
	}

	/// Deliver `message` to every live subscriber without blocking.
	pub fn publish(&self, message: ChatMessage) {
		self.publish_shared(Arc::new(message));
	}

	pub fn publish_shared(&self, message: Arc<ChatMessage>) {
		metrics::counter!("chatmux_bus_published_total").increment(1);

		let mut inner = self.inner.lock();
		if inner.subscribers.is_empty() {
			return;
		}

		let item = BusItem::Message(message);
		let mut dropped_total: u64 = 0;
		let mut saw_closed = false;

		for sub in inner.subscribers.iter_mut() {
			match sub.tx.try_send(item.clone()) {
				Ok(()) => {
					if sub.pending_lag > 0 && sub.tx.try_send(BusItem::Lagged { dropped: sub.pending_lag }).is_ok() {
						sub.pending_lag = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;
					sub.pending_lag = sub.pending_lag.saturating_add(1);
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {
					saw_closed = true;
				}
			}
		}

		if saw_closed {
			prune_closed_subscribers(&mut inner);
		}

		if dropped_total > 0 {
			metrics::counter!("chatmux_bus_dropped_total").increment(dropped_total);
			if self.cfg.debug_logs {
				debug!(dropped = dropped_total, "bus: dropped due to full subscriber queues");
			}
		}
	}

	/// Number of subscribers that are still listening.
	pub fn subscriber_count(&self) -> usize {
		let inner = self.inner.lock();
		inner.subscribers.iter().filter(|s| !s.tx.is_closed()).count()
	}
}

/// Receiving end of a bus subscription.
#[derive(Debug)]
pub struct BusSubscription {
	rx: mpsc::Receiver<BusItem>,
}

impl BusSubscription {
	pub async fn recv(&mut self) -> Option<BusItem> {
		self.rx.recv().await
	}

	pub fn try_recv(&mut self) -> Option<BusItem> {
		self.rx.try_recv().ok()
	}

	/// Receive the next message, skipping lag markers.
	pub async fn recv_message(&mut self) -> Option<Arc<ChatMessage>> {
		loop {
			match self.rx.recv().await? {
				BusItem::Message(m) => return Some(m),
				BusItem::Lagged { .. } => continue,
			}
		}
	}
}

/// Keeps a handler subscription alive.
#[derive(Debug)]
pub struct HandlerGuard {
	abort: AbortHandle,
}

impl HandlerGuard {
	pub fn unsubscribe(self) {}
}

impl Drop for HandlerGuard {
	fn drop(&mut self) {
		self.abort.abort();
	}
}

#[derive(Debug, Default)]
struct Inner {
	subscribers: Vec<Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
	tx: mpsc::Sender<BusItem>,

	/// Messages dropped since the last delivered lag marker.
	pending_lag: u64,
}

fn prune_closed_subscribers(inner: &mut Inner) {
	inner.subscribers.retain(|s| !s.tx.is_closed());
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
