#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chatmux_domain::Platform;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::host::BrowserHost;
use super::message::{BridgeMessage, ScrapedItem, message_from_item, parse_bridge_message};
use super::profile::ScrapeProfile;
use super::script::{DEFAULT_POST_EXPRESSION, HEALTH_CHECK_SCRIPT, TEARDOWN_SCRIPT, observer_alive, observer_script};
use crate::FanoutBus;
use crate::error::SourceError;
use crate::http::snippet;
use crate::lifecycle::{Adapter, ChatSource, LoopContext};

#[derive(Debug, Clone)]
pub struct BridgeConfig {
	/// Wait after navigation before injecting.
	pub settle_delay: Duration,
	/// How long to wait for the observer's `initialized` event. Not fatal.
	pub init_timeout: Duration,
	pub health_interval: Duration,
	/// Consecutive failed health checks before the page is reloaded.
	pub health_failure_limit: u32,
	pub script_timeout: Duration,
	pub post_expression: String,
}

impl Default for BridgeConfig {
	fn default() -> Self {
		Self {
			settle_delay: Duration::from_secs(3),
			init_timeout: Duration::from_secs(15),
			health_interval: Duration::from_secs(30),
			health_failure_limit: 3,
			script_timeout: Duration::from_secs(10),
			post_expression: DEFAULT_POST_EXPRESSION.to_string(),
		}
	}
}

struct Inbox {
	rx: mpsc::UnboundedReceiver<String>,
	/// Events that arrived ahead of `initialized`.
	pending: Vec<String>,
}

enum PumpExit {
	Cancelled,
	Lost(String),
}

/// Scrapes a live page through a [`BrowserHost`].
pub struct ScrapeSource<H: BrowserHost> {
	host: Arc<H>,
	profile: ScrapeProfile,
	config: BridgeConfig,
	inbox: Mutex<Option<Inbox>>,
}

pub type ScrapeAdapter<H> = Adapter<ScrapeSource<H>>;

impl<H: BrowserHost> ScrapeSource<H> {
	pub fn new(host: Arc<H>, profile: ScrapeProfile) -> Self {
		Self::with_config(host, profile, BridgeConfig::default())
	}

	pub fn with_config(host: Arc<H>, profile: ScrapeProfile, config: BridgeConfig) -> Self {
		Self {
			host,
			profile,
			config,
			inbox: Mutex::new(None),
		}
	}

	pub fn into_adapter(self, bus: FanoutBus) -> ScrapeAdapter<H> {
		Adapter::new(self, bus)
	}

	pub fn profile(&self) -> &ScrapeProfile {
		&self.profile
	}

	pub fn host(&self) -> &Arc<H> {
		&self.host
	}

	async fn eval(&self, code: &str) -> anyhow::Result<String> {
		tokio::time::timeout(self.config.script_timeout, self.host.execute_script(code))
			.await
			.context("script evaluation timed out")?
	}

	async fn inject(&self) -> anyhow::Result<()> {
		let script = observer_script(&self.profile, &self.config.post_expression).context("render observer script")?;
		let result = self.eval(&script).await.context("inject observer")?;
		debug!(platform = %self.profile.platform, result = %result.trim(), "observer script evaluated");
		Ok(())
	}

	async fn open(&self, cancel: &CancellationToken) -> Result<Inbox, SourceError> {
		let platform = self.profile.platform;
		self.host.ensure_ready().await.context("browser host not ready")?;

		let (tx, rx) = mpsc::unbounded_channel();
		self.host.register_message_handler(Arc::new(move |raw: String| {
			let _ = tx.send(raw);
		}));

		self.host
			.navigate(&self.profile.page_url)
			.await
			.with_context(|| format!("navigate to {}", self.profile.page_url))?;

		tokio::select! {
			_ = cancel.cancelled() => return Err(SourceError::Cancelled),
			_ = tokio::time::sleep(self.config.settle_delay) => {}
		}

		self.inject().await?;

		let mut inbox = Inbox { rx, pending: Vec::new() };
		if !self.await_initialized(&mut inbox, cancel).await? {
			warn!(
				%platform,
				timeout_secs = self.config.init_timeout.as_secs(),
				"observer did not confirm initialization; continuing"
			);
		}
		Ok(inbox)
	}

	/// `Ok(false)` on timeout.
	async fn await_initialized(&self, inbox: &mut Inbox, cancel: &CancellationToken) -> Result<bool, SourceError> {
		let deadline = Instant::now() + self.config.init_timeout;
		loop {
			let next = tokio::select! {
				_ = cancel.cancelled() => return Err(SourceError::Cancelled),
				next = tokio::time::timeout_at(deadline, inbox.rx.recv()) => next,
			};
			match next {
				Err(_) => return Ok(false),
				Ok(None) => return Err(anyhow!("browser host dropped the message handler").into()),
				Ok(Some(raw)) => {
					if let Ok(BridgeMessage::Initialized { selector }) = parse_bridge_message(&raw) {
						info!(
							platform = %self.profile.platform,
							selector = selector.as_deref().unwrap_or("none"),
							"observer initialized"
						);
						return Ok(true);
					}
					inbox.pending.push(raw);
				}
			}
		}
	}

	/// Re-inject when the observer has gone missing, e.g. after an in-page navigation.
	async fn check_health(&self) -> anyhow::Result<()> {
		let result = self.eval(HEALTH_CHECK_SCRIPT).await.context("health check")?;
		if observer_alive(&result) {
			return Ok(());
		}
		let platform = self.profile.platform;
		warn!(%platform, "observer missing; re-injecting");
		metrics::counter!("chatmux_bridge_reinjections_total", "platform" => platform.as_str()).increment(1);
		self.inject().await
	}

	fn handle_raw(&self, ctx: &LoopContext, raw: &str) {
		let platform = self.profile.platform;
		match parse_bridge_message(raw) {
			Ok(BridgeMessage::Comment { item }) => self.publish_item(ctx, item),
			Ok(BridgeMessage::Batch { items }) => {
				for item in items {
					self.publish_item(ctx, item);
				}
			}
			Ok(BridgeMessage::Initialized { selector }) => {
				debug!(%platform, selector = selector.as_deref().unwrap_or("none"), "observer re-initialized");
			}
			Ok(BridgeMessage::Error { message }) => {
				warn!(%platform, %message, "observer reported an error");
			}
			Err(e) => {
				metrics::counter!("chatmux_bridge_malformed_total", "platform" => platform.as_str()).increment(1);
				debug!(%platform, error = %e, raw = %snippet(raw), "ignoring malformed bridge message");
			}
		}
	}

	fn publish_item(&self, ctx: &LoopContext, item: ScrapedItem) {
		if let Some((identity, msg)) = message_from_item(&self.profile, item) {
			ctx.publish(identity, msg);
		}
	}

	async fn pump(&self, mut inbox: Inbox, ctx: &LoopContext) -> PumpExit {
		for raw in std::mem::take(&mut inbox.pending) {
			self.handle_raw(ctx, &raw);
		}

		let period = self.config.health_interval;
		let mut health = tokio::time::interval_at(Instant::now() + period, period);
		health.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut failures = 0u32;

		loop {
			tokio::select! {
				biased;
				_ = ctx.cancelled() => return PumpExit::Cancelled,
				raw = inbox.rx.recv() => match raw {
					Some(raw) => self.handle_raw(ctx, &raw),
					None => return PumpExit::Lost("browser host dropped the message handler".to_string()),
				},
				_ = health.tick() => match self.check_health().await {
					Ok(()) => failures = 0,
					Err(e) => {
						failures += 1;
						warn!(platform = %self.profile.platform, failures, error = %format!("{e:#}"), "health check failed");
						if failures >= self.config.health_failure_limit.max(1) {
							return PumpExit::Lost(format!("{failures} consecutive health check failures"));
						}
					}
				},
			}
		}
	}
}

#[async_trait::async_trait]
impl<H: BrowserHost> ChatSource for ScrapeSource<H> {
	fn platform(&self) -> Platform {
		self.profile.platform
	}

	async fn connect(&self, cancel: &CancellationToken) -> Result<(), SourceError> {
		match self.open(cancel).await {
			Ok(inbox) => {
				info!(platform = %self.profile.platform, url = %self.profile.page_url, "scraper attached");
				*self.inbox.lock() = Some(inbox);
				Ok(())
			}
			Err(e) => {
				self.host.unregister_message_handler();
				Err(e)
			}
		}
	}

	async fn disconnect(&self) {
		self.host.unregister_message_handler();
		self.inbox.lock().take();
		if let Err(e) = self.eval(TEARDOWN_SCRIPT).await {
			debug!(platform = %self.profile.platform, error = %format!("{e:#}"), "observer teardown failed");
		}
	}

	async fn run_receive_loop(self: Arc<Self>, ctx: LoopContext) {
		loop {
			let inbox = self.inbox.lock().take();
			let exit = match inbox {
				Some(inbox) => self.pump(inbox, &ctx).await,
				None => PumpExit::Lost("observer channel not open".to_string()),
			};

			match exit {
				PumpExit::Cancelled => return,
				PumpExit::Lost(reason) => {
					warn!(platform = %self.profile.platform, %reason, "scraper detached");
					if ctx.reconnect(&*self).await.is_err() {
						return;
					}
				}
			}
		}
	}
}
