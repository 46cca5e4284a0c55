#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chatmux_domain::Platform;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{DEFAULT_YOUTUBE_BASE_URL, LiveChatPage, YouTubeApiError, YouTubeClient};
use super::mapping::message_from_item;
use crate::error::SourceError;
use crate::lifecycle::{Adapter, ChatSource, LoopContext};
use crate::quota::{QuotaGovernor, QuotaTier, cost};
use crate::{FanoutBus, SecretString, non_blank_secret};

/// YouTube live chat polling configuration.
#[derive(Debug, Clone)]
pub struct YouTubeConfig {
	pub api_key: Option<SecretString>,
	/// Takes precedence over `channel_id`.
	pub video_id: Option<String>,
	pub channel_id: Option<String>,
	pub base_url: String,
	pub min_poll_interval: Duration,
	pub max_poll_interval: Duration,
	pub error_backoff_base: Duration,
	pub error_backoff_cap: Duration,
	/// Consecutive poll failures before the chat is resolved again.
	pub error_streak_threshold: u32,
	/// Record the first page after `start` without publishing it. Pages after an
	/// internal reconnect are published; the dedup cache drops repeats.
	pub skip_backlog: bool,
	pub request_timeout: Duration,
}

impl Default for YouTubeConfig {
	fn default() -> Self {
		Self {
			api_key: None,
			video_id: None,
			channel_id: None,
			base_url: DEFAULT_YOUTUBE_BASE_URL.to_string(),
			min_poll_interval: Duration::from_secs(1),
			max_poll_interval: Duration::from_secs(5),
			error_backoff_base: Duration::from_secs(1),
			error_backoff_cap: Duration::from_secs(30),
			error_streak_threshold: 5,
			skip_backlog: true,
			request_timeout: Duration::from_secs(10),
		}
	}
}

/// Server hint clamped into `[min, max]`, then raised to the quota tier floor.
pub fn next_poll_delay(hint_ms: Option<u64>, min: Duration, max: Duration, tier: QuotaTier) -> Duration {
	let max = max.max(min);
	hint_ms
		.map(Duration::from_millis)
		.unwrap_or(min)
		.clamp(min, max)
		.max(tier.poll_floor())
}

/// `attempt² × base`, capped.
pub fn error_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
	let factor = attempt.max(1).saturating_mul(attempt.max(1));
	base.checked_mul(factor).unwrap_or(cap).min(cap)
}

#[derive(Debug)]
struct ChatSession {
	live_chat_id: String,
	page_token: Option<String>,
	backlog_pending: bool,
}

/// Polls `liveChatMessages.list` for one live broadcast.
pub struct YouTubeSource {
	config: YouTubeConfig,
	quota: Arc<QuotaGovernor>,
	client: Mutex<Option<YouTubeClient>>,
	session: Mutex<Option<ChatSession>>,
}

pub type YouTubeAdapter = Adapter<YouTubeSource>;

impl YouTubeSource {
	pub fn new(config: YouTubeConfig, quota: Arc<QuotaGovernor>) -> Self {
		Self {
			config,
			quota,
			client: Mutex::new(None),
			session: Mutex::new(None),
		}
	}

	pub fn into_adapter(self, bus: FanoutBus) -> YouTubeAdapter {
		Adapter::new(self, bus)
	}

	pub fn quota(&self) -> &Arc<QuotaGovernor> {
		&self.quota
	}

	fn client(&self, api_key: &str) -> Result<YouTubeClient, SourceError> {
		let mut slot = self.client.lock();
		if let Some(client) = slot.as_ref() {
			return Ok(client.clone());
		}
		let client = YouTubeClient::new(
			self.config.base_url.clone(),
			SecretString::new(api_key),
			self.config.request_timeout,
		)?;
		*slot = Some(client.clone());
		Ok(client)
	}

	fn classify(&self, err: YouTubeApiError) -> SourceError {
		match err {
			YouTubeApiError::QuotaExceeded => {
				self.quota.mark_exhausted();
				SourceError::QuotaExhausted
			}
			YouTubeApiError::RateLimited { retry_after } => SourceError::RateLimited { retry_after },
			YouTubeApiError::ChatEnded => SourceError::NoActiveSession("youtube live chat has ended".to_string()),
			YouTubeApiError::NotFound(detail) => SourceError::NoActiveSession(detail),
			YouTubeApiError::Auth(reason) => SourceError::AuthenticationFailed(reason),
			YouTubeApiError::Transport(e) => SourceError::Transport(e),
		}
	}

	/// Spend `units` if the budget allows it.
	fn charge(&self, units: u64) -> Result<(), SourceError> {
		if !self.quota.can_call() {
			return Err(SourceError::QuotaExhausted);
		}
		self.quota.record(units);
		Ok(())
	}

	async fn resolve_live_chat(&self, client: &YouTubeClient) -> Result<String, SourceError> {
		let video_id = match self.config.video_id.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
			Some(v) => v.to_string(),
			None => {
				let channel = self
					.config
					.channel_id
					.as_deref()
					.map(str::trim)
					.filter(|c| !c.is_empty())
					.ok_or_else(|| SourceError::setup("youtube needs a video_id or channel_id"))?;
				self.charge(cost::SEARCH_LIST)?;
				client
					.search_live_video(channel)
					.await
					.map_err(|e| self.classify(e))?
					.ok_or_else(|| SourceError::NoActiveSession(format!("channel {channel} is not live")))?
			}
		};

		self.charge(cost::VIDEOS_LIST)?;
		let details = client
			.video_live_details(&video_id)
			.await
			.map_err(|e| self.classify(e))?
			.ok_or_else(|| SourceError::NoActiveSession(format!("video {video_id} not found")))?;

		details
			.active_live_chat_id
			.filter(|id| !id.trim().is_empty())
			.ok_or_else(|| SourceError::NoActiveSession(format!("video {video_id} has no active live chat")))
	}

	fn current_page(&self) -> Option<(String, Option<String>)> {
		self.session
			.lock()
			.as_ref()
			.map(|s| (s.live_chat_id.clone(), s.page_token.clone()))
	}

	/// Messages posted during an outage have not been seen yet and must publish.
	fn resume_after_reconnect(&self) {
		if let Some(s) = self.session.lock().as_mut() {
			s.backlog_pending = false;
		}
	}

	/// Publish (or record, for the backlog page) and return whether the chat ended.
	fn handle_page(&self, ctx: &LoopContext, page: &LiveChatPage) -> bool {
		let backlog = {
			let mut session = self.session.lock();
			match session.as_mut() {
				Some(s) => {
					s.page_token = page.next_page_token.clone();
					std::mem::replace(&mut s.backlog_pending, false)
				}
				None => false,
			}
		};

		let mut ended = page.offline_at.is_some();
		for item in &page.items {
			if item.snippet.kind == "chatEndedEvent" {
				ended = true;
			}
			let identity = format!("youtube:{}", item.id);
			if backlog {
				ctx.remember(identity);
				continue;
			}
			match message_from_item(item) {
				Some(msg) => {
					ctx.publish(Some(identity), msg);
				}
				None => debug!(event_type = %item.snippet.kind, "skipping youtube event"),
			}
		}
		if backlog && !page.items.is_empty() {
			debug!(skipped = page.items.len(), "suppressed youtube chat backlog");
		}
		ended
	}
}

#[async_trait::async_trait]
impl ChatSource for YouTubeSource {
	fn platform(&self) -> Platform {
		Platform::YouTube
	}

	async fn connect(&self, _cancel: &CancellationToken) -> Result<(), SourceError> {
		let Some(api_key) = non_blank_secret(self.config.api_key.as_ref()) else {
			return Err(SourceError::MissingCredentials("youtube api_key is not configured".to_string()));
		};
		if !self.quota.can_call() {
			return Err(SourceError::QuotaExhausted);
		}

		let client = self.client(api_key)?;
		let live_chat_id = self.resolve_live_chat(&client).await?;
		info!(platform = %Platform::YouTube, %live_chat_id, "resolved live chat");

		*self.session.lock() = Some(ChatSession {
			live_chat_id,
			page_token: None,
			backlog_pending: self.config.skip_backlog,
		});
		Ok(())
	}

	async fn disconnect(&self) {
		self.session.lock().take();
	}

	async fn run_receive_loop(self: Arc<Self>, ctx: LoopContext) {
		let cfg = &self.config;
		let mut errors: u32 = 0;
		let mut delay = Duration::ZERO;

		loop {
			if !ctx.sleep(delay).await {
				return;
			}

			let tier = self.quota.tier();
			if tier == QuotaTier::Exhausted {
				debug!(used = self.quota.used(), "quota exhausted; skipping poll");
				delay = tier.poll_floor();
				continue;
			}

			let client = self.client.lock().clone();
			let (Some(client), Some((chat_id, token))) = (client, self.current_page()) else {
				if ctx.reconnect(&*self).await.is_err() {
					return;
				}
				self.resume_after_reconnect();
				delay = Duration::ZERO;
				continue;
			};

			self.quota.record(cost::LIVE_CHAT_MESSAGES_LIST);
			let result = tokio::select! {
				biased;
				_ = ctx.cancelled() => return,
				r = client.live_chat_messages(&chat_id, token.as_deref()) => r,
			};

			match result {
				Ok(page) => {
					errors = 0;
					metrics::counter!("chatmux_youtube_polls_total", "outcome" => "ok").increment(1);
					if self.handle_page(&ctx, &page) {
						ctx.fail(&SourceError::NoActiveSession("youtube live chat went offline".to_string()));
						return;
					}
					delay = next_poll_delay(
						page.polling_interval_millis,
						cfg.min_poll_interval,
						cfg.max_poll_interval,
						self.quota.tier(),
					);
				}
				Err(YouTubeApiError::QuotaExceeded) => {
					metrics::counter!("chatmux_youtube_polls_total", "outcome" => "quota").increment(1);
					warn!("youtube reported quota exceeded; pausing polls");
					self.quota.mark_exhausted();
					delay = QuotaTier::Exhausted.poll_floor();
				}
				Err(YouTubeApiError::RateLimited { retry_after }) => {
					metrics::counter!("chatmux_youtube_polls_total", "outcome" => "rate_limited").increment(1);
					errors = errors.saturating_add(1);
					delay = retry_after
						.unwrap_or_else(|| error_backoff(errors, cfg.error_backoff_base, cfg.error_backoff_cap))
						.max(cfg.min_poll_interval);
					warn!(delay_ms = delay.as_millis() as u64, "youtube rate limited");
				}
				Err(YouTubeApiError::Auth(reason)) => {
					ctx.authentication_failed(reason);
					return;
				}
				Err(e @ (YouTubeApiError::ChatEnded | YouTubeApiError::NotFound(_))) => {
					ctx.fail(&self.classify(e));
					return;
				}
				Err(YouTubeApiError::Transport(e)) => {
					metrics::counter!("chatmux_youtube_polls_total", "outcome" => "error").increment(1);
					errors = errors.saturating_add(1);
					if errors >= cfg.error_streak_threshold {
						warn!(errors, error = %format!("{e:#}"), "youtube poll failing repeatedly; re-resolving chat");
						if ctx.reconnect(&*self).await.is_err() {
							return;
						}
						self.resume_after_reconnect();
						errors = 0;
						delay = Duration::ZERO;
						continue;
					}
					delay = error_backoff(errors, cfg.error_backoff_base, cfg.error_backoff_cap);
					warn!(errors, delay_ms = delay.as_millis() as u64, error = %format!("{e:#}"), "youtube poll failed");
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	const MIN: Duration = Duration::from_secs(1);
	const MAX: Duration = Duration::from_secs(5);

	#[test]
	fn poll_delay_clamps_server_hint() {
		assert_eq!(next_poll_delay(Some(200), MIN, MAX, QuotaTier::Normal), MIN);
		assert_eq!(next_poll_delay(Some(3_000), MIN, MAX, QuotaTier::Normal), Duration::from_secs(3));
		assert_eq!(next_poll_delay(Some(60_000), MIN, MAX, QuotaTier::Normal), MAX);
		assert_eq!(next_poll_delay(None, MIN, MAX, QuotaTier::Normal), MIN);
	}

	#[test]
	fn poll_delay_respects_tier_floor() {
		assert_eq!(next_poll_delay(Some(3_000), MIN, MAX, QuotaTier::Warning), Duration::from_secs(8));
		assert_eq!(next_poll_delay(Some(3_000), MIN, MAX, QuotaTier::Critical), Duration::from_secs(20));
		assert_eq!(next_poll_delay(Some(3_000), MIN, MAX, QuotaTier::Exhausted), Duration::from_secs(300));
	}

	#[test]
	fn error_backoff_is_quadratic_and_capped() {
		let base = Duration::from_secs(1);
		let cap = Duration::from_secs(30);
		let got: Vec<u64> = (1..=6).map(|a| error_backoff(a, base, cap).as_secs()).collect();
		assert_eq!(got, vec![1, 4, 9, 16, 25, 30]);
		assert_eq!(error_backoff(u32::MAX, base, cap), cap);
	}

	proptest! {
		#[test]
		fn poll_delay_never_below_floor_or_min(hint in proptest::option::of(0u64..120_000), tier_idx in 0usize..4) {
			let tier = [QuotaTier::Normal, QuotaTier::Warning, QuotaTier::Critical, QuotaTier::Exhausted][tier_idx];
			let d = next_poll_delay(hint, MIN, MAX, tier);
			prop_assert!(d >= MIN);
			prop_assert!(d >= tier.poll_floor());
			prop_assert!(d <= MAX.max(tier.poll_floor()));
		}
	}

	#[tokio::test]
	async fn missing_api_key_is_reported() {
		let source = YouTubeSource::new(
			YouTubeConfig {
				video_id: Some("abc".into()),
				api_key: Some(SecretString::new("  ")),
				..Default::default()
			},
			Arc::new(QuotaGovernor::new(10_000)),
		);
		let err = source.connect(&CancellationToken::new()).await.unwrap_err();
		assert!(matches!(err, SourceError::MissingCredentials(_)));
	}

	#[tokio::test]
	async fn exhausted_quota_blocks_connect() {
		let quota = Arc::new(QuotaGovernor::new(10));
		quota.record(10);
		let source = YouTubeSource::new(
			YouTubeConfig {
				api_key: Some(SecretString::new("key")),
				video_id: Some("abc".into()),
				..Default::default()
			},
			quota,
		);
		let err = source.connect(&CancellationToken::new()).await.unwrap_err();
		assert!(matches!(err, SourceError::QuotaExhausted));
	}
}
