#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chatmux_domain::Platform;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::graph_api::{DEFAULT_GRAPH_BASE_URL, GraphApiClient, message_from_graph_comment};
use super::private_api::{AuthRejected, DEFAULT_APP_ID, DEFAULT_PRIVATE_BASE_URL, PrivateApiClient, message_from_private_comment};
use super::scheduler::{ApiSlot, DEFAULT_COOLDOWN, DEFAULT_FAILURE_THRESHOLD, FailoverScheduler, Pick};
use crate::error::SourceError;
use crate::lifecycle::{Adapter, ChatSource, LoopContext};
use crate::{FanoutBus, SecretString, non_blank_secret};

/// Instagram Live comments through two independent APIs.
#[derive(Debug, Clone)]
pub struct InstagramConfig {
	/// Broadcaster's numeric user id, for the private web API.
	pub target_user_id: Option<String>,
	pub session_id: Option<SecretString>,
	pub csrf_token: Option<SecretString>,
	pub app_id: String,
	pub private_base_url: String,

	/// Professional account id, for the Graph API.
	pub ig_user_id: Option<String>,
	pub graph_access_token: Option<SecretString>,
	pub graph_base_url: String,

	/// Desired interval between two polls of the same API; each slot gets half.
	pub poll_interval: Duration,
	pub discovery_attempts: u32,
	/// Discovery attempt `n` waits `n × discovery_step` before the next one.
	pub discovery_step: Duration,
	pub failure_threshold: u32,
	pub cooldown: Duration,
	pub request_timeout: Duration,
}

impl Default for InstagramConfig {
	fn default() -> Self {
		Self {
			target_user_id: None,
			session_id: None,
			csrf_token: None,
			app_id: DEFAULT_APP_ID.to_string(),
			private_base_url: DEFAULT_PRIVATE_BASE_URL.to_string(),
			ig_user_id: None,
			graph_access_token: None,
			graph_base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
			poll_interval: Duration::from_secs(4),
			discovery_attempts: 5,
			discovery_step: Duration::from_secs(2),
			failure_threshold: DEFAULT_FAILURE_THRESHOLD,
			cooldown: DEFAULT_COOLDOWN,
			request_timeout: Duration::from_secs(10),
		}
	}
}

#[derive(Debug, Clone)]
struct PrivateSession {
	client: PrivateApiClient,
	broadcast_id: String,
	last_comment_ts: i64,
}

#[derive(Debug, Clone)]
struct GraphSession {
	client: GraphApiClient,
	media_id: String,
}

fn non_blank(s: Option<&str>) -> Option<&str> {
	s.map(str::trim).filter(|s| !s.is_empty())
}

fn classify(err: anyhow::Error) -> SourceError {
	match err.downcast_ref::<AuthRejected>() {
		Some(rejected) => SourceError::AuthenticationFailed(rejected.0.clone()),
		None => SourceError::Transport(err),
	}
}

/// Retry a live-media lookup with linear backoff.
async fn discover<F, Fut>(
	label: &'static str,
	attempts: u32,
	step: Duration,
	cancel: &CancellationToken,
	mut lookup: F,
) -> Result<String, SourceError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = anyhow::Result<Option<String>>>,
{
	let attempts = attempts.max(1);
	let mut last = SourceError::NoActiveSession(format!("{label}: no live broadcast"));

	for attempt in 1..=attempts {
		match lookup().await {
			Ok(Some(id)) => return Ok(id),
			Ok(None) => {
				debug!(api = label, attempt, "no live broadcast yet");
				last = SourceError::NoActiveSession(format!("{label}: no live broadcast"));
			}
			Err(e) => {
				let err = classify(e);
				if matches!(err, SourceError::AuthenticationFailed(_)) {
					return Err(err);
				}
				warn!(api = label, attempt, error = %err, "broadcast discovery failed");
				last = err;
			}
		}

		if attempt < attempts {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => return Err(SourceError::Cancelled),
				_ = tokio::time::sleep(step * attempt) => {}
			}
		}
	}
	Err(last)
}

/// Pick the most telling error when neither API came up.
fn combine_failures(private: SourceError, graph: SourceError) -> SourceError {
	match (private, graph) {
		(SourceError::Cancelled, _) | (_, SourceError::Cancelled) => SourceError::Cancelled,
		(SourceError::MissingCredentials(_), SourceError::MissingCredentials(_)) => SourceError::MissingCredentials(
			"instagram needs a private session (session_id, csrf_token, target_user_id) or a graph token (graph_access_token, ig_user_id)"
				.to_string(),
		),
		(e @ SourceError::AuthenticationFailed(_), SourceError::MissingCredentials(_) | SourceError::AuthenticationFailed(_))
		| (SourceError::MissingCredentials(_), e @ SourceError::AuthenticationFailed(_)) => e,
		(SourceError::NoActiveSession(a), SourceError::NoActiveSession(_) | SourceError::MissingCredentials(_))
		| (SourceError::MissingCredentials(_), SourceError::NoActiveSession(a)) => SourceError::NoActiveSession(a),
		(a, b) => SourceError::setup(format!("private api: {a}; graph api: {b}")),
	}
}

/// Dual-redundant Instagram Live comment poller.
pub struct InstagramSource {
	config: InstagramConfig,
	private: Mutex<Option<PrivateSession>>,
	graph: Mutex<Option<GraphSession>>,
}

pub type InstagramAdapter = Adapter<InstagramSource>;

impl InstagramSource {
	pub fn new(config: InstagramConfig) -> Self {
		Self {
			config,
			private: Mutex::new(None),
			graph: Mutex::new(None),
		}
	}

	pub fn into_adapter(self, bus: FanoutBus) -> InstagramAdapter {
		Adapter::new(self, bus)
	}

	/// Which APIs came up on the last connect.
	pub fn initialized(&self) -> (bool, bool) {
		(self.private.lock().is_some(), self.graph.lock().is_some())
	}

	async fn init_private(&self, cancel: &CancellationToken) -> Result<PrivateSession, SourceError> {
		let cfg = &self.config;
		let (Some(session_id), Some(csrf), Some(target)) = (
			cfg.session_id.as_ref().filter(|s| !s.is_blank()),
			cfg.csrf_token.as_ref().filter(|s| !s.is_blank()),
			non_blank(cfg.target_user_id.as_deref()),
		) else {
			return Err(SourceError::MissingCredentials("private api not configured".to_string()));
		};

		let client = PrivateApiClient::new(
			cfg.private_base_url.clone(),
			session_id,
			csrf,
			&cfg.app_id,
			cfg.request_timeout,
		)?;
		let broadcast_id = discover("private_api", cfg.discovery_attempts, cfg.discovery_step, cancel, || {
			client.active_broadcast(target)
		})
		.await?;

		Ok(PrivateSession {
			client,
			broadcast_id,
			last_comment_ts: 0,
		})
	}

	async fn init_graph(&self, cancel: &CancellationToken) -> Result<GraphSession, SourceError> {
		let cfg = &self.config;
		let (Some(token), Some(user_id)) = (
			non_blank_secret(cfg.graph_access_token.as_ref()),
			non_blank(cfg.ig_user_id.as_deref()),
		) else {
			return Err(SourceError::MissingCredentials("graph api not configured".to_string()));
		};

		let client = GraphApiClient::new(cfg.graph_base_url.clone(), SecretString::new(token), cfg.request_timeout)?;
		let media_id = discover("graph_api", cfg.discovery_attempts, cfg.discovery_step, cancel, || {
			client.live_media(user_id)
		})
		.await?;

		Ok(GraphSession { client, media_id })
	}

	fn scheduler(&self) -> FailoverScheduler {
		let (private, graph) = self.initialized();
		FailoverScheduler::new(private, graph).with_policy(self.config.failure_threshold, self.config.cooldown)
	}

	async fn poll_private(&self, ctx: &LoopContext) -> anyhow::Result<usize> {
		let Some(session) = self.private.lock().clone() else {
			anyhow::bail!("private api session missing");
		};
		let page = session.client.comments(&session.broadcast_id, session.last_comment_ts).await?;

		let mut newest = session.last_comment_ts;
		let mut published = 0;
		for comment in &page.comments {
			if let Some(ts) = comment.created_at {
				newest = newest.max(ts);
			}
			if let Some((identity, msg)) = message_from_private_comment(comment)
				&& ctx.publish(Some(identity), msg)
			{
				published += 1;
			}
		}
		if let Some(s) = self.private.lock().as_mut() {
			s.last_comment_ts = s.last_comment_ts.max(newest);
		}
		Ok(published)
	}

	async fn poll_graph(&self, ctx: &LoopContext) -> anyhow::Result<usize> {
		let Some(session) = self.graph.lock().clone() else {
			anyhow::bail!("graph api session missing");
		};
		let comments = session.client.comments(&session.media_id).await?;

		let mut published = 0;
		for comment in &comments {
			if let Some((identity, msg)) = message_from_graph_comment(comment)
				&& ctx.publish(Some(identity), msg)
			{
				published += 1;
			}
		}
		Ok(published)
	}
}

#[async_trait::async_trait]
impl ChatSource for InstagramSource {
	fn platform(&self) -> Platform {
		Platform::Instagram
	}

	async fn connect(&self, cancel: &CancellationToken) -> Result<(), SourceError> {
		let (private, graph) = tokio::join!(self.init_private(cancel), self.init_graph(cancel));

		let private = match private {
			Ok(s) => {
				info!(api = "private_api", broadcast_id = %s.broadcast_id, "instagram api ready");
				Ok(s)
			}
			Err(e) => {
				warn!(api = "private_api", error = %e, "instagram api unavailable this session");
				Err(e)
			}
		};
		let graph = match graph {
			Ok(s) => {
				info!(api = "graph_api", media_id = %s.media_id, "instagram api ready");
				Ok(s)
			}
			Err(e) => {
				warn!(api = "graph_api", error = %e, "instagram api unavailable this session");
				Err(e)
			}
		};

		match (private, graph) {
			(Err(a), Err(b)) => Err(combine_failures(a, b)),
			(p, g) => {
				*self.private.lock() = p.ok();
				*self.graph.lock() = g.ok();
				Ok(())
			}
		}
	}

	async fn disconnect(&self) {
		self.private.lock().take();
		self.graph.lock().take();
	}

	async fn run_receive_loop(self: Arc<Self>, ctx: LoopContext) {
		let slot_interval = self.config.poll_interval / 2;
		let mut scheduler = self.scheduler();

		loop {
			match scheduler.pick(Instant::now()) {
				Pick::Use(slot) => {
					let poll = async {
						match slot {
							ApiSlot::Private => self.poll_private(&ctx).await,
							ApiSlot::Graph => self.poll_graph(&ctx).await,
						}
					};
					let result = tokio::select! {
						biased;
						_ = ctx.cancelled() => return,
						r = poll => r,
					};

					match result {
						Ok(published) => {
							scheduler.record_success(slot);
							if published > 0 {
								debug!(api = %slot, published, "instagram poll");
							}
						}
						Err(e) => {
							metrics::counter!("chatmux_instagram_poll_failures_total", "api" => slot.as_str()).increment(1);
							warn!(api = %slot, error = %format!("{e:#}"), "instagram poll failed");
							if scheduler.record_failure(slot, Instant::now()) {
								warn!(
									api = %slot,
									cooldown_secs = self.config.cooldown.as_secs(),
									"instagram api benched after repeated failures"
								);
							}
						}
					}

					if !ctx.sleep(slot_interval).await {
						return;
					}
				}
				Pick::WaitUntil(deadline) => {
					info!("both instagram apis cooling down; waiting");
					if !ctx.sleep_until(deadline).await {
						return;
					}
				}
				Pick::NoneAvailable => {
					if ctx.reconnect(&*self).await.is_err() {
						return;
					}
					scheduler = self.scheduler();
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU32, Ordering};

	use super::*;

	#[tokio::test(start_paused = true)]
	async fn discovery_backs_off_linearly() {
		let calls = AtomicU32::new(0);
		let started = Instant::now();
		let found = discover("test", 5, Duration::from_secs(2), &CancellationToken::new(), || {
			let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
			async move { Ok((n == 3).then(|| "live-1".to_string())) }
		})
		.await
		.unwrap();

		assert_eq!(found, "live-1");
		assert_eq!(calls.load(Ordering::SeqCst), 3);
		// 1×2s + 2×2s
		assert_eq!(started.elapsed(), Duration::from_secs(6));
	}

	#[tokio::test(start_paused = true)]
	async fn discovery_gives_up_after_attempts() {
		let calls = AtomicU32::new(0);
		let err = discover("test", 3, Duration::from_millis(10), &CancellationToken::new(), || {
			calls.fetch_add(1, Ordering::SeqCst);
			async { Ok(None) }
		})
		.await
		.unwrap_err();
		assert!(matches!(err, SourceError::NoActiveSession(_)));
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn discovery_stops_on_rejected_credentials() {
		let calls = AtomicU32::new(0);
		let err = discover("test", 5, Duration::from_secs(1), &CancellationToken::new(), || {
			calls.fetch_add(1, Ordering::SeqCst);
			async { Err(anyhow::Error::new(AuthRejected("401".into()))) }
		})
		.await
		.unwrap_err();
		assert!(matches!(err, SourceError::AuthenticationFailed(_)));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn failure_combination() {
		let missing = || SourceError::MissingCredentials("x".into());
		assert!(matches!(combine_failures(missing(), missing()), SourceError::MissingCredentials(_)));
		assert!(matches!(
			combine_failures(SourceError::AuthenticationFailed("a".into()), missing()),
			SourceError::AuthenticationFailed(_)
		));
		assert!(matches!(
			combine_failures(missing(), SourceError::NoActiveSession("offline".into())),
			SourceError::NoActiveSession(_)
		));
		assert!(matches!(
			combine_failures(SourceError::Transport(anyhow::anyhow!("reset")), missing()),
			SourceError::Setup(_)
		));
	}

	#[tokio::test]
	async fn unconfigured_connect_is_missing_credentials() {
		let source = InstagramSource::new(InstagramConfig::default());
		let err = source.connect(&CancellationToken::new()).await.unwrap_err();
		assert!(matches!(err, SourceError::MissingCredentials(_)));
		assert_eq!(source.initialized(), (false, false));
	}
}
