#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chatmux_domain::{ChatMessage, ConnectionState, Platform};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::FanoutBus;
use crate::dedup::{DEFAULT_DEDUP_CAPACITY, DedupCache, synthesize_identity};
use crate::error::SourceError;

/// How long `stop` waits for a receive loop to observe cancellation.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnection attempts and exponential backoff bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			base_delay: Duration::from_millis(1_000),
			max_delay: Duration::from_secs(60),
		}
	}
}

impl ReconnectPolicy {
	/// `base_delay * 2^(attempt-1)` clamped to `max_delay`; attempts start at 1.
	pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
		let exp = attempt.saturating_sub(1);
		let multiplier = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
		self.base_delay
			.checked_mul(multiplier)
			.unwrap_or(self.max_delay)
			.min(self.max_delay)
	}
}

/// Adapter notifications distinct from the message stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterNotice {
	StateChanged {
		platform: Platform,
		old: ConnectionState,
		new: ConnectionState,
	},

	/// Credentials were rejected; the adapter will not retry on its own.
	AuthenticationFailed {
		platform: Platform,
		reason: String,
	},
}

/// Protocol-specific half of an adapter.
///
/// `connect` establishes the external session and fails on unrecoverable setup
/// errors. `disconnect` is best-effort teardown. `run_receive_loop` pumps
/// messages until its context is cancelled or it gives up; it reports failures
/// through the context rather than returning them.
#[async_trait::async_trait]
pub trait ChatSource: Send + Sync + 'static {
	fn platform(&self) -> Platform;

	async fn connect(&self, cancel: &CancellationToken) -> Result<(), SourceError>;

	async fn disconnect(&self);

	async fn run_receive_loop(self: Arc<Self>, ctx: LoopContext);
}

/// Object-safe adapter surface used by callers that hold mixed adapters.
#[async_trait::async_trait]
pub trait ChatAdapter: Send + Sync {
	fn platform(&self) -> Platform;

	fn state(&self) -> ConnectionState;

	fn last_error(&self) -> Option<String>;

	/// Watch channel that always holds the current state.
	fn watch_state(&self) -> watch::Receiver<ConnectionState>;

	fn subscribe_notices(&self) -> broadcast::Receiver<AdapterNotice>;

	async fn start(&self, cancel: &CancellationToken) -> Result<(), SourceError>;

	async fn stop(&self);
}

/// State, last error and notification channels of one adapter.
#[derive(Debug)]
pub(crate) struct Lifecycle {
	platform: Platform,
	inner: Mutex<LifecycleInner>,
	state_tx: watch::Sender<ConnectionState>,
	notices: broadcast::Sender<AdapterNotice>,
	auth_failure_reported: AtomicBool,
}

#[derive(Debug, Default)]
struct LifecycleInner {
	state: ConnectionState,
	last_error: Option<String>,
}

impl Lifecycle {
	pub(crate) fn new(platform: Platform) -> Self {
		let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
		let (notices, _notices_rx) = broadcast::channel(64);
		Self {
			platform,
			inner: Mutex::new(LifecycleInner::default()),
			state_tx,
			notices,
			auth_failure_reported: AtomicBool::new(false),
		}
	}

	pub(crate) fn state(&self) -> ConnectionState {
		self.inner.lock().state
	}

	pub(crate) fn last_error(&self) -> Option<String> {
		self.inner.lock().last_error.clone()
	}

	/// Move to `new`. `last_error` is replaced on entry to `Error` and cleared on `Connected`.
	pub(crate) fn transition(&self, new: ConnectionState, error: Option<String>) -> ConnectionState {
		let old = {
			let mut inner = self.inner.lock();
			let old = inner.state;
			match new {
				ConnectionState::Error => inner.last_error = error,
				ConnectionState::Connected => inner.last_error = None,
				_ => {}
			}
			inner.state = new;
			old
		};

		if new == ConnectionState::Connected {
			self.auth_failure_reported.store(false, Ordering::Release);
		}

		if old != new {
			let platform = self.platform;
			debug!(%platform, %old, %new, "adapter state changed");
			metrics::counter!("chatmux_adapter_state_changes_total", "platform" => platform.as_str()).increment(1);
			self.state_tx.send_replace(new);
			let _ = self.notices.send(AdapterNotice::StateChanged { platform, old, new });
		}
		old
	}

	/// Emit the authentication notice; returns `false` if one was already sent this session.
	pub(crate) fn report_auth_failure(&self, reason: &str) -> bool {
		if self.auth_failure_reported.swap(true, Ordering::AcqRel) {
			return false;
		}
		let _ = self.notices.send(AdapterNotice::AuthenticationFailed {
			platform: self.platform,
			reason: reason.to_string(),
		});
		true
	}
}

/// Handle passed to a receive loop.
#[derive(Clone)]
pub struct LoopContext {
	cancel: CancellationToken,
	lifecycle: Arc<Lifecycle>,
	dedup: Arc<DedupCache>,
	bus: FanoutBus,
	policy: ReconnectPolicy,
}

impl LoopContext {
	pub fn platform(&self) -> Platform {
		self.lifecycle.platform
	}

	pub fn cancel_token(&self) -> &CancellationToken {
		&self.cancel
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Resolves once the adapter is being stopped.
	pub async fn cancelled(&self) {
		self.cancel.cancelled().await
	}

	/// Cancellable sleep; returns `false` if cancelled first.
	pub async fn sleep(&self, duration: Duration) -> bool {
		tokio::select! {
			biased;
			_ = self.cancel.cancelled() => false,
			_ = tokio::time::sleep(duration) => true,
		}
	}

	pub async fn sleep_until(&self, deadline: Instant) -> bool {
		tokio::select! {
			biased;
			_ = self.cancel.cancelled() => false,
			_ = tokio::time::sleep_until(deadline) => true,
		}
	}

	pub fn state(&self) -> ConnectionState {
		self.lifecycle.state()
	}

	/// Dedup then publish. `identity` of `None` falls back to an author + text hash.
	pub fn publish(&self, identity: Option<String>, message: ChatMessage) -> bool {
		let platform = self.platform();
		if let Err(e) = message.validate() {
			metrics::counter!("chatmux_adapter_invalid_messages_total", "platform" => platform.as_str()).increment(1);
			debug!(%platform, error = %e, "dropping invalid message");
			return false;
		}

		let identity = identity.unwrap_or_else(|| synthesize_identity(&message.username, &message.text));
		if !self.dedup.insert(identity) {
			metrics::counter!("chatmux_adapter_duplicates_total", "platform" => platform.as_str()).increment(1);
			return false;
		}

		metrics::counter!("chatmux_adapter_messages_total", "platform" => platform.as_str()).increment(1);
		self.bus.publish(message);
		true
	}

	/// Record an identity without publishing (backlog suppression).
	pub fn remember(&self, identity: impl Into<String>) -> bool {
		self.dedup.insert(identity)
	}

	/// Enter `Error` with `err` as the last error.
	pub fn fail(&self, err: &SourceError) {
		let platform = self.platform();
		warn!(%platform, error = %err, "receive loop failed");
		self.lifecycle.transition(ConnectionState::Error, Some(err.to_string()));
	}

	/// Terminal credential rejection: one notice per session, then `Error`.
	pub fn authentication_failed(&self, reason: impl Into<String>) {
		let reason = reason.into();
		let platform = self.platform();
		if self.lifecycle.report_auth_failure(&reason) {
			warn!(%platform, %reason, "authentication failed; not reconnecting");
			metrics::counter!("chatmux_adapter_auth_failures_total", "platform" => platform.as_str()).increment(1);
		}
		self.lifecycle.transition(
			ConnectionState::Error,
			Some(SourceError::AuthenticationFailed(reason).to_string()),
		);
	}

	/// Tear down and re-run `connect` with exponential backoff.
	///
	/// Returns once connected again, when cancelled, or after the attempt ceiling
	/// is reached (state is then `Error`).
	pub async fn reconnect<S: ChatSource + ?Sized>(&self, source: &S) -> Result<(), SourceError> {
		let platform = self.platform();
		self.lifecycle.transition(ConnectionState::Reconnecting, None);
		metrics::counter!("chatmux_adapter_reconnects_total", "platform" => platform.as_str()).increment(1);

		source.disconnect().await;

		let mut last: Option<String> = None;
		for attempt in 1..=self.policy.max_attempts {
			let delay = self.policy.delay_for_attempt(attempt);
			info!(%platform, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

			if !self.sleep(delay).await {
				return Err(SourceError::Cancelled);
			}

			let outcome = tokio::select! {
				biased;
				_ = self.cancel.cancelled() => Err(SourceError::Cancelled),
				r = source.connect(&self.cancel) => r,
			};

			match outcome {
				Ok(()) => {
					info!(%platform, attempt, "reconnected");
					self.lifecycle.transition(ConnectionState::Connected, None);
					return Ok(());
				}
				Err(SourceError::Cancelled) => return Err(SourceError::Cancelled),
				Err(SourceError::AuthenticationFailed(reason)) => {
					self.authentication_failed(reason.clone());
					return Err(SourceError::AuthenticationFailed(reason));
				}
				Err(e) => {
					warn!(%platform, attempt, error = %e, "reconnect attempt failed");
					last = Some(e.to_string());
				}
			}
		}

		let err = SourceError::ReconnectExhausted {
			attempts: self.policy.max_attempts,
			last: last.unwrap_or_else(|| "no attempts made".to_string()),
		};
		warn!(%platform, error = %err, "giving up on reconnection");
		self.lifecycle.transition(ConnectionState::Error, Some(err.to_string()));
		Err(err)
	}
}

struct RunHandle {
	cancel: CancellationToken,
	task: Option<JoinHandle<()>>,
}

/// Lifecycle state machine wrapped around a [`ChatSource`].
pub struct Adapter<S: ChatSource> {
	source: Arc<S>,
	lifecycle: Arc<Lifecycle>,
	dedup: Arc<DedupCache>,
	bus: FanoutBus,
	policy: ReconnectPolicy,
	stop_timeout: Duration,
	run: Mutex<Option<RunHandle>>,
}

impl<S: ChatSource> Adapter<S> {
	pub fn new(source: S, bus: FanoutBus) -> Self {
		let platform = source.platform();
		Self {
			source: Arc::new(source),
			lifecycle: Arc::new(Lifecycle::new(platform)),
			dedup: Arc::new(DedupCache::new(DEFAULT_DEDUP_CAPACITY)),
			bus,
			policy: ReconnectPolicy::default(),
			stop_timeout: DEFAULT_STOP_TIMEOUT,
			run: Mutex::new(None),
		}
	}

	pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
		self.policy = policy;
		self
	}

	pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
		self.stop_timeout = timeout;
		self
	}

	pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
		self.dedup = Arc::new(DedupCache::new(capacity));
		self
	}

	pub fn source(&self) -> &Arc<S> {
		&self.source
	}

	/// Entries currently remembered for this session.
	pub fn dedup_len(&self) -> usize {
		self.dedup.len()
	}

	fn loop_context(&self, cancel: CancellationToken) -> LoopContext {
		LoopContext {
			cancel,
			lifecycle: Arc::clone(&self.lifecycle),
			dedup: Arc::clone(&self.dedup),
			bus: self.bus.clone(),
			policy: self.policy.clone(),
		}
	}

	fn spawn_receive_loop(&self, token: CancellationToken) -> JoinHandle<()> {
		let platform = self.source.platform();
		let ctx = self.loop_context(token.clone());
		let source = Arc::clone(&self.source);
		let lifecycle = Arc::clone(&self.lifecycle);

		tokio::spawn(async move {
			source.run_receive_loop(ctx).await;
			if !token.is_cancelled() && lifecycle.state() != ConnectionState::Error {
				info!(%platform, "receive loop ended");
				lifecycle.transition(ConnectionState::Disconnected, None);
			} else {
				debug!(%platform, "receive loop exited");
			}
		})
	}

	async fn start_inner(&self, cancel: &CancellationToken) -> Result<(), SourceError> {
		let platform = self.source.platform();
		let token = cancel.child_token();

		{
			let mut run = self.run.lock();
			let state = self.lifecycle.state();
			if state.is_active() {
				debug!(%platform, %state, "start ignored; adapter already active");
				return Ok(());
			}
			if let Some(stale) = run.take() {
				stale.cancel.cancel();
			}
			*run = Some(RunHandle {
				cancel: token.clone(),
				task: None,
			});
			self.lifecycle.transition(ConnectionState::Connecting, None);
		}

		info!(%platform, "connecting");
		let outcome = tokio::select! {
			biased;
			_ = token.cancelled() => Err(SourceError::Cancelled),
			r = self.source.connect(&token) => r,
		};

		match outcome {
			Ok(()) => {
				let spawned = {
					let mut run = self.run.lock();
					match run.as_mut() {
						Some(handle) if !handle.cancel.is_cancelled() && !token.is_cancelled() => {
							self.lifecycle.transition(ConnectionState::Connected, None);
							handle.task = Some(self.spawn_receive_loop(token.clone()));
							true
						}
						_ => false,
					}
				};

				if !spawned {
					debug!(%platform, "connect finished after cancellation");
					self.source.disconnect().await;
					self.lifecycle.transition(ConnectionState::Disconnected, None);
					return Err(SourceError::Cancelled);
				}

				info!(%platform, "connected");
				Ok(())
			}
			Err(SourceError::Cancelled) => {
				debug!(%platform, "connect cancelled");
				self.run.lock().take();
				self.source.disconnect().await;
				self.lifecycle.transition(ConnectionState::Disconnected, None);
				Err(SourceError::Cancelled)
			}
			Err(e) => {
				warn!(%platform, error = %e, "connect failed");
				self.run.lock().take();
				if let SourceError::AuthenticationFailed(reason) = &e {
					self.lifecycle.report_auth_failure(reason);
				}
				self.lifecycle.transition(ConnectionState::Error, Some(e.to_string()));
				Err(e)
			}
		}
	}

	async fn stop_inner(&self) {
		let platform = self.source.platform();
		if self.lifecycle.state() == ConnectionState::Disconnected && self.run.lock().is_none() {
			return;
		}

		let handle = self.run.lock().take();
		if let Some(handle) = handle {
			handle.cancel.cancel();
			if let Some(task) = handle.task {
				match tokio::time::timeout(self.stop_timeout, task).await {
					Ok(Ok(())) => {}
					Ok(Err(e)) => warn!(%platform, error = %e, "receive loop task failed"),
					Err(_) => warn!(
						%platform,
						timeout_ms = self.stop_timeout.as_millis() as u64,
						"receive loop did not stop in time; continuing teardown"
					),
				}
			}
		}

		self.source.disconnect().await;
		self.dedup.clear();
		self.lifecycle.transition(ConnectionState::Disconnected, None);
		info!(%platform, "stopped");
	}
}

#[async_trait::async_trait]
impl<S: ChatSource> ChatAdapter for Adapter<S> {
	fn platform(&self) -> Platform {
		self.source.platform()
	}

	fn state(&self) -> ConnectionState {
		self.lifecycle.state()
	}

	fn last_error(&self) -> Option<String> {
		self.lifecycle.last_error()
	}

	fn watch_state(&self) -> watch::Receiver<ConnectionState> {
		self.lifecycle.state_tx.subscribe()
	}

	fn subscribe_notices(&self) -> broadcast::Receiver<AdapterNotice> {
		self.lifecycle.notices.subscribe()
	}

	async fn start(&self, cancel: &CancellationToken) -> Result<(), SourceError> {
		self.start_inner(cancel).await
	}

	async fn stop(&self) {
		self.stop_inner().await
	}
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
