#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use chatmux_domain::{ChatMessage, ConnectionState, Platform};
use proptest::prelude::*;
use tokio::sync::watch;
use tokio::time::timeout;

use super::*;
use crate::bus::{BusItem, FanoutBus};

#[derive(Debug, Clone)]
enum ConnectStep {
	Succeed,
	Fail(&'static str),
	Reject(&'static str),
	Hang,
}

#[derive(Debug, Clone)]
enum LoopPlan {
	Idle,
	Publish(Vec<(&'static str, &'static str)>),
	DropThenReconnect,
	IgnoreCancel,
	RejectCredentialsTwice,
}

#[derive(Debug)]
struct FakeSource {
	steps: parking_lot::Mutex<VecDeque<ConnectStep>>,
	plan: LoopPlan,
	connect_calls: AtomicUsize,
	disconnect_calls: AtomicUsize,
}

impl FakeSource {
	fn new(steps: impl IntoIterator<Item = ConnectStep>, plan: LoopPlan) -> Self {
		Self {
			steps: parking_lot::Mutex::new(steps.into_iter().collect()),
			plan,
			connect_calls: AtomicUsize::new(0),
			disconnect_calls: AtomicUsize::new(0),
		}
	}
}

#[async_trait::async_trait]
impl ChatSource for FakeSource {
	fn platform(&self) -> Platform {
		Platform::Twitch
	}

	async fn connect(&self, cancel: &CancellationToken) -> Result<(), SourceError> {
		self.connect_calls.fetch_add(1, Ordering::SeqCst);
		let step = self.steps.lock().pop_front().unwrap_or(ConnectStep::Succeed);
		match step {
			ConnectStep::Succeed => Ok(()),
			ConnectStep::Fail(msg) => Err(SourceError::Transport(anyhow::anyhow!(msg))),
			ConnectStep::Reject(msg) => Err(SourceError::AuthenticationFailed(msg.to_string())),
			ConnectStep::Hang => {
				cancel.cancelled().await;
				Err(SourceError::Cancelled)
			}
		}
	}

	async fn disconnect(&self) {
		self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
	}

	async fn run_receive_loop(self: Arc<Self>, ctx: LoopContext) {
		match &self.plan {
			LoopPlan::Idle => ctx.cancelled().await,
			LoopPlan::Publish(items) => {
				for (id, text) in items {
					ctx.publish(Some(id.to_string()), ChatMessage::new(Platform::Twitch, "viewer", *text));
				}
				ctx.cancelled().await;
			}
			LoopPlan::DropThenReconnect => {
				if ctx.reconnect(&*self).await.is_ok() {
					ctx.cancelled().await;
				}
			}
			LoopPlan::IgnoreCancel => {
				tokio::time::sleep(Duration::from_secs(3_600)).await;
			}
			LoopPlan::RejectCredentialsTwice => {
				ctx.authentication_failed("Login authentication failed");
				ctx.authentication_failed("Login authentication failed");
			}
		}
	}
}

fn adapter(source: FakeSource) -> Adapter<FakeSource> {
	Adapter::new(source, FanoutBus::default())
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
	timeout(Duration::from_secs(120), rx.wait_for(|s| *s == want))
		.await
		.unwrap_or_else(|_| panic!("timed out waiting for {want}"))
		.expect("state channel open");
}

#[test]
fn backoff_doubles_from_base() {
	let policy = ReconnectPolicy {
		max_attempts: 5,
		base_delay: Duration::from_millis(1_000),
		max_delay: Duration::from_secs(60),
	};
	let delays: Vec<u128> = (1..=5).map(|a| policy.delay_for_attempt(a).as_millis()).collect();
	assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
}

#[test]
fn backoff_is_clamped() {
	let policy = ReconnectPolicy {
		max_attempts: 50,
		base_delay: Duration::from_millis(500),
		max_delay: Duration::from_secs(10),
	};
	assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(10));
	assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(10));
	assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(10));
}

proptest! {
	#[test]
	fn backoff_is_monotonic_and_bounded(base_ms in 1u64..5_000, max_s in 1u64..600, attempt in 1u32..64) {
		let policy = ReconnectPolicy {
			max_attempts: 5,
			base_delay: Duration::from_millis(base_ms),
			max_delay: Duration::from_secs(max_s),
		};
		let cur = policy.delay_for_attempt(attempt);
		let next = policy.delay_for_attempt(attempt + 1);
		prop_assert!(cur <= next);
		prop_assert!(next <= policy.max_delay);
	}
}

#[tokio::test]
async fn start_is_idempotent_while_connected() {
	let adapter = adapter(FakeSource::new([], LoopPlan::Idle));
	let cancel = CancellationToken::new();

	adapter.start(&cancel).await.expect("first start");
	assert_eq!(adapter.state(), ConnectionState::Connected);

	adapter.start(&cancel).await.expect("second start is a no-op");
	assert_eq!(adapter.source().connect_calls.load(Ordering::SeqCst), 1);

	adapter.stop().await;
	assert_eq!(adapter.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn stop_is_noop_when_disconnected() {
	let adapter = adapter(FakeSource::new([], LoopPlan::Idle));
	adapter.stop().await;
	adapter.stop().await;
	assert_eq!(adapter.source().disconnect_calls.load(Ordering::SeqCst), 0);
	assert_eq!(adapter.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn failed_connect_enters_error_and_success_clears_it() {
	let adapter = adapter(FakeSource::new([ConnectStep::Fail("dns failure")], LoopPlan::Idle));
	let cancel = CancellationToken::new();

	let err = adapter.start(&cancel).await.expect_err("connect fails");
	assert!(matches!(err, SourceError::Transport(_)));
	assert_eq!(adapter.state(), ConnectionState::Error);
	assert!(adapter.last_error().unwrap().contains("dns failure"));

	adapter.start(&cancel).await.expect("retry from Error succeeds");
	assert_eq!(adapter.state(), ConnectionState::Connected);
	assert_eq!(adapter.last_error(), None);

	adapter.stop().await;
}

#[tokio::test]
async fn rejected_credentials_on_connect_notify_once() {
	let adapter = adapter(FakeSource::new([ConnectStep::Reject("bad token")], LoopPlan::Idle));
	let mut notices = adapter.subscribe_notices();

	let err = adapter.start(&CancellationToken::new()).await.expect_err("rejected");
	assert!(matches!(err, SourceError::AuthenticationFailed(_)));

	let mut auth = 0;
	while let Ok(n) = notices.try_recv() {
		if matches!(n, AdapterNotice::AuthenticationFailed { .. }) {
			auth += 1;
		}
	}
	assert_eq!(auth, 1);
}

#[tokio::test]
async fn stop_cancels_inflight_connect() {
	let adapter = Arc::new(adapter(FakeSource::new([ConnectStep::Hang], LoopPlan::Idle)));
	let mut states = adapter.watch_state();

	let starter = {
		let adapter = Arc::clone(&adapter);
		tokio::spawn(async move { adapter.start(&CancellationToken::new()).await })
	};

	wait_for_state(&mut states, ConnectionState::Connecting).await;
	adapter.stop().await;

	let result = timeout(Duration::from_secs(1), starter).await.unwrap().unwrap();
	assert!(matches!(result, Err(SourceError::Cancelled)));
	assert_eq!(adapter.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn caller_token_cancels_connect() {
	let adapter = adapter(FakeSource::new([ConnectStep::Hang], LoopPlan::Idle));
	let cancel = CancellationToken::new();
	let trigger = cancel.clone();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(20)).await;
		trigger.cancel();
	});

	let result = adapter.start(&cancel).await;
	assert!(matches!(result, Err(SourceError::Cancelled)));
	assert_eq!(adapter.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn duplicate_identities_publish_once_per_session() {
	let bus = FanoutBus::default();
	let mut sub = bus.subscribe();
	let adapter = Adapter::new(
		FakeSource::new(
			[],
			LoopPlan::Publish(vec![("m1", "hello"), ("m1", "hello again"), ("m2", "second")]),
		),
		bus,
	);

	adapter.start(&CancellationToken::new()).await.unwrap();

	let first = timeout(Duration::from_millis(500), sub.recv_message()).await.unwrap().unwrap();
	let second = timeout(Duration::from_millis(500), sub.recv_message()).await.unwrap().unwrap();
	assert_eq!(first.text, "hello");
	assert_eq!(second.text, "second");
	assert!(timeout(Duration::from_millis(50), sub.recv()).await.is_err());
	assert_eq!(adapter.dedup_len(), 2);

	adapter.stop().await;
	assert_eq!(adapter.dedup_len(), 0, "dedup cache is cleared on stop");
}

#[tokio::test]
async fn invalid_messages_are_not_published() {
	let bus = FanoutBus::default();
	let mut sub = bus.subscribe();
	let adapter = Adapter::new(FakeSource::new([], LoopPlan::Publish(vec![("blank", "   ")])), bus);

	adapter.start(&CancellationToken::new()).await.unwrap();
	assert!(timeout(Duration::from_millis(50), sub.recv()).await.is_err());
	adapter.stop().await;

	assert!(!matches!(sub.try_recv(), Some(BusItem::Message(_))));
}

#[tokio::test(start_paused = true)]
async fn reconnect_exhaustion_enters_error_after_backoff() {
	let adapter = adapter(FakeSource::new(
		[
			ConnectStep::Succeed,
			ConnectStep::Fail("refused"),
			ConnectStep::Fail("refused"),
			ConnectStep::Fail("refused"),
			ConnectStep::Fail("refused"),
			ConnectStep::Fail("refused"),
		],
		LoopPlan::DropThenReconnect,
	));
	let mut states = adapter.watch_state();

	let started_at = Instant::now();
	adapter.start(&CancellationToken::new()).await.unwrap();
	wait_for_state(&mut states, ConnectionState::Error).await;

	let elapsed = started_at.elapsed();
	assert!(elapsed >= Duration::from_secs(31), "waited {elapsed:?}");
	assert!(elapsed < Duration::from_secs(32), "waited {elapsed:?}");

	assert_eq!(adapter.source().connect_calls.load(Ordering::SeqCst), 6);
	let last_error = adapter.last_error().expect("error recorded");
	assert!(last_error.contains("after 5 attempts"), "{last_error}");

	adapter.stop().await;
	assert_eq!(adapter.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn reconnect_success_returns_to_connected() {
	let adapter = adapter(FakeSource::new(
		[ConnectStep::Succeed, ConnectStep::Fail("refused"), ConnectStep::Succeed],
		LoopPlan::DropThenReconnect,
	));
	let mut states = adapter.watch_state();

	adapter.start(&CancellationToken::new()).await.unwrap();
	wait_for_state(&mut states, ConnectionState::Reconnecting).await;
	wait_for_state(&mut states, ConnectionState::Connected).await;
	assert_eq!(adapter.last_error(), None);
	assert_eq!(adapter.source().connect_calls.load(Ordering::SeqCst), 3);

	adapter.stop().await;
}

#[tokio::test]
async fn stop_interrupts_backoff_sleep() {
	let adapter = adapter(FakeSource::new([ConnectStep::Succeed], LoopPlan::DropThenReconnect)).with_reconnect_policy(
		ReconnectPolicy {
			max_attempts: 5,
			base_delay: Duration::from_secs(60),
			max_delay: Duration::from_secs(600),
		},
	);
	let mut states = adapter.watch_state();

	adapter.start(&CancellationToken::new()).await.unwrap();
	wait_for_state(&mut states, ConnectionState::Reconnecting).await;

	let stop_started = std::time::Instant::now();
	adapter.stop().await;
	assert!(stop_started.elapsed() < Duration::from_secs(2));
	assert_eq!(adapter.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn stop_gives_up_waiting_on_stuck_loop() {
	let adapter =
		adapter(FakeSource::new([], LoopPlan::IgnoreCancel)).with_stop_timeout(Duration::from_millis(50));

	adapter.start(&CancellationToken::new()).await.unwrap();

	let stop_started = std::time::Instant::now();
	adapter.stop().await;
	let elapsed = stop_started.elapsed();
	assert!(elapsed >= Duration::from_millis(50));
	assert!(elapsed < Duration::from_secs(2));
	assert_eq!(adapter.state(), ConnectionState::Disconnected);
	assert_eq!(adapter.source().disconnect_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn authentication_failure_notifies_exactly_once() {
	let adapter = adapter(FakeSource::new([], LoopPlan::RejectCredentialsTwice));
	let mut notices = adapter.subscribe_notices();
	let mut states = adapter.watch_state();

	adapter.start(&CancellationToken::new()).await.unwrap();
	wait_for_state(&mut states, ConnectionState::Error).await;
	tokio::task::yield_now().await;

	let mut auth_notices = 0;
	while let Ok(n) = notices.try_recv() {
		if let AdapterNotice::AuthenticationFailed { platform, reason } = n {
			assert_eq!(platform, Platform::Twitch);
			assert!(reason.contains("Login authentication failed"));
			auth_notices += 1;
		}
	}
	assert_eq!(auth_notices, 1);
	assert_eq!(adapter.source().connect_calls.load(Ordering::SeqCst), 1, "no reconnect");
	assert!(adapter.last_error().unwrap().starts_with("authentication failed"));

	adapter.stop().await;
}

#[tokio::test]
async fn notices_report_each_transition() {
	let adapter = adapter(FakeSource::new([], LoopPlan::Idle));
	let mut notices = adapter.subscribe_notices();

	adapter.start(&CancellationToken::new()).await.unwrap();
	adapter.stop().await;

	let mut seen = Vec::new();
	while let Ok(AdapterNotice::StateChanged { old, new, .. }) = notices.try_recv() {
		seen.push((old, new));
	}
	assert_eq!(
		seen,
		vec![
			(ConnectionState::Disconnected, ConnectionState::Connecting),
			(ConnectionState::Connecting, ConnectionState::Connected),
			(ConnectionState::Connected, ConnectionState::Disconnected),
		]
	);
}
