#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chatmux_platform::youtube::{YouTubeConfig, YouTubeSource};
use chatmux_platform::{
	AdapterNotice, ChatAdapter, ConnectionState, FanoutBus, QuotaGovernor, ReconnectPolicy, SecretString, SourceError,
};
use mockito::Matcher;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn config(base_url: String) -> YouTubeConfig {
	YouTubeConfig {
		api_key: Some(SecretString::new("test-key")),
		video_id: Some("vid-1".to_string()),
		base_url,
		min_poll_interval: Duration::from_millis(20),
		max_poll_interval: Duration::from_millis(50),
		error_backoff_base: Duration::from_millis(10),
		error_backoff_cap: Duration::from_millis(50),
		..Default::default()
	}
}

fn chat_item(id: &str, text: &str) -> serde_json::Value {
	serde_json::json!({
		"id": id,
		"snippet": {
			"type": "textMessageEvent",
			"publishedAt": "2024-05-01T12:00:00Z",
			"textMessageDetails": { "messageText": text }
		},
		"authorDetails": { "channelId": "UC1", "displayName": "viewer" }
	})
}

async fn mock_active_video(server: &mut mockito::ServerGuard) -> mockito::Mock {
	server
		.mock("GET", "/videos")
		.match_query(Matcher::AllOf(vec![
			Matcher::UrlEncoded("part".into(), "liveStreamingDetails".into()),
			Matcher::UrlEncoded("id".into(), "vid-1".into()),
			Matcher::UrlEncoded("key".into(), "test-key".into()),
		]))
		.with_status(200)
		.with_header("content-type", "application/json")
		.with_body(serde_json::json!({ "items": [{ "liveStreamingDetails": { "activeLiveChatId": "chat-1" } }] }).to_string())
		.create_async()
		.await
}

#[tokio::test]
async fn backlog_is_suppressed_and_new_messages_publish_once() {
	let mut server = mockito::Server::new_async().await;
	let _video = mock_active_video(&mut server).await;

	let _first_page = server
		.mock("GET", "/liveChat/messages")
		.match_query(Matcher::Regex("^liveChatId=chat-1&part=[^&]+&key=test-key$".into()))
		.with_status(200)
		.with_body(
			serde_json::json!({
				"nextPageToken": "p2",
				"pollingIntervalMillis": 10,
				"items": [chat_item("old-1", "from before we joined")]
			})
			.to_string(),
		)
		.create_async()
		.await;

	let _next_pages = server
		.mock("GET", "/liveChat/messages")
		.match_query(Matcher::Regex("pageToken=p2".into()))
		.with_status(200)
		.with_body(
			serde_json::json!({
				"nextPageToken": "p2",
				"pollingIntervalMillis": 10,
				"items": [chat_item("old-1", "from before we joined"), chat_item("new-1", "fresh")]
			})
			.to_string(),
		)
		.create_async()
		.await;

	let quota = Arc::new(QuotaGovernor::new(10_000));
	let bus = FanoutBus::default();
	let mut sub = bus.subscribe();
	let adapter = YouTubeSource::new(config(server.url()), Arc::clone(&quota)).into_adapter(bus);

	adapter.start(&CancellationToken::new()).await.unwrap();
	assert_eq!(adapter.state(), ConnectionState::Connected);

	let msg = timeout(Duration::from_secs(3), sub.recv_message()).await.unwrap().unwrap();
	assert_eq!(msg.text, "fresh");

	// further polls return the same ids
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert!(sub.try_recv().is_none());

	adapter.stop().await;
	let used = quota.used();
	assert!(used >= 1 + 5 * 2, "videos.list plus at least two polls billed, got {used}");
	assert_eq!((used - 1) % 5, 0);
}

#[tokio::test]
async fn malformed_item_does_not_cost_the_rest_of_the_page() {
	let mut server = mockito::Server::new_async().await;
	let _video = mock_active_video(&mut server).await;
	let _messages = server
		.mock("GET", "/liveChat/messages")
		.match_query(Matcher::Any)
		.with_status(200)
		.with_body(
			serde_json::json!({
				"nextPageToken": "p2",
				"pollingIntervalMillis": 10,
				"items": [{ "id": "bad-1" }, chat_item("good-1", "hello")]
			})
			.to_string(),
		)
		.create_async()
		.await;

	let bus = FanoutBus::default();
	let mut sub = bus.subscribe();
	let mut cfg = config(server.url());
	cfg.skip_backlog = false;
	let adapter = YouTubeSource::new(cfg, Arc::new(QuotaGovernor::new(10_000))).into_adapter(bus);

	adapter.start(&CancellationToken::new()).await.unwrap();
	let msg = timeout(Duration::from_secs(3), sub.recv_message()).await.unwrap().unwrap();
	assert_eq!(msg.text, "hello");
	assert_eq!(msg.metadata("message_id"), Some("good-1"));

	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(adapter.state(), ConnectionState::Connected);
	assert!(adapter.last_error().is_none());
	adapter.stop().await;
}

#[tokio::test]
async fn failing_polls_re_resolve_chat_and_publish_messages_from_the_outage() {
	let mut server = mockito::Server::new_async().await;
	let video = server
		.mock("GET", "/videos")
		.match_query(Matcher::Any)
		.with_status(200)
		.with_body(serde_json::json!({ "items": [{ "liveStreamingDetails": { "activeLiveChatId": "chat-1" } }] }).to_string())
		.expect_at_least(2)
		.create_async()
		.await;
	let _failing = server
		.mock("GET", "/liveChat/messages")
		.match_query(Matcher::Any)
		.with_status(500)
		.with_body("backend error")
		.expect(2)
		.create_async()
		.await;
	let _recovered = server
		.mock("GET", "/liveChat/messages")
		.match_query(Matcher::Any)
		.with_status(200)
		.with_body(
			serde_json::json!({
				"nextPageToken": "p2",
				"pollingIntervalMillis": 10,
				"items": [chat_item("outage-1", "sent while we were away")]
			})
			.to_string(),
		)
		.create_async()
		.await;

	let bus = FanoutBus::default();
	let mut sub = bus.subscribe();
	let mut cfg = config(server.url());
	cfg.error_streak_threshold = 2;
	let adapter = YouTubeSource::new(cfg, Arc::new(QuotaGovernor::new(10_000)))
		.into_adapter(bus)
		.with_reconnect_policy(ReconnectPolicy {
			max_attempts: 3,
			base_delay: Duration::from_millis(10),
			max_delay: Duration::from_millis(50),
		});
	let mut notices = adapter.subscribe_notices();

	adapter.start(&CancellationToken::new()).await.unwrap();
	let msg = timeout(Duration::from_secs(3), sub.recv_message()).await.unwrap().unwrap();
	assert_eq!(msg.text, "sent while we were away");
	assert_eq!(adapter.state(), ConnectionState::Connected);
	video.assert_async().await;

	let mut states = Vec::new();
	while let Ok(AdapterNotice::StateChanged { new, .. }) = notices.try_recv() {
		states.push(new);
	}
	assert_eq!(
		states,
		vec![
			ConnectionState::Connecting,
			ConnectionState::Connected,
			ConnectionState::Reconnecting,
			ConnectionState::Connected,
		]
	);

	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(sub.try_recv().is_none(), "repeated pages are deduplicated");
	adapter.stop().await;
}

#[tokio::test]
async fn video_without_live_chat_is_no_active_session() {
	let mut server = mockito::Server::new_async().await;
	let _video = server
		.mock("GET", "/videos")
		.match_query(Matcher::Any)
		.with_status(200)
		.with_body(r#"{"items":[{"liveStreamingDetails":{}}]}"#)
		.create_async()
		.await;

	let adapter = YouTubeSource::new(config(server.url()), Arc::new(QuotaGovernor::new(10_000)))
		.into_adapter(FanoutBus::default());
	let err = adapter.start(&CancellationToken::new()).await.unwrap_err();
	assert!(matches!(err, SourceError::NoActiveSession(_)), "{err}");
	assert_eq!(adapter.state(), ConnectionState::Error);
}

#[tokio::test]
async fn channel_lookup_bills_search() {
	let mut server = mockito::Server::new_async().await;
	let search = server
		.mock("GET", "/search")
		.match_query(Matcher::AllOf(vec![
			Matcher::UrlEncoded("channelId".into(), "UC-live".into()),
			Matcher::UrlEncoded("eventType".into(), "live".into()),
		]))
		.with_status(200)
		.with_body(r#"{"items":[{"id":{"kind":"youtube#video","videoId":"vid-1"}}]}"#)
		.create_async()
		.await;
	let _video = mock_active_video(&mut server).await;
	let _messages = server
		.mock("GET", "/liveChat/messages")
		.match_query(Matcher::Any)
		.with_status(200)
		.with_body(r#"{"pollingIntervalMillis":5000,"items":[]}"#)
		.create_async()
		.await;

	let quota = Arc::new(QuotaGovernor::new(10_000));
	let mut cfg = config(server.url());
	cfg.video_id = None;
	cfg.channel_id = Some("UC-live".to_string());
	let adapter = YouTubeSource::new(cfg, Arc::clone(&quota)).into_adapter(FanoutBus::default());

	adapter.start(&CancellationToken::new()).await.unwrap();
	search.assert_async().await;
	assert!(quota.used() >= 101);
	adapter.stop().await;
}

#[tokio::test]
async fn ended_chat_moves_to_error() {
	let mut server = mockito::Server::new_async().await;
	let _video = mock_active_video(&mut server).await;
	let _messages = server
		.mock("GET", "/liveChat/messages")
		.match_query(Matcher::Any)
		.with_status(403)
		.with_body(r#"{"error":{"code":403,"message":"The live chat is no longer live.","errors":[{"reason":"liveChatEnded"}]}}"#)
		.create_async()
		.await;

	let adapter = YouTubeSource::new(config(server.url()), Arc::new(QuotaGovernor::new(10_000)))
		.into_adapter(FanoutBus::default());
	let mut state = adapter.watch_state();
	adapter.start(&CancellationToken::new()).await.unwrap();

	timeout(Duration::from_secs(3), state.wait_for(|s| *s == ConnectionState::Error))
		.await
		.unwrap()
		.unwrap();
	assert!(adapter.last_error().unwrap().contains("ended"));
	adapter.stop().await;
}

#[tokio::test]
async fn quota_exceeded_pauses_instead_of_failing() {
	let mut server = mockito::Server::new_async().await;
	let _video = mock_active_video(&mut server).await;
	let _messages = server
		.mock("GET", "/liveChat/messages")
		.match_query(Matcher::Any)
		.with_status(403)
		.with_body(r#"{"error":{"code":403,"message":"quota","errors":[{"reason":"quotaExceeded"}]}}"#)
		.expect(1)
		.create_async()
		.await;

	let quota = Arc::new(QuotaGovernor::new(10_000));
	let mut tiers = quota.subscribe();
	let adapter = YouTubeSource::new(config(server.url()), Arc::clone(&quota)).into_adapter(FanoutBus::default());
	adapter.start(&CancellationToken::new()).await.unwrap();

	let change = timeout(Duration::from_secs(3), tiers.recv()).await.unwrap().unwrap();
	assert_eq!(change.new, chatmux_platform::QuotaTier::Exhausted);

	tokio::time::sleep(Duration::from_millis(150)).await;
	assert_eq!(adapter.state(), ConnectionState::Connected);
	assert!(!quota.can_call());
	adapter.stop().await;
}
