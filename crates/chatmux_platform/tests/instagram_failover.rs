#![forbid(unsafe_code)]

use std::time::Duration;

use chatmux_platform::instagram::{InstagramConfig, InstagramSource};
use chatmux_platform::{ChatAdapter, ConnectionState, FanoutBus, SecretString, SourceError};
use mockito::{Matcher, ServerGuard};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn both_apis(server: &ServerGuard) -> InstagramConfig {
	InstagramConfig {
		target_user_id: Some("1001".into()),
		session_id: Some(SecretString::new("sess")),
		csrf_token: Some(SecretString::new("csrf")),
		private_base_url: server.url(),
		ig_user_id: Some("2002".into()),
		graph_access_token: Some(SecretString::new("graph-token")),
		graph_base_url: server.url(),
		poll_interval: Duration::from_millis(40),
		discovery_attempts: 2,
		discovery_step: Duration::from_millis(10),
		cooldown: Duration::from_secs(60),
		..Default::default()
	}
}

async fn mock_discovery(server: &mut ServerGuard) {
	server
		.mock("GET", "/live/web_info/")
		.match_query(Matcher::UrlEncoded("target_user_id".into(), "1001".into()))
		.match_header("x-csrftoken", "csrf")
		.with_status(200)
		.with_body(r#"{"broadcast_id":18000000000000001,"broadcast_status":"active"}"#)
		.create_async()
		.await;
	server
		.mock("GET", "/2002/live_media")
		.match_query(Matcher::Any)
		.with_status(200)
		.with_body(r#"{"data":[{"id":"media-9"}]}"#)
		.create_async()
		.await;
}

#[tokio::test]
async fn failing_private_api_is_benched_and_graph_carries_on() {
	let mut server = mockito::Server::new_async().await;
	mock_discovery(&mut server).await;

	let private_comments = server
		.mock("GET", "/live/18000000000000001/get_comment/")
		.match_query(Matcher::Any)
		.with_status(400)
		.with_body(r#"{"status":"fail"}"#)
		.expect(3)
		.create_async()
		.await;
	let graph_comments = server
		.mock("GET", "/media-9/comments")
		.match_query(Matcher::Any)
		.with_status(200)
		.with_body(r#"{"data":[{"id":"c-1","text":"from graph","username":"fan","timestamp":"2024-03-01T18:22:05+0000"}]}"#)
		.expect_at_least(4)
		.create_async()
		.await;

	let bus = FanoutBus::default();
	let mut sub = bus.subscribe();
	let adapter = InstagramSource::new(both_apis(&server)).into_adapter(bus);
	adapter.start(&CancellationToken::new()).await.unwrap();
	assert_eq!(adapter.source().initialized(), (true, true));

	let msg = timeout(Duration::from_secs(3), sub.recv_message()).await.unwrap().unwrap();
	assert_eq!(msg.text, "from graph");
	assert_eq!(msg.metadata("source"), Some("graph_api"));

	tokio::time::sleep(Duration::from_millis(600)).await;
	adapter.stop().await;

	private_comments.assert_async().await;
	graph_comments.assert_async().await;
	assert!(sub.try_recv().is_none(), "repeated graph comment is deduplicated");
}

#[tokio::test]
async fn same_comment_from_both_apis_publishes_once() {
	let mut server = mockito::Server::new_async().await;
	mock_discovery(&mut server).await;
	server
		.mock("GET", "/live/18000000000000001/get_comment/")
		.match_query(Matcher::Any)
		.with_status(200)
		.with_body(r#"{"comments":[{"pk":77,"text":"dup","created_at":1700000000,"user":{"username":"fan"}}],"status":"ok"}"#)
		.create_async()
		.await;
	server
		.mock("GET", "/media-9/comments")
		.match_query(Matcher::Any)
		.with_status(200)
		.with_body(r#"{"data":[{"id":"77","text":"dup","username":"fan"}]}"#)
		.create_async()
		.await;

	let bus = FanoutBus::default();
	let mut sub = bus.subscribe();
	let adapter = InstagramSource::new(both_apis(&server)).into_adapter(bus);
	adapter.start(&CancellationToken::new()).await.unwrap();

	let msg = timeout(Duration::from_secs(3), sub.recv_message()).await.unwrap().unwrap();
	assert_eq!(msg.metadata("source"), Some("private_api"));
	tokio::time::sleep(Duration::from_millis(200)).await;
	assert!(sub.try_recv().is_none());
	adapter.stop().await;
}

#[tokio::test]
async fn graph_only_configuration_connects() {
	let mut server = mockito::Server::new_async().await;
	mock_discovery(&mut server).await;

	let mut config = both_apis(&server);
	config.session_id = None;
	let adapter = InstagramSource::new(config).into_adapter(FanoutBus::default());
	adapter.start(&CancellationToken::new()).await.unwrap();

	assert_eq!(adapter.state(), ConnectionState::Connected);
	assert_eq!(adapter.source().initialized(), (false, true));
	adapter.stop().await;
}

#[tokio::test]
async fn both_rejected_is_authentication_failure() {
	let mut server = mockito::Server::new_async().await;
	server
		.mock("GET", "/live/web_info/")
		.match_query(Matcher::Any)
		.with_status(403)
		.create_async()
		.await;
	server
		.mock("GET", "/2002/live_media")
		.match_query(Matcher::Any)
		.with_status(401)
		.create_async()
		.await;

	let adapter = InstagramSource::new(both_apis(&server)).into_adapter(FanoutBus::default());
	let err = adapter.start(&CancellationToken::new()).await.unwrap_err();
	assert!(matches!(err, SourceError::AuthenticationFailed(_)), "{err}");
	assert_eq!(adapter.state(), ConnectionState::Error);
}
