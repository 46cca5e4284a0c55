#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chatmux_domain::{ChatMessage, Platform};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::sse::{SseDecoder, SseEvent};
use crate::error::SourceError;
use crate::http::{build_streaming_client, snippet};
use crate::lifecycle::{Adapter, ChatSource, LoopContext};
use crate::{FanoutBus, SecretString, non_blank_secret};

pub const DEFAULT_STREAMING_BASE_URL: &str = "https://streaming-graph.facebook.com";

/// Ceiling on a server-requested `retry:` wait.
const MAX_SERVER_RETRY: Duration = Duration::from_secs(60);

/// Facebook Live comment stream configuration.
#[derive(Debug, Clone)]
pub struct FacebookConfig {
	pub live_video_id: Option<String>,
	pub access_token: Option<SecretString>,
	pub streaming_base_url: String,
	/// `one_hundred_per_second`, `ten_per_second` or `one_per_two_seconds`.
	pub comment_rate: String,
	pub fields: String,
	pub connect_timeout: Duration,
	/// Silence on the stream for this long counts as a dropped connection.
	pub idle_timeout: Duration,
}

impl Default for FacebookConfig {
	fn default() -> Self {
		Self {
			live_video_id: None,
			access_token: None,
			streaming_base_url: DEFAULT_STREAMING_BASE_URL.to_string(),
			comment_rate: "ten_per_second".to_string(),
			fields: "from{name,id},message,created_time,id".to_string(),
			connect_timeout: Duration::from_secs(10),
			idle_timeout: Duration::from_secs(90),
		}
	}
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
	id: String,
	#[serde(default)]
	message: String,
	#[serde(default)]
	from: Option<CommentAuthor>,
	#[serde(default)]
	created_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommentAuthor {
	#[serde(default)]
	id: Option<String>,
	#[serde(default)]
	name: Option<String>,
}

/// Graph timestamps look like `2024-03-01T18:22:05+0000`.
pub fn parse_created_time(raw: &str) -> Option<DateTime<Utc>> {
	DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
		.or_else(|_| DateTime::parse_from_rfc3339(raw))
		.ok()
		.map(|t| t.with_timezone(&Utc))
}

/// Decode one `data` payload into `(identity, message)`.
pub fn comment_from_event(event: &SseEvent) -> Option<(String, ChatMessage)> {
	let payload: CommentPayload = match serde_json::from_str(&event.data) {
		Ok(p) => p,
		Err(e) => {
			debug!(error = %e, data = %snippet(&event.data), "skipping non-comment event");
			return None;
		}
	};

	let author = payload.from.as_ref();
	let author_name = author.and_then(|a| a.name.as_deref()).map(str::trim).filter(|n| !n.is_empty());
	let author_id = author.and_then(|a| a.id.as_deref()).filter(|i| !i.is_empty());
	let username = author_name.or(author_id).unwrap_or("facebook user");

	let mut msg = ChatMessage::new(Platform::Facebook, username, payload.message.as_str())
		.with_metadata("comment_id", payload.id.as_str());
	if let Some(id) = author_id {
		msg = msg.with_metadata("author_id", id);
	}
	if let Some(ts) = payload.created_time.as_deref().and_then(parse_created_time) {
		msg = msg.with_timestamp(ts);
	}
	Some((format!("facebook:{}", payload.id), msg))
}

enum StreamExit {
	Cancelled,
	Lost(String),
}

/// Live comments over the Graph streaming endpoint.
pub struct FacebookSource {
	config: FacebookConfig,
	client: parking_lot::Mutex<Option<reqwest::Client>>,
	stream: tokio::sync::Mutex<Option<reqwest::Response>>,
	last_event_id: parking_lot::Mutex<Option<String>>,
	retry_hint: parking_lot::Mutex<Option<Duration>>,
}

pub type FacebookAdapter = Adapter<FacebookSource>;

impl FacebookSource {
	pub fn new(config: FacebookConfig) -> Self {
		Self {
			config,
			client: parking_lot::Mutex::new(None),
			stream: tokio::sync::Mutex::new(None),
			last_event_id: parking_lot::Mutex::new(None),
			retry_hint: parking_lot::Mutex::new(None),
		}
	}

	pub fn into_adapter(self, bus: FanoutBus) -> FacebookAdapter {
		Adapter::new(self, bus)
	}

	fn client(&self) -> anyhow::Result<reqwest::Client> {
		let mut slot = self.client.lock();
		if let Some(c) = slot.as_ref() {
			return Ok(c.clone());
		}
		let c = build_streaming_client(self.config.connect_timeout)?;
		*slot = Some(c.clone());
		Ok(c)
	}

	fn stream_url(&self, video_id: &str, token: &str) -> anyhow::Result<Url> {
		let mut url = Url::parse(&format!(
			"{}/{}/live_comments",
			self.config.streaming_base_url.trim_end_matches('/'),
			video_id
		))
		.context("facebook stream url")?;
		url.query_pairs_mut()
			.append_pair("access_token", token)
			.append_pair("comment_rate", &self.config.comment_rate)
			.append_pair("fields", &self.config.fields);
		Ok(url)
	}

	async fn pump(&self, resp: reqwest::Response, ctx: &LoopContext) -> StreamExit {
		let idle = self.config.idle_timeout;
		let mut body = resp.bytes_stream();
		let mut decoder = SseDecoder::new();

		loop {
			let next = tokio::select! {
				biased;
				_ = ctx.cancelled() => return StreamExit::Cancelled,
				r = tokio::time::timeout(idle, body.next()) => r,
			};

			let chunk = match next {
				Err(_) => return StreamExit::Lost(format!("no data for {}s", idle.as_secs())),
				Ok(None) => return StreamExit::Lost("stream ended".to_string()),
				Ok(Some(Err(e))) => return StreamExit::Lost(format!("stream error: {e}")),
				Ok(Some(Ok(chunk))) => chunk,
			};

			for event in decoder.push(&chunk) {
				if let Some((identity, msg)) = comment_from_event(&event) {
					ctx.publish(Some(identity), msg);
				}
			}
			if let Some(id) = decoder.last_event_id() {
				*self.last_event_id.lock() = Some(id.to_string());
			}
			if let Some(delay) = decoder.reconnect_delay() {
				*self.retry_hint.lock() = Some(delay.min(MAX_SERVER_RETRY));
			}
		}
	}
}

#[async_trait::async_trait]
impl ChatSource for FacebookSource {
	fn platform(&self) -> Platform {
		Platform::Facebook
	}

	async fn connect(&self, _cancel: &CancellationToken) -> Result<(), SourceError> {
		let video_id = self
			.config
			.live_video_id
			.as_deref()
			.map(str::trim)
			.filter(|v| !v.is_empty())
			.ok_or_else(|| SourceError::setup("facebook live_video_id is not configured"))?;
		let token = non_blank_secret(self.config.access_token.as_ref())
			.ok_or_else(|| SourceError::MissingCredentials("facebook access_token is not configured".to_string()))?;

		let url = self.stream_url(video_id, token)?;
		let mut req = self.client()?.get(url).header(ACCEPT, "text/event-stream");
		let resume = self.last_event_id.lock().clone();
		if let Some(id) = resume.as_deref() {
			req = req.header("Last-Event-ID", id);
		}

		let resp = tokio::time::timeout(self.config.connect_timeout, req.send())
			.await
			.context("facebook stream open timed out")?
			.context("facebook stream open")?;

		let status = resp.status();
		if !status.is_success() {
			let body = resp.text().await.unwrap_or_default();
			let detail = format!("status={status} body={}", snippet(&body));
			return Err(match status {
				StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::AuthenticationFailed(detail),
				_ => SourceError::setup(format!("facebook stream rejected: {detail}")),
			});
		}

		info!(platform = %Platform::Facebook, %video_id, resumed = resume.is_some(), "comment stream opened");
		*self.stream.lock().await = Some(resp);
		Ok(())
	}

	async fn disconnect(&self) {
		self.stream.lock().await.take();
	}

	async fn run_receive_loop(self: Arc<Self>, ctx: LoopContext) {
		loop {
			let resp = self.stream.lock().await.take();
			let exit = match resp {
				Some(resp) => self.pump(resp, &ctx).await,
				None => StreamExit::Lost("no open stream".to_string()),
			};

			match exit {
				StreamExit::Cancelled => return,
				StreamExit::Lost(reason) => {
					warn!(platform = %Platform::Facebook, %reason, "comment stream lost");
					let hint = *self.retry_hint.lock();
					if let Some(wait) = hint {
						debug!(wait_ms = wait.as_millis() as u64, "honoring server retry hint");
						if !ctx.sleep(wait).await {
							return;
						}
					}
					if ctx.reconnect(&*self).await.is_err() {
						return;
					}
				}
			}
		}
	}
}
