#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::debug;
use url::Url;

use crate::SecretString;
use crate::http::{build_client, retry_delay_from_headers, snippet};

pub const DEFAULT_YOUTUBE_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// Classified YouTube Data API failure.
#[derive(Debug, thiserror::Error)]
pub enum YouTubeApiError {
	#[error("youtube quota exceeded")]
	QuotaExceeded,

	#[error("youtube rate limited")]
	RateLimited { retry_after: Option<Duration> },

	#[error("youtube live chat ended")]
	ChatEnded,

	#[error("youtube resource not found: {0}")]
	NotFound(String),

	#[error("youtube rejected credentials: {0}")]
	Auth(String),

	#[error(transparent)]
	Transport(#[from] anyhow::Error),
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
	error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
	#[serde(default)]
	message: String,
	#[serde(default)]
	errors: Vec<ErrorReason>,
}

#[derive(Debug, Deserialize)]
struct ErrorReason {
	#[serde(default)]
	reason: String,
}

/// Map a non-2xx response onto [`YouTubeApiError`].
pub fn classify_error(status: StatusCode, headers: &HeaderMap, body: &str, label: &str) -> YouTubeApiError {
	let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
	let message = parsed
		.as_ref()
		.map(|e| e.error.message.clone())
		.filter(|m| !m.is_empty())
		.unwrap_or_else(|| snippet(body));
	let has = |wanted: &[&str]| {
		parsed
			.as_ref()
			.is_some_and(|e| e.error.errors.iter().any(|r| wanted.contains(&r.reason.as_str())))
	};

	if has(&["quotaExceeded", "dailyLimitExceeded"]) {
		return YouTubeApiError::QuotaExceeded;
	}
	if status == StatusCode::TOO_MANY_REQUESTS || has(&["rateLimitExceeded", "userRateLimitExceeded"]) {
		return YouTubeApiError::RateLimited {
			retry_after: retry_delay_from_headers(headers),
		};
	}
	if has(&["liveChatEnded", "liveChatDisabled"]) {
		return YouTubeApiError::ChatEnded;
	}
	if status == StatusCode::NOT_FOUND || has(&["liveChatNotFound", "videoNotFound"]) {
		return YouTubeApiError::NotFound(message);
	}
	if status == StatusCode::UNAUTHORIZED || has(&["keyInvalid", "keyExpired", "accessNotConfigured", "forbidden"]) {
		return YouTubeApiError::Auth(message);
	}
	YouTubeApiError::Transport(anyhow!("youtube {label} failed: status={status} body={message}"))
}

/// Accepts `"1000000"` as well as `1000000`.
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
	D: Deserializer<'de>,
{
	let value = Option::<serde_json::Value>::deserialize(deserializer)?;
	Ok(match value {
		Some(serde_json::Value::Number(n)) => n.as_u64(),
		Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
		_ => None,
	})
}

/// Malformed chat items are dropped one by one; the rest of the page survives.
fn lenient_items<'de, D>(deserializer: D) -> Result<Vec<LiveChatItem>, D::Error>
where
	D: Deserializer<'de>,
{
	let raw = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
	Ok(raw
		.into_iter()
		.filter_map(|value| match serde_json::from_value::<LiveChatItem>(value) {
			Ok(item) => Some(item),
			Err(e) => {
				debug!(error = %e, "youtube: skipping malformed live chat item");
				metrics::counter!("chatmux_youtube_skipped_items_total").increment(1);
				None
			}
		})
		.collect())
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
	#[serde(default)]
	items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
	#[serde(default)]
	live_streaming_details: Option<LiveStreamingDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStreamingDetails {
	#[serde(default)]
	pub active_live_chat_id: Option<String>,
	#[serde(default)]
	pub actual_start_time: Option<DateTime<Utc>>,
	#[serde(default)]
	pub actual_end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SearchListResponse {
	#[serde(default)]
	items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
	id: SearchItemId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
	#[serde(default)]
	video_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatPage {
	#[serde(default)]
	pub next_page_token: Option<String>,
	#[serde(default)]
	pub polling_interval_millis: Option<u64>,
	#[serde(default)]
	pub offline_at: Option<DateTime<Utc>>,
	#[serde(default, deserialize_with = "lenient_items")]
	pub items: Vec<LiveChatItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatItem {
	pub id: String,
	pub snippet: LiveChatSnippet,
	#[serde(default)]
	pub author_details: Option<AuthorDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveChatSnippet {
	#[serde(rename = "type", default)]
	pub kind: String,
	#[serde(default)]
	pub published_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub display_message: Option<String>,
	#[serde(default)]
	pub text_message_details: Option<TextMessageDetails>,
	#[serde(default)]
	pub super_chat_details: Option<SuperChatDetails>,
	#[serde(default)]
	pub super_sticker_details: Option<SuperStickerDetails>,
	#[serde(default)]
	pub new_sponsor_details: Option<MembershipDetails>,
	#[serde(default)]
	pub member_milestone_chat_details: Option<MemberMilestoneDetails>,
	#[serde(default)]
	pub membership_gifting_details: Option<MembershipGiftingDetails>,
	#[serde(default)]
	pub gift_membership_received_details: Option<MembershipDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextMessageDetails {
	#[serde(default)]
	pub message_text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperChatDetails {
	#[serde(default, deserialize_with = "lenient_u64")]
	pub amount_micros: Option<u64>,
	#[serde(default)]
	pub currency: Option<String>,
	#[serde(default)]
	pub amount_display_string: Option<String>,
	#[serde(default)]
	pub user_comment: Option<String>,
	#[serde(default)]
	pub tier: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperStickerDetails {
	#[serde(default, deserialize_with = "lenient_u64")]
	pub amount_micros: Option<u64>,
	#[serde(default)]
	pub currency: Option<String>,
	#[serde(default)]
	pub amount_display_string: Option<String>,
	#[serde(default)]
	pub super_sticker_metadata: Option<SuperStickerMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuperStickerMetadata {
	#[serde(default)]
	pub alt_text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipDetails {
	#[serde(default)]
	pub member_level_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberMilestoneDetails {
	#[serde(default)]
	pub member_level_name: Option<String>,
	#[serde(default)]
	pub member_month: Option<u32>,
	#[serde(default)]
	pub user_comment: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipGiftingDetails {
	#[serde(default)]
	pub gift_memberships_count: Option<u32>,
	#[serde(default)]
	pub gift_memberships_level_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorDetails {
	#[serde(default)]
	pub channel_id: String,
	#[serde(default)]
	pub display_name: String,
	#[serde(default)]
	pub profile_image_url: Option<String>,
	#[serde(default)]
	pub is_verified: bool,
	#[serde(default)]
	pub is_chat_owner: bool,
	#[serde(default)]
	pub is_chat_sponsor: bool,
	#[serde(default)]
	pub is_chat_moderator: bool,
}

/// Thin YouTube Data API v3 client. Callers account for quota.
#[derive(Debug, Clone)]
pub struct YouTubeClient {
	base_url: String,
	api_key: SecretString,
	client: reqwest::Client,
}

impl YouTubeClient {
	pub fn new(base_url: impl Into<String>, api_key: SecretString, request_timeout: Duration) -> anyhow::Result<Self> {
		Ok(Self {
			base_url: base_url.into(),
			api_key,
			client: build_client(request_timeout)?,
		})
	}

	fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> anyhow::Result<Url> {
		let mut url = Url::parse(&format!("{}/{}", self.base_url.trim_end_matches('/'), path))
			.with_context(|| format!("youtube url for {path}"))?;
		{
			let mut query = url.query_pairs_mut();
			for (k, v) in params {
				query.append_pair(k, v);
			}
			query.append_pair("key", self.api_key.expose().trim());
		}
		Ok(url)
	}

	async fn get_json<T: DeserializeOwned>(&self, url: Url, label: &'static str) -> Result<T, YouTubeApiError> {
		let resp = self
			.client
			.get(url)
			.send()
			.await
			.with_context(|| format!("youtube {label} send"))?;

		let status = resp.status();
		if status.is_success() {
			let parsed = resp
				.json::<T>()
				.await
				.with_context(|| format!("youtube {label} decode"))?;
			return Ok(parsed);
		}

		let headers = resp.headers().clone();
		let body = resp.text().await.unwrap_or_default();
		Err(classify_error(status, &headers, &body, label))
	}

	/// `videos.list?part=liveStreamingDetails`; `None` when the video is unknown.
	pub async fn video_live_details(&self, video_id: &str) -> Result<Option<LiveStreamingDetails>, YouTubeApiError> {
		let url = self.endpoint("videos", &[("part", "liveStreamingDetails"), ("id", video_id)])?;
		let resp: VideoListResponse = self.get_json(url, "videos.list").await?;
		Ok(resp.items.into_iter().next().map(|v| v.live_streaming_details.unwrap_or_default()))
	}

	/// `search.list` for the channel's current live broadcast.
	pub async fn search_live_video(&self, channel_id: &str) -> Result<Option<String>, YouTubeApiError> {
		let url = self.endpoint(
			"search",
			&[
				("part", "id"),
				("channelId", channel_id),
				("eventType", "live"),
				("type", "video"),
				("maxResults", "1"),
			],
		)?;
		let resp: SearchListResponse = self.get_json(url, "search.list").await?;
		Ok(resp.items.into_iter().find_map(|i| i.id.video_id).filter(|v| !v.is_empty()))
	}

	/// `liveChat/messages?part=snippet,authorDetails`.
	pub async fn live_chat_messages(
		&self,
		live_chat_id: &str,
		page_token: Option<&str>,
	) -> Result<LiveChatPage, YouTubeApiError> {
		let mut params = vec![("liveChatId", live_chat_id), ("part", "snippet,authorDetails")];
		if let Some(token) = page_token {
			params.push(("pageToken", token));
		}
		let url = self.endpoint("liveChat/messages", &params)?;
		self.get_json(url, "liveChatMessages.list").await
	}
}
