#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use chatmux_domain::{ChatMessage, Platform};
use chrono::DateTime;
use reqwest::StatusCode;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue};
use serde::{Deserialize, Deserializer};

use crate::SecretString;
use crate::http::{build_client, send_with_retry, snippet};

pub const DEFAULT_PRIVATE_BASE_URL: &str = "https://i.instagram.com/api/v1";
pub const DEFAULT_APP_ID: &str = "936619743392459";

/// Instagram refused the session or token.
#[derive(Debug, thiserror::Error)]
#[error("instagram rejected credentials: {0}")]
pub struct AuthRejected(pub String);

/// Ids arrive as JSON strings or numbers depending on the endpoint.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
	D: Deserializer<'de>,
{
	let value = Option::<serde_json::Value>::deserialize(deserializer)?;
	Ok(match value {
		Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
		Some(serde_json::Value::Number(n)) => Some(n.to_string()),
		_ => None,
	})
}

pub(crate) async fn check_status(resp: reqwest::Response, label: &str) -> anyhow::Result<reqwest::Response> {
	let status = resp.status();
	if status.is_success() {
		return Ok(resp);
	}
	let body = resp.text().await.unwrap_or_default();
	let detail = format!("{label} failed: status={status} body={}", snippet(&body));
	match status {
		StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(anyhow::Error::new(AuthRejected(detail))),
		_ => Err(anyhow!(detail)),
	}
}

#[derive(Debug, Deserialize)]
struct WebInfoResponse {
	#[serde(default, deserialize_with = "string_or_number")]
	broadcast_id: Option<String>,
	#[serde(default)]
	broadcast_status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrivateCommentsPage {
	#[serde(default)]
	pub comments: Vec<PrivateComment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrivateComment {
	#[serde(default, deserialize_with = "string_or_number")]
	pub pk: Option<String>,
	#[serde(default)]
	pub text: String,
	#[serde(default)]
	pub created_at: Option<i64>,
	#[serde(default)]
	pub user: Option<PrivateUser>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrivateUser {
	#[serde(default, deserialize_with = "string_or_number")]
	pub pk: Option<String>,
	#[serde(default)]
	pub username: String,
	#[serde(default)]
	pub full_name: Option<String>,
	#[serde(default)]
	pub profile_pic_url: Option<String>,
	#[serde(default)]
	pub is_verified: bool,
}

/// Session-cookie client for the web API.
#[derive(Debug, Clone)]
pub struct PrivateApiClient {
	base_url: String,
	headers: HeaderMap,
	client: reqwest::Client,
}

impl PrivateApiClient {
	pub fn new(
		base_url: impl Into<String>,
		session_id: &SecretString,
		csrf_token: &SecretString,
		app_id: &str,
		request_timeout: Duration,
	) -> anyhow::Result<Self> {
		let mut headers = HeaderMap::new();
		let cookie = format!(
			"sessionid={}; csrftoken={}",
			session_id.expose().trim(),
			csrf_token.expose().trim()
		);
		let mut cookie = HeaderValue::from_str(&cookie).context("instagram session cookie")?;
		cookie.set_sensitive(true);
		headers.insert(COOKIE, cookie);
		headers.insert(
			"x-csrftoken",
			HeaderValue::from_str(csrf_token.expose().trim()).context("instagram csrf header")?,
		);
		headers.insert("x-ig-app-id", HeaderValue::from_str(app_id).context("instagram app id header")?);

		Ok(Self {
			base_url: base_url.into(),
			headers,
			client: build_client(request_timeout)?,
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
	}

	/// Active broadcast of `target_user_id`, if any.
	pub async fn active_broadcast(&self, target_user_id: &str) -> anyhow::Result<Option<String>> {
		let url = format!(
			"{}?target_user_id={}",
			self.url("live/web_info/"),
			urlencoding::encode(target_user_id)
		);
		let req = self.client.get(url).headers(self.headers.clone());
		let resp = check_status(send_with_retry(req, "instagram web_info").await?, "instagram web_info").await?;
		let info: WebInfoResponse = resp.json().await.context("instagram web_info decode")?;

		let ended = info
			.broadcast_status
			.as_deref()
			.is_some_and(|s| matches!(s, "stopped" | "hard_stop" | "interrupted"));
		Ok(info.broadcast_id.filter(|_| !ended))
	}

	/// Comments newer than `last_comment_ts` (unix seconds).
	pub async fn comments(&self, broadcast_id: &str, last_comment_ts: i64) -> anyhow::Result<PrivateCommentsPage> {
		let url = format!(
			"{}?last_comment_ts={}",
			self.url(&format!("live/{}/get_comment/", urlencoding::encode(broadcast_id))),
			last_comment_ts
		);
		let req = self.client.get(url).headers(self.headers.clone());
		let resp = check_status(send_with_retry(req, "instagram get_comment").await?, "instagram get_comment").await?;
		resp.json().await.context("instagram get_comment decode")
	}
}

pub fn message_from_private_comment(comment: &PrivateComment) -> Option<(String, ChatMessage)> {
	let id = comment.pk.as_deref()?;
	let user = comment.user.as_ref()?;
	if user.username.trim().is_empty() {
		return None;
	}

	let mut msg = ChatMessage::new(Platform::Instagram, user.username.as_str(), comment.text.as_str())
		.with_avatar_url(user.profile_pic_url.clone())
		.with_metadata("source", "private_api")
		.with_metadata("comment_id", id);
	if let Some(name) = user.full_name.as_deref() {
		msg = msg.with_display_name(name);
	}
	if user.is_verified {
		msg.badges.is_verified = true;
	}
	if let Some(ts) = comment.created_at.and_then(|s| DateTime::from_timestamp(s, 0)) {
		msg = msg.with_timestamp(ts);
	}
	Some((format!("instagram:{id}"), msg))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_comment_page_with_numeric_ids() {
		let page: PrivateCommentsPage = serde_json::from_str(
			r#"{"comments":[{"pk":17900000000000001,"text":"hello","created_at":1700000000,
			"user":{"pk":"42","username":"ig_user","full_name":"IG User","is_verified":true}}],"status":"ok"}"#,
		)
		.unwrap();
		let (identity, msg) = message_from_private_comment(&page.comments[0]).unwrap();
		assert_eq!(identity, "instagram:17900000000000001");
		assert_eq!(msg.username, "ig_user");
		assert_eq!(msg.display_name, "IG User");
		assert!(msg.badges.is_verified);
		assert_eq!(msg.metadata("source"), Some("private_api"));
		assert_eq!(msg.timestamp.timestamp(), 1_700_000_000);
	}

	#[test]
	fn comment_without_user_or_id_is_skipped() {
		let no_user: PrivateComment = serde_json::from_str(r#"{"pk":"1","text":"x"}"#).unwrap();
		let no_id: PrivateComment = serde_json::from_str(r#"{"text":"x","user":{"username":"u"}}"#).unwrap();
		assert!(message_from_private_comment(&no_user).is_none());
		assert!(message_from_private_comment(&no_id).is_none());
	}

	#[test]
	fn session_headers_are_set() {
		let client = PrivateApiClient::new(
			DEFAULT_PRIVATE_BASE_URL,
			&SecretString::new("sess"),
			&SecretString::new("csrf"),
			DEFAULT_APP_ID,
			Duration::from_secs(1),
		)
		.unwrap();
		assert_eq!(client.headers.get("X-CSRFToken").unwrap(), "csrf");
		assert!(client.headers.get(COOKIE).unwrap().is_sensitive());
		assert_eq!(client.url("/live/web_info/"), "https://i.instagram.com/api/v1/live/web_info/");
	}
}
