#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use chatmux_domain::{ChatMessage, Platform};
use serde::Deserialize;
use url::Url;

use super::private_api::{check_status, string_or_number};
use crate::SecretString;
use crate::facebook::parse_created_time;
use crate::http::{build_client, send_with_retry};

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.facebook.com/v19.0";

#[derive(Debug, Deserialize)]
struct DataList<T> {
	#[serde(default = "Vec::new")]
	data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct LiveMedia {
	#[serde(default, deserialize_with = "string_or_number")]
	id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GraphComment {
	#[serde(default, deserialize_with = "string_or_number")]
	pub id: Option<String>,
	#[serde(default)]
	pub text: String,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub timestamp: Option<String>,
}

/// Token client for the Instagram Graph API.
#[derive(Debug, Clone)]
pub struct GraphApiClient {
	base_url: String,
	access_token: SecretString,
	client: reqwest::Client,
}

impl GraphApiClient {
	pub fn new(base_url: impl Into<String>, access_token: SecretString, request_timeout: Duration) -> anyhow::Result<Self> {
		Ok(Self {
			base_url: base_url.into(),
			access_token,
			client: build_client(request_timeout)?,
		})
	}

	fn url(&self, path: &str, fields: &str) -> anyhow::Result<Url> {
		let mut url = Url::parse(&format!("{}/{}", self.base_url.trim_end_matches('/'), path))
			.with_context(|| format!("graph url for {path}"))?;
		url.query_pairs_mut()
			.append_pair("fields", fields)
			.append_pair("access_token", self.access_token.expose().trim());
		Ok(url)
	}

	/// Id of the user's current live media, if broadcasting.
	pub async fn live_media(&self, ig_user_id: &str) -> anyhow::Result<Option<String>> {
		let url = self.url(&format!("{ig_user_id}/live_media"), "id")?;
		let resp = check_status(
			send_with_retry(self.client.get(url), "instagram live_media").await?,
			"instagram live_media",
		)
		.await?;
		let list: DataList<LiveMedia> = resp.json().await.context("instagram live_media decode")?;
		Ok(list.data.into_iter().find_map(|m| m.id))
	}

	pub async fn comments(&self, media_id: &str) -> anyhow::Result<Vec<GraphComment>> {
		let url = self.url(&format!("{media_id}/comments"), "id,text,username,timestamp")?;
		let resp = check_status(
			send_with_retry(self.client.get(url), "instagram comments").await?,
			"instagram comments",
		)
		.await?;
		let list: DataList<GraphComment> = resp.json().await.context("instagram comments decode")?;
		Ok(list.data)
	}
}

pub fn message_from_graph_comment(comment: &GraphComment) -> Option<(String, ChatMessage)> {
	let id = comment.id.as_deref()?;
	let username = comment.username.as_deref().map(str::trim).filter(|u| !u.is_empty())?;

	let mut msg = ChatMessage::new(Platform::Instagram, username, comment.text.as_str())
		.with_metadata("source", "graph_api")
		.with_metadata("comment_id", id);
	if let Some(ts) = comment.timestamp.as_deref().and_then(parse_created_time) {
		msg = msg.with_timestamp(ts);
	}
	Some((format!("instagram:{id}"), msg))
}
