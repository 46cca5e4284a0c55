#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};

/// User agent sent by the HTTP-based adapters.
pub const USER_AGENT: &str = concat!("chatmux/", env!("CARGO_PKG_VERSION"));

/// Longest server-requested pause honored inline before giving the error back.
const MAX_INLINE_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Build a client with a per-request timeout.
pub fn build_client(request_timeout: Duration) -> anyhow::Result<reqwest::Client> {
	reqwest::Client::builder()
		.user_agent(USER_AGENT)
		.connect_timeout(request_timeout.min(Duration::from_secs(10)))
		.timeout(request_timeout)
		.build()
		.context("build http client")
}

/// Build a client for long-lived streaming responses (no total timeout).
pub fn build_streaming_client(connect_timeout: Duration) -> anyhow::Result<reqwest::Client> {
	reqwest::Client::builder()
		.user_agent(USER_AGENT)
		.connect_timeout(connect_timeout)
		.build()
		.context("build streaming http client")
}

/// Server-requested delay from `Retry-After` or `Ratelimit-Reset`.
pub fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

/// Send once, retrying a single time on 5xx or a short 429 pause.
pub async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("{label} send"))?;
	let status = resp.status();

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& delay <= MAX_INLINE_RETRY_DELAY
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(delay).await;
		let retry_resp = retry.send().await.with_context(|| format!("{label} retry send"))?;
		return Ok(retry_resp);
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		let retry_resp = retry.send().await.with_context(|| format!("{label} retry send"))?;
		return Ok(retry_resp);
	}

	Ok(resp)
}

/// Truncate a response body for log and error messages.
pub fn snippet(body: &str) -> String {
	const MAX: usize = 300;
	if body.len() <= MAX {
		return body.to_string();
	}
	let mut end = MAX;
	while !body.is_char_boundary(end) {
		end -= 1;
	}
	format!("{}…", &body[..end])
}

#[cfg(test)]
mod tests {
	use reqwest::header::HeaderValue;

	use super::*;

	#[test]
	fn retry_after_seconds() {
		let mut headers = HeaderMap::new();
		headers.insert(RETRY_AFTER, HeaderValue::from_static(" 7 "));
		assert_eq!(retry_delay_from_headers(&headers), Some(Duration::from_secs(7)));
	}

	#[test]
	fn ratelimit_reset_in_future() {
		let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
		let mut headers = HeaderMap::new();
		headers.insert(
			"Ratelimit-Reset",
			HeaderValue::from_str(&(now + 30).to_string()).unwrap(),
		);
		let delay = retry_delay_from_headers(&headers).unwrap();
		assert!(delay <= Duration::from_secs(30) && delay >= Duration::from_secs(28));
	}

	#[test]
	fn missing_or_past_headers_yield_none() {
		let mut headers = HeaderMap::new();
		assert_eq!(retry_delay_from_headers(&headers), None);
		headers.insert("Ratelimit-Reset", HeaderValue::from_static("1"));
		assert_eq!(retry_delay_from_headers(&headers), None);
	}

	#[test]
	fn snippet_truncates_on_char_boundary() {
		let body = "ü".repeat(400);
		let s = snippet(&body);
		assert!(s.ends_with('…'));
		assert!(s.len() <= 300 + '…'.len_utf8());
		assert_eq!(snippet("short"), "short");
	}
}
