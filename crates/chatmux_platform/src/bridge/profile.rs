#![forbid(unsafe_code)]

use std::time::Duration;

use chatmux_domain::Platform;
use serde::Serialize;

/// Page-specific scraping rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapeProfile {
	#[serde(skip)]
	pub platform: Platform,
	#[serde(skip)]
	pub page_url: String,
	/// Tried first; the fallbacks are tried in order only when it matches nothing.
	pub item_selector: String,
	pub fallback_selectors: Vec<String>,
	pub author_selectors: Vec<String>,
	pub text_selectors: Vec<String>,
	pub avatar_selector: Option<String>,
	/// Rows matching this are reported as gifts.
	pub gift_selector: Option<String>,
	pub gift_name_selector: Option<String>,
	pub gift_count_selector: Option<String>,
	pub rescan_interval_ms: u64,
	pub seen_limit: usize,
}

fn strings(items: &[&str]) -> Vec<String> {
	items.iter().map(|s| s.to_string()).collect()
}

impl ScrapeProfile {
	pub fn tiktok(user: &str) -> Self {
		let user = user.trim().trim_start_matches('@');
		Self {
			platform: Platform::TikTok,
			page_url: format!("https://www.tiktok.com/@{user}/live"),
			item_selector: r#"[data-e2e="chat-message"]"#.to_string(),
			fallback_selectors: strings(&[
				r#"[class*="DivChatMessage"]"#,
				".webcast-chatroom-messages-list > div",
				r#"[class*="ChatMessageItem"]"#,
			]),
			author_selectors: strings(&[r#"[data-e2e="message-owner-name"]"#, r#"[class*="SpanNickName"]"#]),
			text_selectors: strings(&[r#"[class*="DivComment"]"#, r#"[class*="ChatMessageContent"]"#]),
			avatar_selector: Some("img".to_string()),
			gift_selector: Some(r#"[data-e2e="gift-message"], [class*="GiftMessage"]"#.to_string()),
			gift_name_selector: Some(r#"[class*="GiftName"]"#.to_string()),
			gift_count_selector: Some(r#"[class*="GiftCount"], [class*="RepeatCount"]"#.to_string()),
			rescan_interval_ms: 3_000,
			seen_limit: 5_000,
		}
	}

	pub fn instagram(user: &str) -> Self {
		let user = user.trim().trim_start_matches('@');
		Self {
			platform: Platform::Instagram,
			page_url: format!("https://www.instagram.com/{user}/live/"),
			item_selector: r#"[data-testid="live-comment"]"#.to_string(),
			fallback_selectors: strings(&[r#"div[role="listitem"]"#, r#"section ul > div > div"#]),
			author_selectors: strings(&["h2", "h3", r#"a[role="link"] span"#, "span > a"]),
			text_selectors: strings(&[r#"span[dir="auto"]"#, "span"]),
			avatar_selector: Some("img".to_string()),
			gift_selector: None,
			gift_name_selector: None,
			gift_count_selector: None,
			rescan_interval_ms: 3_000,
			seen_limit: 5_000,
		}
	}

	pub fn classifies_gifts(&self) -> bool {
		self.gift_selector.is_some()
	}

	pub fn rescan_interval(&self) -> Duration {
		Duration::from_millis(self.rescan_interval_ms)
	}
}
