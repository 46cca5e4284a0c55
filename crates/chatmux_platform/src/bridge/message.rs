#![forbid(unsafe_code)]

use chatmux_domain::{ChatMessage, MessageKind};
use serde::Deserialize;

use super::profile::ScrapeProfile;

/// Events posted by the in-page observer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
	Initialized {
		#[serde(default)]
		selector: Option<String>,
	},
	Comment {
		item: ScrapedItem,
	},
	Batch {
		items: Vec<ScrapedItem>,
	},
	Error {
		message: String,
	},
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScrapedItem {
	#[serde(default)]
	pub id: Option<String>,
	#[serde(default)]
	pub author: String,
	#[serde(default)]
	pub text: String,
	#[serde(default)]
	pub avatar: Option<String>,
	#[serde(default)]
	pub gift: bool,
	#[serde(default)]
	pub gift_name: Option<String>,
	#[serde(default)]
	pub gift_count: Option<u64>,
}

/// Some hosts hand over the posted string JSON-encoded a second time.
pub fn parse_bridge_message(raw: &str) -> serde_json::Result<BridgeMessage> {
	let raw = raw.trim();
	if raw.starts_with('"') {
		let inner: String = serde_json::from_str(raw)?;
		return serde_json::from_str(&inner);
	}
	serde_json::from_str(raw)
}

/// Map a scraped row. Rows without an author, and plain rows without text, are dropped.
pub fn message_from_item(profile: &ScrapeProfile, item: ScrapedItem) -> Option<(Option<String>, ChatMessage)> {
	let author = item.author.trim();
	if author.is_empty() {
		return None;
	}
	let text = item.text.trim();

	let mut msg = if item.gift && profile.classifies_gifts() {
		let name = item.gift_name.as_deref().map(str::trim).filter(|n| !n.is_empty());
		let text = match (text.is_empty(), name) {
			(false, _) => text.to_string(),
			(true, Some(name)) => format!("sent {name}"),
			(true, None) => String::new(),
		};
		let mut msg = ChatMessage::new(profile.platform, author, text).with_kind(MessageKind::Gift);
		if let Some(name) = name {
			msg = msg.with_metadata("gift_name", name);
		}
		if let Some(count) = item.gift_count {
			msg = msg.with_metadata("gift_count", count.to_string());
		}
		msg
	} else {
		if text.is_empty() {
			return None;
		}
		ChatMessage::new(profile.platform, author, text)
	};

	msg = msg
		.with_avatar_url(item.avatar.filter(|a| !a.trim().is_empty()))
		.with_metadata("source", "scraper");

	let id = item.id.as_deref().map(str::trim).filter(|id| !id.is_empty());
	if let Some(id) = id {
		msg = msg.with_metadata("message_id", id);
	}
	let identity = id.map(|id| format!("{}:{id}", profile.platform));
	Some((identity, msg))
}

#[cfg(test)]
mod tests {
	use chatmux_domain::Platform;

	use super::*;

	#[test]
	fn parses_every_event_shape() {
		assert_eq!(
			parse_bridge_message(r#"{"type":"initialized","selector":".row"}"#).unwrap(),
			BridgeMessage::Initialized {
				selector: Some(".row".into())
			}
		);
		let BridgeMessage::Batch { items } =
			parse_bridge_message(r#"{"type":"batch","items":[{"author":"a","text":"1"},{"author":"b","text":"2"}]}"#).unwrap()
		else {
			panic!("expected batch");
		};
		assert_eq!(items.len(), 2);
		assert!(matches!(
			parse_bridge_message(r#"{"type":"error","message":"boom"}"#).unwrap(),
			BridgeMessage::Error { .. }
		));
		assert!(parse_bridge_message(r#"{"type":"unknown"}"#).is_err());
		assert!(parse_bridge_message("not json").is_err());
	}

	#[test]
	fn accepts_double_encoded_payloads() {
		let raw = serde_json::to_string(r#"{"type":"comment","item":{"author":"a","text":"hi"}}"#).unwrap();
		let BridgeMessage::Comment { item } = parse_bridge_message(&raw).unwrap() else {
			panic!("expected comment");
		};
		assert_eq!(item.text, "hi");
	}

	#[test]
	fn tiktok_gift_rows_become_gifts() {
		let profile = ScrapeProfile::tiktok("host");
		let item = ScrapedItem {
			id: Some("g1".into()),
			author: " giver ".into(),
			gift: true,
			gift_name: Some("Rose".into()),
			gift_count: Some(5),
			..Default::default()
		};
		let (identity, msg) = message_from_item(&profile, item).unwrap();
		assert_eq!(identity.as_deref(), Some("tiktok:g1"));
		assert_eq!(msg.kind, MessageKind::Gift);
		assert_eq!(msg.username, "giver");
		assert_eq!(msg.text, "sent Rose");
		assert_eq!(msg.metadata("gift_count"), Some("5"));
	}

	#[test]
	fn instagram_ignores_gift_flag() {
		let profile = ScrapeProfile::instagram("host");
		let item = ScrapedItem {
			author: "fan".into(),
			text: "nice".into(),
			gift: true,
			..Default::default()
		};
		let (identity, msg) = message_from_item(&profile, item).unwrap();
		assert_eq!(identity, None);
		assert_eq!(msg.platform, Platform::Instagram);
		assert_eq!(msg.kind, MessageKind::Normal);
		assert_eq!(msg.metadata("source"), Some("scraper"));
	}

	#[test]
	fn drops_rows_missing_author_or_text() {
		let profile = ScrapeProfile::tiktok("host");
		let no_author = ScrapedItem {
			text: "orphan".into(),
			..Default::default()
		};
		let no_text = ScrapedItem {
			author: "quiet".into(),
			text: "   ".into(),
			..Default::default()
		};
		assert!(message_from_item(&profile, no_author).is_none());
		assert!(message_from_item(&profile, no_text).is_none());
	}
}
