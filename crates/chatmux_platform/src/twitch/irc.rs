#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chatmux_domain::{Badges, ChatMessage, MessageKind, Platform};
use chrono::{DateTime, Utc};

/// One parsed IRC line: `[@tags] [:prefix] COMMAND [params] [:trailing]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcMessage {
	pub tags: BTreeMap<String, String>,
	pub prefix: Option<String>,
	pub command: String,
	pub params: Vec<String>,
	pub trailing: Option<String>,
}

impl IrcMessage {
	pub fn parse(line: &str) -> Option<Self> {
		let mut rest = line.trim_end_matches(['\r', '\n']);
		let mut tags = BTreeMap::new();

		if let Some(stripped) = rest.strip_prefix('@') {
			let (raw_tags, after) = stripped.split_once(' ')?;
			tags = parse_tags(raw_tags);
			rest = after.trim_start();
		}

		let mut prefix = None;
		if let Some(stripped) = rest.strip_prefix(':') {
			let (p, after) = stripped.split_once(' ')?;
			prefix = Some(p.to_string());
			rest = after.trim_start();
		}

		let (command, after) = match rest.split_once(' ') {
			Some((c, a)) => (c, a),
			None => (rest, ""),
		};
		if command.is_empty() {
			return None;
		}

		let (middle, trailing) = if let Some(t) = after.strip_prefix(':') {
			("", Some(t.to_string()))
		} else if let Some(idx) = after.find(" :") {
			(&after[..idx], Some(after[idx + 2..].to_string()))
		} else {
			(after, None)
		};

		Some(Self {
			tags,
			prefix,
			command: command.to_ascii_uppercase(),
			params: middle.split_whitespace().map(str::to_string).collect(),
			trailing,
		})
	}

	pub fn tag(&self, key: &str) -> Option<&str> {
		self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
	}

	/// Nick portion of `nick!user@host`.
	pub fn nick(&self) -> Option<&str> {
		let prefix = self.prefix.as_deref()?;
		let nick = prefix.split('!').next().unwrap_or(prefix);
		if nick.is_empty() || nick.contains('.') { None } else { Some(nick) }
	}

	pub fn channel(&self) -> Option<&str> {
		self.params.first().map(|c| c.trim_start_matches('#'))
	}
}

/// Parse `k=v;k2=v2` with IRCv3 value unescaping.
pub fn parse_tags(raw: &str) -> BTreeMap<String, String> {
	raw.split(';')
		.filter(|kv| !kv.is_empty())
		.map(|kv| match kv.split_once('=') {
			Some((k, v)) => (k.to_string(), unescape_tag_value(v)),
			None => (kv.to_string(), String::new()),
		})
		.collect()
}

pub fn unescape_tag_value(v: &str) -> String {
	let mut out = String::with_capacity(v.len());
	let mut chars = v.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('\\') => out.push('\\'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			None => {}
		}
	}
	out
}

/// Badge names from `broadcaster/1,subscriber/12`.
pub fn badge_names(raw: &str) -> impl Iterator<Item = &str> {
	raw.split(',').filter_map(|b| b.split('/').next()).filter(|b| !b.is_empty())
}

fn badges_from_tags(msg: &IrcMessage) -> Badges {
	let mut badges = Badges::default();
	if let Some(raw) = msg.tag("badges") {
		for name in badge_names(raw) {
			match name {
				"broadcaster" => badges.is_owner = true,
				"moderator" => badges.is_moderator = true,
				"subscriber" | "founder" => badges.is_subscriber = true,
				"partner" => badges.is_verified = true,
				_ => {}
			}
		}
	}
	if msg.tag("mod") == Some("1") {
		badges.is_moderator = true;
	}
	if msg.tag("subscriber") == Some("1") {
		badges.is_subscriber = true;
	}
	badges
}

fn sent_at(msg: &IrcMessage) -> DateTime<Utc> {
	msg.tag("tmi-sent-ts")
		.and_then(|ts| ts.parse::<i64>().ok())
		.and_then(DateTime::from_timestamp_millis)
		.unwrap_or_else(Utc::now)
}

fn base_message(msg: &IrcMessage, login: &str, text: String) -> ChatMessage {
	let mut out = ChatMessage::new(Platform::Twitch, login, text)
		.with_display_name(msg.tag("display-name").unwrap_or(login))
		.with_timestamp(sent_at(msg))
		.with_badges(badges_from_tags(msg));

	for (tag, key) in [
		("id", "message_id"),
		("user-id", "user_id"),
		("color", "color"),
		("emotes", "emotes"),
		("badges", "badges"),
	] {
		if let Some(v) = msg.tag(tag) {
			out = out.with_metadata(key, v);
		}
	}
	if let Some(channel) = msg.channel() {
		out = out.with_metadata("channel", channel);
	}
	out
}

/// Normalize a `PRIVMSG`. Returns `None` for lines without an author or body.
pub fn chat_message_from_privmsg(msg: &IrcMessage) -> Option<ChatMessage> {
	let login = msg.nick()?.to_ascii_lowercase();
	let body = msg.trailing.as_deref()?;

	let (text, is_action) = match body.strip_prefix("\u{1}ACTION ") {
		Some(action) => (action.trim_end_matches('\u{1}'), true),
		None => (body, false),
	};

	let mut out = base_message(msg, &login, text.to_string());
	if is_action {
		out = out.with_metadata("action", "true");
	}

	if let Some(bits) = msg.tag("bits").and_then(|b| b.parse::<u64>().ok())
		&& bits > 0
	{
		out = out
			.with_kind(MessageKind::PaidMessage)
			.with_donation(bits as f64, "BITS");
	}

	Some(out)
}

/// Normalize subscription and gift `USERNOTICE`s; other notice kinds yield `None`.
pub fn chat_message_from_usernotice(msg: &IrcMessage) -> Option<ChatMessage> {
	let msg_id = msg.tag("msg-id")?;
	let kind = match msg_id {
		"sub" | "resub" | "primepaidupgrade" => MessageKind::Membership,
		"subgift" | "submysterygift" | "giftpaidupgrade" | "anongiftpaidupgrade" => MessageKind::Gift,
		_ => return None,
	};

	let login = msg.tag("login").map(str::to_ascii_lowercase)?;
	let text = msg
		.trailing
		.clone()
		.filter(|t| !t.trim().is_empty())
		.or_else(|| msg.tag("system-msg").map(str::to_string))
		.unwrap_or_default();

	let mut out = base_message(msg, &login, text).with_kind(kind).with_metadata("notice", msg_id);
	if let Some(system) = msg.tag("system-msg") {
		out = out.with_metadata("system_message", system);
	}
	for (tag, key) in [
		("msg-param-cumulative-months", "months"),
		("msg-param-sub-plan", "sub_plan"),
		("msg-param-mass-gift-count", "gift_count"),
		("msg-param-recipient-user-name", "recipient"),
	] {
		if let Some(v) = msg.tag(tag) {
			out = out.with_metadata(key, v);
		}
	}
	Some(out)
}

/// Server notices that mean the credentials were rejected.
pub fn is_auth_failure_notice(text: &str) -> bool {
	let t = text.to_ascii_lowercase();
	t.contains("login authentication failed")
		|| t.contains("login unsuccessful")
		|| t.contains("improperly formatted auth")
		|| t.contains("invalid nick")
}
