#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported chat platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
	YouTube,
	Twitch,
	TikTok,
	Instagram,
	Facebook,
}

impl Platform {
	pub const ALL: [Platform; 5] = [
		Platform::YouTube,
		Platform::Twitch,
		Platform::TikTok,
		Platform::Instagram,
		Platform::Facebook,
	];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::YouTube => "youtube",
			Platform::Twitch => "twitch",
			Platform::TikTok => "tiktok",
			Platform::Instagram => "instagram",
			Platform::Facebook => "facebook",
		}
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
	#[error("unknown connection state: {0}")]
	UnknownState(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"youtube" | "you_tube" | "yt" => Ok(Platform::YouTube),
			"twitch" => Ok(Platform::Twitch),
			"tiktok" | "tik_tok" => Ok(Platform::TikTok),
			"instagram" | "ig" => Ok(Platform::Instagram),
			"facebook" | "fb" => Ok(Platform::Facebook),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

/// Kind of chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	#[default]
	Normal,
	/// Superchat, super sticker, bits.
	PaidMessage,
	Gift,
	/// Subscription or channel membership.
	Membership,
}

impl MessageKind {
	/// Whether the event carries user-authored text.
	pub const fn requires_text(self) -> bool {
		matches!(self, MessageKind::Normal | MessageKind::PaidMessage)
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			MessageKind::Normal => "normal",
			MessageKind::PaidMessage => "paid_message",
			MessageKind::Gift => "gift",
			MessageKind::Membership => "membership",
		}
	}
}

/// Author badges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Badges {
	pub is_moderator: bool,
	pub is_owner: bool,
	pub is_subscriber: bool,
	pub is_verified: bool,
}

/// Errors returned by [`ChatMessage::validate`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
	#[error("username must be non-empty")]
	EmptyUsername,
	#[error("{0:?} message text must be non-empty")]
	EmptyText(MessageKind),
}

/// Normalized chat event shared by every adapter.
///
/// Values are never mutated after construction; they cross the bus behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub platform: Platform,

	/// Stable identity key.
	pub username: String,

	pub display_name: String,

	pub text: String,

	#[serde(default)]
	pub avatar_url: Option<String>,

	pub kind: MessageKind,

	/// Provider time when available, receipt time otherwise.
	pub timestamp: DateTime<Utc>,

	#[serde(default)]
	pub donation_amount: Option<f64>,

	#[serde(default)]
	pub donation_currency: Option<String>,

	#[serde(default)]
	pub badges: Badges,

	/// Adapter provenance (comment id, source api, emotes). Missing keys mean "unknown".
	#[serde(default)]
	pub metadata: BTreeMap<String, String>,
}

impl ChatMessage {
	/// Construct a normal text message stamped with the current time.
	pub fn new(platform: Platform, username: impl Into<String>, text: impl Into<String>) -> Self {
		let username = username.into();
		Self {
			platform,
			display_name: username.clone(),
			username,
			text: text.into(),
			avatar_url: None,
			kind: MessageKind::Normal,
			timestamp: Utc::now(),
			donation_amount: None,
			donation_currency: None,
			badges: Badges::default(),
			metadata: BTreeMap::new(),
		}
	}

	pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
		let display_name = display_name.into();
		if !display_name.trim().is_empty() {
			self.display_name = display_name;
		}
		self
	}

	pub fn with_kind(mut self, kind: MessageKind) -> Self {
		self.kind = kind;
		self
	}

	pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
		self.timestamp = timestamp;
		self
	}

	pub fn with_avatar_url(mut self, url: Option<String>) -> Self {
		self.avatar_url = url.filter(|u| !u.trim().is_empty());
		self
	}

	pub fn with_donation(mut self, amount: f64, currency: impl Into<String>) -> Self {
		self.donation_amount = Some(amount);
		self.donation_currency = Some(currency.into());
		self
	}

	pub fn with_badges(mut self, badges: Badges) -> Self {
		self.badges = badges;
		self
	}

	pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.metadata.insert(key.into(), value.into());
		self
	}

	pub fn metadata(&self, key: &str) -> Option<&str> {
		self.metadata.get(key).map(String::as_str)
	}

	/// Check the structural invariants of a normalized message.
	pub fn validate(&self) -> Result<(), MessageError> {
		if self.username.trim().is_empty() {
			return Err(MessageError::EmptyUsername);
		}
		if self.kind.requires_text() && self.text.trim().is_empty() {
			return Err(MessageError::EmptyText(self.kind));
		}
		Ok(())
	}
}

/// Connection lifecycle of a single adapter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
	#[default]
	Disconnected,
	Connecting,
	Connected,
	Reconnecting,
	Error,
}

impl ConnectionState {
	pub const fn as_str(self) -> &'static str {
		match self {
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Connected => "connected",
			ConnectionState::Reconnecting => "reconnecting",
			ConnectionState::Error => "error",
		}
	}

	/// A receive loop is alive or a connect is in flight.
	pub const fn is_active(self) -> bool {
		matches!(
			self,
			ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
		)
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ConnectionState {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		match s.to_ascii_lowercase().as_str() {
			"disconnected" => Ok(ConnectionState::Disconnected),
			"connecting" => Ok(ConnectionState::Connecting),
			"connected" => Ok(ConnectionState::Connected),
			"reconnecting" => Ok(ConnectionState::Reconnecting),
			"error" => Ok(ConnectionState::Error),
			other => Err(ParseIdError::UnknownState(other.to_string())),
		}
	}
}
