#![forbid(unsafe_code)]

pub mod bridge;
pub mod bus;
pub mod dedup;
pub mod error;
pub mod facebook;
pub mod http;
pub mod instagram;
pub mod lifecycle;
pub mod quota;
pub mod twitch;
pub mod youtube;

use std::fmt;

pub use chatmux_domain::{Badges, ChatMessage, ConnectionState, MessageKind, Platform};
use uuid::Uuid;

pub use crate::bus::{BusHandler, BusItem, BusSubscription, FanoutBus};
pub use crate::error::SourceError;
pub use crate::lifecycle::{Adapter, AdapterNotice, ChatAdapter, ChatSource, LoopContext, ReconnectPolicy};
pub use crate::quota::{QuotaGovernor, QuotaTier, QuotaTierChange};

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Generate an opaque session id for log correlation.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

/// Take a filtered optional secret, treating blank values as absent.
pub fn non_blank_secret(secret: Option<&SecretString>) -> Option<&str> {
	secret.map(SecretString::expose).map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_string_is_redacted() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(serde_json::to_string(&s).unwrap(), "\"\"");
		assert_eq!(s.expose(), "hunter2");
	}

	#[test]
	fn blank_secrets_are_absent() {
		let blank = SecretString::new("   ");
		let real = SecretString::new(" tok ");
		assert!(blank.is_blank());
		assert_eq!(non_blank_secret(Some(&blank)), None);
		assert_eq!(non_blank_secret(Some(&real)), Some("tok"));
		assert_eq!(non_blank_secret(None), None);
	}
}
