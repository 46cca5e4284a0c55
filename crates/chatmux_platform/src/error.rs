#![forbid(unsafe_code)]

use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by a chat source.
///
/// Only `connect` and `start` return these to callers; receive loops record them
/// through the adapter state instead.
#[derive(Debug, Error)]
pub enum SourceError {
	#[error("operation cancelled")]
	Cancelled,

	#[error("missing credentials: {0}")]
	MissingCredentials(String),

	#[error("no active live session: {0}")]
	NoActiveSession(String),

	#[error("setup failed: {0}")]
	Setup(String),

	#[error("authentication failed: {0}")]
	AuthenticationFailed(String),

	#[error("daily quota exhausted")]
	QuotaExhausted,

	#[error("rate limited (retry after {retry_after:?})")]
	RateLimited { retry_after: Option<Duration> },

	#[error("reconnect failed after {attempts} attempts: {last}")]
	ReconnectExhausted { attempts: u32, last: String },

	#[error("transport error: {0:#}")]
	Transport(#[from] anyhow::Error),
}

impl SourceError {
	pub fn setup(detail: impl Into<String>) -> Self {
		Self::Setup(detail.into())
	}
}
