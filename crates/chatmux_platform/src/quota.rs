#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Default daily budget of a YouTube Data API key.
pub const DEFAULT_DAILY_LIMIT: u64 = 10_000;

/// Fixed per-call costs of the billed endpoints.
pub mod cost {
	pub const VIDEOS_LIST: u64 = 1;
	pub const LIVE_CHAT_MESSAGES_LIST: u64 = 5;
	pub const SEARCH_LIST: u64 = 100;
}

/// Usage band derived from `used / limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QuotaTier {
	Normal = 0,
	Warning = 1,
	Critical = 2,
	Exhausted = 3,
}

impl QuotaTier {
	pub fn from_usage(used: u64, limit: u64) -> Self {
		if limit == 0 {
			return QuotaTier::Exhausted;
		}
		let used = used as u128 * 100;
		let limit = limit as u128;
		if used >= limit * 100 {
			QuotaTier::Exhausted
		} else if used >= limit * 95 {
			QuotaTier::Critical
		} else if used >= limit * 80 {
			QuotaTier::Warning
		} else {
			QuotaTier::Normal
		}
	}

	/// Lower bound on the polling interval while in this tier.
	pub const fn poll_floor(self) -> Duration {
		match self {
			QuotaTier::Normal => Duration::ZERO,
			QuotaTier::Warning => Duration::from_secs(8),
			QuotaTier::Critical => Duration::from_secs(20),
			QuotaTier::Exhausted => Duration::from_secs(300),
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			QuotaTier::Normal => "normal",
			QuotaTier::Warning => "warning",
			QuotaTier::Critical => "critical",
			QuotaTier::Exhausted => "exhausted",
		}
	}

	fn from_u8(v: u8) -> Self {
		match v {
			0 => QuotaTier::Normal,
			1 => QuotaTier::Warning,
			2 => QuotaTier::Critical,
			_ => QuotaTier::Exhausted,
		}
	}
}

impl fmt::Display for QuotaTier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One-shot notification fired when usage crosses a tier boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaTierChange {
	pub old: QuotaTier,
	pub new: QuotaTier,
	pub used: u64,
	pub limit: u64,
}

/// Point-in-time view of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
	pub used: u64,
	pub limit: u64,
	pub tier: QuotaTier,
}

pub type QuotaClock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Shared cost ledger for one API key.
///
/// Constructed once per process and handed to every adapter that bills against
/// the key. Pacing is advisory: callers consult [`QuotaGovernor::can_call`] and
/// provider rate-limit responses remain authoritative.
pub struct QuotaGovernor {
	limit: u64,
	used: AtomicU64,
	day: AtomicI32,
	tier: AtomicU8,
	clock: QuotaClock,
	changes: broadcast::Sender<QuotaTierChange>,
}

impl fmt::Debug for QuotaGovernor {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("QuotaGovernor")
			.field("limit", &self.limit)
			.field("used", &self.used.load(Ordering::Relaxed))
			.field("tier", &self.current_tier())
			.finish()
	}
}

impl QuotaGovernor {
	pub fn new(limit: u64) -> Self {
		Self::with_clock(limit, Arc::new(Utc::now))
	}

	pub fn with_clock(limit: u64, clock: QuotaClock) -> Self {
		let (changes, _rx) = broadcast::channel(64);
		let day = day_number(clock());
		Self {
			limit,
			used: AtomicU64::new(0),
			day: AtomicI32::new(day),
			tier: AtomicU8::new(QuotaTier::from_usage(0, limit) as u8),
			clock,
			changes,
		}
	}

	/// Subscribe to tier-change notifications.
	pub fn subscribe(&self) -> broadcast::Receiver<QuotaTierChange> {
		self.changes.subscribe()
	}

	pub fn limit(&self) -> u64 {
		self.limit
	}

	pub fn used(&self) -> u64 {
		self.maybe_reset();
		self.used.load(Ordering::Acquire)
	}

	pub fn tier(&self) -> QuotaTier {
		self.maybe_reset();
		self.current_tier()
	}

	/// `false` only once the budget is exhausted.
	pub fn can_call(&self) -> bool {
		self.tier() != QuotaTier::Exhausted
	}

	/// Record a billed call of `cost` units and return the resulting tier.
	pub fn record(&self, cost: u64) -> QuotaTier {
		self.maybe_reset();
		let used = self.used.fetch_add(cost, Ordering::AcqRel).saturating_add(cost);
		metrics::counter!("chatmux_quota_units_total").increment(cost);
		metrics::gauge!("chatmux_quota_used_units").set(used as f64);
		self.update_tier();
		QuotaTier::from_usage(used, self.limit)
	}

	/// The provider reported the key as exhausted; align the ledger with it.
	pub fn mark_exhausted(&self) {
		self.maybe_reset();
		let prev = self.used.fetch_max(self.limit, Ordering::AcqRel);
		if prev < self.limit {
			warn!(used = prev, limit = self.limit, "quota: provider reported exhaustion early");
		}
		self.update_tier();
	}

	pub fn snapshot(&self) -> QuotaSnapshot {
		self.maybe_reset();
		let used = self.used.load(Ordering::Acquire);
		QuotaSnapshot {
			used,
			limit: self.limit,
			tier: QuotaTier::from_usage(used, self.limit),
		}
	}

	fn current_tier(&self) -> QuotaTier {
		QuotaTier::from_usage(self.used.load(Ordering::Acquire), self.limit)
	}

	fn maybe_reset(&self) {
		let today = day_number((self.clock)());
		let prev = self.day.load(Ordering::Acquire);
		if today == prev {
			return;
		}
		if self
			.day
			.compare_exchange(prev, today, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
		{
			let prior = self.used.swap(0, Ordering::AcqRel);
			info!(prior_used = prior, limit = self.limit, "quota: daily reset");
			metrics::gauge!("chatmux_quota_used_units").set(0.0);
			self.update_tier();
		}
	}

	/// Move the last notified tier to match the ledger, notifying on change.
	/// Each attempt re-reads `used`; readers never consult the stored tier.
	fn update_tier(&self) {
		let mut stored = self.tier.load(Ordering::SeqCst);
		loop {
			let used = self.used.load(Ordering::SeqCst);
			let new = QuotaTier::from_usage(used, self.limit);
			if stored == new as u8 {
				return;
			}
			match self
				.tier
				.compare_exchange(stored, new as u8, Ordering::SeqCst, Ordering::SeqCst)
			{
				Ok(prev) => {
					self.notify(QuotaTier::from_u8(prev), new, used);
					return;
				}
				Err(actual) => stored = actual,
			}
		}
	}

	fn notify(&self, old: QuotaTier, new: QuotaTier, used: u64) {
		if new > old {
			warn!(%old, %new, used, limit = self.limit, "quota: tier changed");
		} else {
			info!(%old, %new, used, limit = self.limit, "quota: tier changed");
		}
		metrics::counter!("chatmux_quota_tier_changes_total").increment(1);
		let _ = self.changes.send(QuotaTierChange {
			old,
			new,
			used,
			limit: self.limit,
		});
	}
}

fn day_number(now: DateTime<Utc>) -> i32 {
	now.date_naive().num_days_from_ce()
}
