#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiSlot {
	Private,
	Graph,
}

impl ApiSlot {
	pub const fn as_str(self) -> &'static str {
		match self {
			ApiSlot::Private => "private_api",
			ApiSlot::Graph => "graph_api",
		}
	}

	pub const fn other(self) -> Self {
		match self {
			ApiSlot::Private => ApiSlot::Graph,
			ApiSlot::Graph => ApiSlot::Private,
		}
	}
}

impl fmt::Display for ApiSlot {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// What the poll loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
	Use(ApiSlot),
	/// Every initialized API is cooling down.
	WaitUntil(Instant),
	/// Neither API was initialized.
	NoneAvailable,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotHealth {
	initialized: bool,
	failures: u32,
	disabled_until: Option<Instant>,
}

impl SlotHealth {
	fn usable(&self, now: Instant) -> bool {
		self.initialized && self.disabled_until.is_none_or(|t| now >= t)
	}
}

/// Alternates between the two APIs, benching one after repeated failures.
///
/// Slots are strictly interleaved while both are healthy. A benched slot is
/// skipped until its cooldown passes, so the healthy one takes every turn.
#[derive(Debug, Clone)]
pub struct FailoverScheduler {
	private: SlotHealth,
	graph: SlotHealth,
	next: ApiSlot,
	threshold: u32,
	cooldown: Duration,
}

impl FailoverScheduler {
	pub fn new(private_ready: bool, graph_ready: bool) -> Self {
		Self {
			private: SlotHealth {
				initialized: private_ready,
				..Default::default()
			},
			graph: SlotHealth {
				initialized: graph_ready,
				..Default::default()
			},
			next: ApiSlot::Private,
			threshold: DEFAULT_FAILURE_THRESHOLD,
			cooldown: DEFAULT_COOLDOWN,
		}
	}

	pub fn with_policy(mut self, threshold: u32, cooldown: Duration) -> Self {
		self.threshold = threshold.max(1);
		self.cooldown = cooldown;
		self
	}

	fn health(&self, slot: ApiSlot) -> &SlotHealth {
		match slot {
			ApiSlot::Private => &self.private,
			ApiSlot::Graph => &self.graph,
		}
	}

	fn health_mut(&mut self, slot: ApiSlot) -> &mut SlotHealth {
		match slot {
			ApiSlot::Private => &mut self.private,
			ApiSlot::Graph => &mut self.graph,
		}
	}

	pub fn is_usable(&self, slot: ApiSlot, now: Instant) -> bool {
		self.health(slot).usable(now)
	}

	pub fn disabled_until(&self, slot: ApiSlot) -> Option<Instant> {
		self.health(slot).disabled_until
	}

	pub fn pick(&mut self, now: Instant) -> Pick {
		let first = self.next;
		for slot in [first, first.other()] {
			if self.health(slot).usable(now) {
				self.next = slot.other();
				return Pick::Use(slot);
			}
		}

		[self.private, self.graph]
			.iter()
			.filter(|h| h.initialized)
			.filter_map(|h| h.disabled_until)
			.min()
			.map_or(Pick::NoneAvailable, Pick::WaitUntil)
	}

	pub fn record_success(&mut self, slot: ApiSlot) {
		let h = self.health_mut(slot);
		h.failures = 0;
		h.disabled_until = None;
	}

	/// Count a failure; returns `true` when this one benched the slot.
	pub fn record_failure(&mut self, slot: ApiSlot, now: Instant) -> bool {
		let threshold = self.threshold;
		let cooldown = self.cooldown;
		let h = self.health_mut(slot);
		h.failures += 1;
		if h.failures >= threshold {
			h.failures = 0;
			h.disabled_until = Some(now + cooldown);
			return true;
		}
		false
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn picks(s: &mut FailoverScheduler, now: Instant, n: usize) -> Vec<Pick> {
		(0..n).map(|_| s.pick(now)).collect()
	}

	#[test]
	fn healthy_apis_interleave() {
		let now = Instant::now();
		let mut s = FailoverScheduler::new(true, true);
		assert_eq!(
			picks(&mut s, now, 4),
			vec![
				Pick::Use(ApiSlot::Private),
				Pick::Use(ApiSlot::Graph),
				Pick::Use(ApiSlot::Private),
				Pick::Use(ApiSlot::Graph),
			]
		);
	}

	#[test]
	fn single_initialized_api_takes_every_turn() {
		let now = Instant::now();
		let mut s = FailoverScheduler::new(false, true);
		assert!(picks(&mut s, now, 3).iter().all(|p| *p == Pick::Use(ApiSlot::Graph)));
		assert_eq!(FailoverScheduler::new(false, false).pick(now), Pick::NoneAvailable);
	}

	#[test]
	fn three_failures_bench_for_cooldown() {
		let start = Instant::now();
		let mut s = FailoverScheduler::new(true, true);

		assert!(!s.record_failure(ApiSlot::Private, start));
		assert!(!s.record_failure(ApiSlot::Private, start));
		assert!(s.record_failure(ApiSlot::Private, start));

		let during = start + Duration::from_secs(299);
		assert!(picks(&mut s, during, 4).iter().all(|p| *p == Pick::Use(ApiSlot::Graph)));

		let after = start + Duration::from_secs(300);
		let resumed = picks(&mut s, after, 2);
		assert!(resumed.contains(&Pick::Use(ApiSlot::Private)));
		assert!(resumed.contains(&Pick::Use(ApiSlot::Graph)));
	}

	#[test]
	fn success_resets_failure_streak() {
		let now = Instant::now();
		let mut s = FailoverScheduler::new(true, true);
		s.record_failure(ApiSlot::Graph, now);
		s.record_failure(ApiSlot::Graph, now);
		s.record_success(ApiSlot::Graph);
		assert!(!s.record_failure(ApiSlot::Graph, now));
		assert!(s.is_usable(ApiSlot::Graph, now));
	}

	#[test]
	fn both_benched_waits_for_earliest_expiry() {
		let start = Instant::now();
		let mut s = FailoverScheduler::new(true, true).with_policy(1, Duration::from_secs(60));
		s.record_failure(ApiSlot::Private, start);
		s.record_failure(ApiSlot::Graph, start + Duration::from_secs(10));

		assert_eq!(s.pick(start + Duration::from_secs(20)), Pick::WaitUntil(start + Duration::from_secs(60)));
		assert_eq!(s.pick(start + Duration::from_secs(60)), Pick::Use(ApiSlot::Private));
	}
}
