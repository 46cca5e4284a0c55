#![forbid(unsafe_code)]

use dashmap::DashSet;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Default bound on remembered identities.
pub const DEFAULT_DEDUP_CAPACITY: usize = 5_000;

/// Characters of message text folded into a synthesized identity.
pub const SYNTHETIC_TEXT_PREFIX_CHARS: usize = 48;

/// Bounded per-session set of message identities.
///
/// `insert` is an atomic test-and-set, so concurrent callers (a host callback
/// thread and the receive loop) never both accept the same identity. When the
/// bound is reached the whole set is dropped, which can let an old identity
/// through again. Concurrent inserters can overshoot the bound by at most one
/// entry each before the next clear.
#[derive(Debug)]
pub struct DedupCache {
	seen: DashSet<String>,
	capacity: usize,
	/// Inserts share it; the overflow clear takes it exclusively.
	overflow: RwLock<()>,
}

impl Default for DedupCache {
	fn default() -> Self {
		Self::new(DEFAULT_DEDUP_CAPACITY)
	}
}

impl DedupCache {
	pub fn new(capacity: usize) -> Self {
		Self {
			seen: DashSet::new(),
			capacity: capacity.max(1),
			overflow: RwLock::new(()),
		}
	}

	/// Returns `true` when `identity` was not seen before.
	pub fn insert(&self, identity: impl Into<String>) -> bool {
		let identity = identity.into();
		{
			let _shared = self.overflow.read();
			if !self.is_full_for(&identity) {
				return self.seen.insert(identity);
			}
		}

		let _exclusive = self.overflow.write();
		// another inserter may have cleared while we waited
		if self.is_full_for(&identity) {
			debug!(capacity = self.capacity, "dedup cache full; clearing");
			metrics::counter!("chatmux_dedup_overflow_total").increment(1);
			self.seen.clear();
		}
		self.seen.insert(identity)
	}

	fn is_full_for(&self, identity: &str) -> bool {
		self.seen.len() >= self.capacity && !self.seen.contains(identity)
	}

	pub fn contains(&self, identity: &str) -> bool {
		self.seen.contains(identity)
	}

	pub fn len(&self) -> usize {
		self.seen.len()
	}

	pub fn is_empty(&self) -> bool {
		self.seen.is_empty()
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn clear(&self) {
		self.seen.clear();
	}
}

/// Identity for providers that do not supply a message id.
///
/// Hash of the author and a fixed-length text prefix. Two distinct messages that
/// share both collapse into one, and an edited resend slips through.
pub fn synthesize_identity(author: &str, text: &str) -> String {
	let prefix: String = text.trim().chars().take(SYNTHETIC_TEXT_PREFIX_CHARS).collect();

	let mut hasher = Sha256::new();
	hasher.update(author.trim().as_bytes());
	hasher.update([0u8]);
	hasher.update(prefix.as_bytes());
	let digest = hasher.finalize();

	let hex: String = digest.iter().take(16).map(|b| format!("{b:02x}")).collect();
	format!("syn:{hex}")
}
