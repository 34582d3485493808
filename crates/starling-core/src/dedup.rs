//! Message dedup tracker.
//!
//! Remembers message ids for a retention window chosen by the connection
//! that first delivered them. A flood that comes back around a cycle hits
//! a remembered id and is dropped, which is what terminates broadcasts in a
//! meshed topology.
//!
//! Expired entries stop suppressing immediately (the deadline is checked on
//! every lookup) and are physically removed by [`DedupTracker::prune`], which
//! the node calls from a periodic sweeper.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::id::MessageId;

/// Tracks recently seen message ids.
#[derive(Debug, Default)]
pub struct DedupTracker {
    seen: DashMap<MessageId, Instant>,
    tracked: AtomicU64,
    suppressed: AtomicU64,
}

/// Dedup counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    /// Ids recorded as first sightings
    pub tracked: u64,
    /// Deliveries dropped as duplicates
    pub suppressed: u64,
    /// Entries currently held
    pub live: usize,
}

impl DedupTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery of `id`.
    ///
    /// Returns `true` for the first delivery within the retention window
    /// and `false` for a duplicate.
    pub fn observe(&self, id: MessageId, retention: Duration) -> bool {
        let now = Instant::now();
        let deadline = now + retention;

        let first = match self.seen.entry(id) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    false
                } else {
                    entry.insert(deadline);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(deadline);
                true
            }
        };

        if first {
            self.tracked.fetch_add(1, Ordering::Relaxed);
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Suppressed duplicate message {}", id);
        }
        first
    }

    /// Whether `id` is currently remembered.
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen
            .get(id)
            .is_some_and(|deadline| *deadline > Instant::now())
    }

    /// Drop expired entries, returning how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.seen.len();
        self.seen.retain(|_, deadline| *deadline > now);
        let removed = before.saturating_sub(self.seen.len());
        if removed > 0 {
            tracing::trace!("Pruned {} expired dedup entries", removed);
        }
        removed
    }

    /// Number of entries held, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the tracker holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            tracked: self.tracked.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            live: self.seen.len(),
        }
    }
}
