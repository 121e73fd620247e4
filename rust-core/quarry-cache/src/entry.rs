// SPDX-License-Identifier: PMPL-1.0-or-later
//! Cache entries.
//!
//! Each key owns exactly one [`Entry`]. The entry's mutex guards its payload
//! and usage counters; the cache map only ever holds an `Arc` to it, and the
//! entry never points back at the map.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A single keyed slot in a [`crate::GenericCache`].
pub(crate) struct Entry<T> {
    pub(crate) state: Mutex<EntryState<T>>,
}

/// Everything protected by the entry lock.
pub(crate) struct EntryState<T> {
    pub(crate) payload: T,
    /// Wall-clock time of the last real use, reported to callers.
    pub(crate) last_use: DateTime<Utc>,
    /// Cache-wide monotonic tick of the last use; orders eviction.
    pub(crate) recency: u64,
    pub(crate) use_count: u64,
    /// Set once the entry has left the map. Late arrivals holding an `Arc`
    /// must not treat it as live.
    pub(crate) removed: bool,
}

impl<T> Entry<T> {
    pub(crate) fn new(payload: T, tick: u64) -> Self {
        Self {
            state: Mutex::new(EntryState {
                payload,
                last_use: Utc::now(),
                recency: tick,
                use_count: 0,
                removed: false,
            }),
        }
    }
}

impl<T> EntryState<T> {
    /// Record a real use of the entry.
    pub(crate) fn touch(&mut self, tick: u64) {
        self.use_count += 1;
        self.refresh(tick);
    }

    /// Move the entry to the young end of the eviction order without
    /// counting a use (insert-or-amend).
    pub(crate) fn refresh(&mut self, tick: u64) {
        self.last_use = Utc::now();
        self.recency = tick;
    }

    pub(crate) fn stats(&self, key: &str) -> EntryStats {
        EntryStats {
            key: key.to_string(),
            use_count: self.use_count,
            last_use: self.last_use,
        }
    }
}

/// Usage information for one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStats {
    /// The entry's key.
    pub key: String,
    /// Number of times the entry was used via `use_entry`.
    pub use_count: u64,
    /// When the entry was last inserted, amended or used.
    pub last_use: DateTime<Utc>,
}
