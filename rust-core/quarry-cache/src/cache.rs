// SPDX-License-Identifier: PMPL-1.0-or-later
//! The generic named-entry cache.
//!
//! [`GenericCache`] maps string keys to payloads with two levels of locking:
//!
//! - a coarse `RwLock` over the key→entry map, held only while the map itself
//!   changes (insert, delete, eviction) or while a key snapshot is taken;
//! - a per-entry `Mutex` guarding the payload and usage counters.
//!
//! Operations on different keys therefore never wait on each other. Blocking
//! lock acquisitions always go entry→map; the map→entry direction only ever
//! uses `try_lock` (eviction), so the two levels cannot deadlock.
//!
//! Eviction is approximate LRU: when an insert pushes the size over the
//! limit, the entry with the oldest recency tick is dropped. Entries whose
//! lock is currently held are treated as pinned and skipped. Ties cannot
//! occur with the tick clock, but the order between two uses racing on
//! different threads is arbitrary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::entry::{Entry, EntryStats};

/// What to do when `add` finds the key already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    /// Retain the existing payload, including any in-place amendment the
    /// conflict closure made to it.
    Keep,
    /// Swap in the new payload.
    Replace,
    /// Leave the entry untouched.
    Ignore,
}

/// Result of [`GenericCache::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The key was absent and a new entry was created.
    Inserted,
    /// The key was present and its entry was kept or replaced.
    Amended,
    /// The key was present and the conflict closure declined the change.
    Ignored,
}

/// A bounded, concurrent, named-entry cache.
///
/// A `limit` of zero disables bounding.
pub struct GenericCache<T> {
    entries: RwLock<HashMap<String, Arc<Entry<T>>>>,
    limit: AtomicUsize,
    /// Monotonic clock ordering uses for eviction.
    clock: AtomicU64,
    evictions: AtomicU64,
}

impl<T> GenericCache<T> {
    /// Create an empty cache holding at most `limit` entries.
    pub fn new(limit: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            limit: AtomicUsize::new(limit),
            clock: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Insert `payload` under `key`, or resolve a conflict with the existing
    /// entry through `on_conflict`.
    ///
    /// `on_conflict` runs holding only the existing entry's lock. An insert
    /// may trigger eviction of other entries; the new entry itself is never
    /// the victim of its own insert.
    pub fn add<F>(&self, key: &str, mut payload: T, mut on_conflict: F) -> AddOutcome
    where
        F: FnOnce(&mut T) -> ConflictAction,
    {
        loop {
            let entry = match self.lookup(key) {
                Some(entry) => entry,
                None => {
                    let mut entries = self.entries.write();
                    if let Some(entry) = entries.get(key).cloned() {
                        entry
                    } else {
                        entries.insert(key.to_string(), Arc::new(Entry::new(payload, self.tick())));
                        self.evict_locked(&mut entries, Some(key));
                        return AddOutcome::Inserted;
                    }
                }
            };

            // The entry may have been deleted between lookup and lock; retry
            // against whatever the map holds now.
            match self.amend(&entry, payload, on_conflict) {
                Ok(outcome) => return outcome,
                Err((returned, callback)) => {
                    payload = returned;
                    on_conflict = callback;
                }
            }
        }
    }

    /// Insert or replace unconditionally.
    pub fn add_or_replace(&self, key: &str, payload: T) -> AddOutcome {
        self.add(key, payload, |_| ConflictAction::Replace)
    }

    /// Run `f` with exclusive access to the payload stored under `key`.
    ///
    /// Only this key is locked while `f` runs. `f` must not call back into the
    /// cache for the same key.
    pub fn get_with<R, F>(&self, key: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        let entry = self.lookup(key)?;
        let mut state = entry.state.lock();
        if state.removed {
            return None;
        }
        Some(f(&mut state.payload))
    }

    /// Passive lookup: returns a copy of the payload without counting a use.
    pub fn get(&self, key: &str) -> Option<T>
    where
        T: Clone,
    {
        self.get_with(key, |payload| payload.clone())
    }

    /// Lookup that counts as real reuse: bumps the use count and moves the
    /// entry to the young end of the eviction order.
    pub fn use_entry(&self, key: &str) -> Option<T>
    where
        T: Clone,
    {
        let entry = self.lookup(key)?;
        let mut state = entry.state.lock();
        if state.removed {
            return None;
        }
        let tick = self.tick();
        state.touch(tick);
        Some(state.payload.clone())
    }

    /// Usage counters for `key`.
    pub fn stats(&self, key: &str) -> Option<EntryStats> {
        let entry = self.lookup(key)?;
        let state = entry.state.lock();
        if state.removed {
            return None;
        }
        Some(state.stats(key))
    }

    /// Remove `key`. Returns `true` if an entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        self.remove_if(key, |_| true)
    }

    /// Remove `key`, running `before_delete` on the payload while the entry is
    /// still locked.
    pub fn delete_with<F>(&self, key: &str, before_delete: F) -> bool
    where
        F: FnOnce(&T),
    {
        self.remove_if(key, |payload| {
            before_delete(payload);
            true
        })
    }

    /// Remove `key` only if `predicate` holds for its current payload.
    pub fn delete_with_check<F>(&self, key: &str, predicate: F) -> bool
    where
        F: FnOnce(&T) -> bool,
    {
        self.remove_if(key, predicate)
    }

    /// Visit every entry present when iteration starts.
    ///
    /// The key snapshot is taken under the map lock, which is then released;
    /// each entry is locked only while it is visited. Entries removed in the
    /// meantime are skipped. Returning `false` from `visitor` stops early.
    pub fn for_each<V>(&self, visitor: V)
    where
        V: FnMut(&str, &T) -> bool,
    {
        self.for_each_then(visitor, || ());
    }

    /// Like [`for_each`](Self::for_each), then run `barrier` once after the
    /// last visit (also when the visitor stopped early).
    pub fn for_each_then<V, B>(&self, mut visitor: V, barrier: B)
    where
        V: FnMut(&str, &T) -> bool,
        B: FnOnce(),
    {
        let snapshot: Vec<(String, Arc<Entry<T>>)> = self
            .entries
            .read()
            .iter()
            .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
            .collect();

        for (key, entry) in snapshot {
            let state = entry.state.lock();
            if state.removed {
                continue;
            }
            if !visitor(&key, &state.payload) {
                break;
            }
        }

        barrier();
    }

    /// All keys currently cached, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of entries.
    pub fn size(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Configured capacity; zero means unbounded.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    /// Change the capacity. Shrinking evicts down to the new limit at once.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
        let mut entries = self.entries.write();
        self.evict_locked(&mut entries, None);
    }

    /// Total entries evicted for capacity since creation.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lookup(&self, key: &str) -> Option<Arc<Entry<T>>> {
        self.entries.read().get(key).cloned()
    }

    /// Resolve an insert conflict on an existing entry. Hands the payload and
    /// callback back if the entry turned out to be removed.
    fn amend<F>(&self, entry: &Entry<T>, payload: T, on_conflict: F) -> Result<AddOutcome, (T, F)>
    where
        F: FnOnce(&mut T) -> ConflictAction,
    {
        let mut state = entry.state.lock();
        if state.removed {
            return Err((payload, on_conflict));
        }

        match on_conflict(&mut state.payload) {
            ConflictAction::Keep => {
                let tick = self.tick();
                state.refresh(tick);
                Ok(AddOutcome::Amended)
            }
            ConflictAction::Replace => {
                state.payload = payload;
                let tick = self.tick();
                state.refresh(tick);
                Ok(AddOutcome::Amended)
            }
            ConflictAction::Ignore => Ok(AddOutcome::Ignored),
        }
    }

    fn remove_if<F>(&self, key: &str, predicate: F) -> bool
    where
        F: FnOnce(&T) -> bool,
    {
        let Some(entry) = self.lookup(key) else {
            return false;
        };

        let mut state = entry.state.lock();
        if state.removed || !predicate(&state.payload) {
            return false;
        }

        let mut entries = self.entries.write();
        if entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &entry))
        {
            entries.remove(key);
        }
        state.removed = true;
        true
    }

    /// Evict oldest entries until the map fits the limit. Caller holds the
    /// map write lock.
    fn evict_locked(&self, entries: &mut HashMap<String, Arc<Entry<T>>>, keep: Option<&str>) {
        let limit = self.limit.load(Ordering::Relaxed);
        if limit == 0 {
            return;
        }

        while entries.len() > limit {
            let victim = entries
                .iter()
                .filter(|(key, _)| Some(key.as_str()) != keep)
                .filter_map(|(key, entry)| entry.state.try_lock().map(|state| (state.recency, key)))
                .min_by_key(|(recency, _)| *recency)
                .map(|(_, key)| key.clone());

            let Some(victim) = victim else {
                debug!(size = entries.len(), limit, "every eviction candidate is pinned");
                break;
            };

            if let Some(entry) = entries.get(&victim) {
                match entry.state.try_lock() {
                    Some(mut state) => state.removed = true,
                    // Pinned since the scan; pick again.
                    None => continue,
                }
            }

            entries.remove(&victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %victim, "evicted cache entry");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
