// SPDX-License-Identifier: PMPL-1.0-or-later
//! Quarry Cache
//!
//! A generic, bounded, named-entry cache shared by every Quarry subsystem that
//! keeps per-key state in memory: prepared plans, request logs, sequence
//! caches and transaction contexts.
//!
//! - [`cache`] -- [`GenericCache`], the keyed store with insert-or-amend,
//!   per-entry locking and approximate LRU eviction.
//! - [`entry`] -- the per-key entry and its usage bookkeeping.
//!
//! # Example
//!
//! ```rust
//! use quarry_cache::{AddOutcome, ConflictAction, GenericCache};
//!
//! let cache: GenericCache<String> = GenericCache::new(2);
//! assert_eq!(cache.add_or_replace("a", "one".to_string()), AddOutcome::Inserted);
//!
//! // Keep the existing payload when the key is already taken.
//! let outcome = cache.add("a", "two".to_string(), |_| ConflictAction::Ignore);
//! assert_eq!(outcome, AddOutcome::Ignored);
//! assert_eq!(cache.get("a").as_deref(), Some("one"));
//! ```

pub mod cache;
pub mod entry;

pub use cache::{AddOutcome, ConflictAction, GenericCache};
pub use entry::EntryStats;
