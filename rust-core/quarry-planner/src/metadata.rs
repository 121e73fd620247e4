// SPDX-License-Identifier: PMPL-1.0-or-later
//! Cluster metadata seam.
//!
//! Plans are validated against live metadata through [`MetadataStore`]. The
//! distributed catalog implements it in production; [`InMemoryMetadata`] is
//! the in-process reference used by single-node setups and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

/// Read access to the metadata plans depend on.
pub trait MetadataStore: Send + Sync {
    /// Global counter bumped on every index or schema change.
    fn change_counter(&self) -> u64;

    /// Current version of `keyspace`, or `None` if it does not exist.
    fn keyspace_version(&self, keyspace: &str) -> Option<u64>;

    /// Whether `index` on `keyspace` exists and is online.
    fn index_online(&self, keyspace: &str, index: &str) -> bool;
}

#[derive(Debug, Default)]
struct KeyspaceMeta {
    version: u64,
    /// Index name → online.
    indexes: HashMap<String, bool>,
}

/// In-memory [`MetadataStore`].
///
/// Every mutation bumps the global counter. Mutations scoped to a keyspace
/// also bump that keyspace's version.
#[derive(Debug, Default)]
pub struct InMemoryMetadata {
    counter: AtomicU64,
    keyspaces: RwLock<HashMap<String, KeyspaceMeta>>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_keyspace(&self, keyspace: &str) {
        let version = self.bump();
        self.keyspaces
            .write()
            .entry(keyspace.to_string())
            .or_default()
            .version = version;
        debug!(keyspace, version, "keyspace created");
    }

    pub fn drop_keyspace(&self, keyspace: &str) {
        self.bump();
        self.keyspaces.write().remove(keyspace);
    }

    /// Create an online index. Creates the keyspace if needed.
    pub fn create_index(&self, keyspace: &str, index: &str) {
        self.update_keyspace(keyspace, |meta| {
            meta.indexes.insert(index.to_string(), true);
        });
    }

    pub fn drop_index(&self, keyspace: &str, index: &str) {
        self.update_keyspace(keyspace, |meta| {
            meta.indexes.remove(index);
        });
    }

    pub fn set_index_online(&self, keyspace: &str, index: &str, online: bool) {
        self.update_keyspace(keyspace, |meta| {
            if let Some(state) = meta.indexes.get_mut(index) {
                *state = online;
            }
        });
    }

    /// Bump the global counter without touching any keyspace, e.g. for a
    /// feature-control change.
    pub fn touch(&self) -> u64 {
        self.bump()
    }

    fn update_keyspace<F>(&self, keyspace: &str, f: F)
    where
        F: FnOnce(&mut KeyspaceMeta),
    {
        let version = self.bump();
        let mut keyspaces = self.keyspaces.write();
        let meta = keyspaces.entry(keyspace.to_string()).or_default();
        f(meta);
        meta.version = version;
    }

    fn bump(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl MetadataStore for InMemoryMetadata {
    fn change_counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    fn keyspace_version(&self, keyspace: &str) -> Option<u64> {
        self.keyspaces.read().get(keyspace).map(|meta| meta.version)
    }

    fn index_online(&self, keyspace: &str, index: &str) -> bool {
        self.keyspaces
            .read()
            .get(keyspace)
            .and_then(|meta| meta.indexes.get(index).copied())
            .unwrap_or(false)
    }
}
