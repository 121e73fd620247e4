// SPDX-License-Identifier: PMPL-1.0-or-later
//! Durable plan stores.
//!
//! While plan stability is on, every explicitly prepared (and, in ad-hoc
//! mode, every implicitly cached) plan is mirrored into a [`PlanStore`] so it
//! survives restarts. The store holds encoded plans keyed by cache key.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{PersistError, PreparedError};
use crate::stability::StabilityMode;

/// A plan as held by a durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPlan {
    pub key: String,
    pub encoded: String,
    pub mode: StabilityMode,
}

/// Visitor over persisted plans; return `false` to stop.
pub type PersistedVisitor<'a> = dyn FnMut(PersistedPlan) -> bool + Send + 'a;

/// Durable storage for encoded plans.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &str;

    /// Whether this store can back plan stability at all.
    fn supports_stability(&self) -> bool;

    /// Insert or overwrite the durable copy of `key`.
    async fn persist(&self, key: &str, encoded: &str, mode: StabilityMode) -> Result<(), PersistError>;

    /// Remove the durable copy of `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), PersistError>;

    /// Visit every persisted plan in key order.
    async fn for_each_persisted(&self, visitor: &mut PersistedVisitor<'_>) -> Result<(), PersistError>;
}

// ---------------------------------------------------------------------------
// Disabled store
// ---------------------------------------------------------------------------

/// Store for deployments without plan stability. Never holds anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledPlanStore;

#[async_trait]
impl PlanStore for DisabledPlanStore {
    fn name(&self) -> &str {
        "disabled"
    }

    fn supports_stability(&self) -> bool {
        false
    }

    async fn persist(&self, _key: &str, _encoded: &str, _mode: StabilityMode) -> Result<(), PersistError> {
        Err(PersistError::Unsupported(self.name().to_string()))
    }

    async fn delete(&self, _key: &str) -> Result<(), PersistError> {
        Ok(())
    }

    async fn for_each_persisted(&self, _visitor: &mut PersistedVisitor<'_>) -> Result<(), PersistError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store. Survives cache rebuilds but not restarts.
#[derive(Debug, Default)]
pub struct MemoryPlanStore {
    plans: RwLock<BTreeMap<String, PersistedPlan>>,
}

impl MemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.plans.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.plans.read().await.is_empty()
    }

    pub async fn get(&self, key: &str) -> Option<PersistedPlan> {
        self.plans.read().await.get(key).cloned()
    }
}

#[async_trait]
impl PlanStore for MemoryPlanStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn supports_stability(&self) -> bool {
        true
    }

    async fn persist(&self, key: &str, encoded: &str, mode: StabilityMode) -> Result<(), PersistError> {
        let plan = PersistedPlan {
            key: key.to_string(),
            encoded: encoded.to_string(),
            mode,
        };
        self.plans.write().await.insert(key.to_string(), plan);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PersistError> {
        self.plans.write().await.remove(key);
        Ok(())
    }

    async fn for_each_persisted(&self, visitor: &mut PersistedVisitor<'_>) -> Result<(), PersistError> {
        let snapshot: Vec<PersistedPlan> = self.plans.read().await.values().cloned().collect();
        for plan in snapshot {
            if !visitor(plan) {
                break;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Which plan store to open at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanStoreKind {
    #[default]
    Disabled,
    Memory,
    /// redb file at `path`. Requires the `redb-backend` feature.
    Redb { path: PathBuf },
}

/// Open the store selected by `kind`.
pub fn open_plan_store(kind: &PlanStoreKind) -> Result<Arc<dyn PlanStore>, PreparedError> {
    match kind {
        PlanStoreKind::Disabled => Ok(Arc::new(DisabledPlanStore)),
        PlanStoreKind::Memory => Ok(Arc::new(MemoryPlanStore::new())),
        #[cfg(feature = "redb-backend")]
        PlanStoreKind::Redb { path } => Ok(Arc::new(crate::redb_store::RedbPlanStore::open(path)?)),
        #[cfg(not(feature = "redb-backend"))]
        PlanStoreKind::Redb { path } => Err(PreparedError::InvalidConfig(format!(
            "redb plan store at {} requires the redb-backend feature",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_store_rejects_persist() {
        let store = DisabledPlanStore;
        assert!(!store.supports_stability());
        assert!(matches!(
            store.persist("p1", "{}", StabilityMode::PreparedOnly).await,
            Err(PersistError::Unsupported(_))
        ));
        assert!(store.delete("p1").await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_store_crud() {
        let store = MemoryPlanStore::new();
        store.persist("b", "B", StabilityMode::AdHoc).await.unwrap();
        store.persist("a", "A", StabilityMode::PreparedOnly).await.unwrap();
        store.persist("a", "A2", StabilityMode::PreparedOnly).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert_eq!(store.get("a").await.unwrap().encoded, "A2");

        let mut keys = Vec::new();
        store
            .for_each_persisted(&mut |plan: PersistedPlan| {
                keys.push(plan.key);
                true
            })
            .await
            .unwrap();
        assert_eq!(keys, vec!["a", "b"]);

        store.delete("a").await.unwrap();
        store.delete("missing").await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_for_each_stops_early() {
        let store = MemoryPlanStore::new();
        for key in ["a", "b", "c"] {
            store.persist(key, key, StabilityMode::PreparedOnly).await.unwrap();
        }
        let mut visited = 0;
        store
            .for_each_persisted(&mut |_| {
                visited += 1;
                false
            })
            .await
            .unwrap();
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_open_plan_store() {
        let store = open_plan_store(&PlanStoreKind::Memory).unwrap();
        assert_eq!(store.name(), "memory");
        assert!(store.supports_stability());

        let store = open_plan_store(&PlanStoreKind::default()).unwrap();
        assert_eq!(store.name(), "disabled");
    }

    #[cfg(not(feature = "redb-backend"))]
    #[test]
    fn test_redb_kind_without_feature() {
        let kind = PlanStoreKind::Redb {
            path: PathBuf::from("/tmp/plans.redb"),
        };
        assert!(matches!(open_plan_store(&kind), Err(PreparedError::InvalidConfig(_))));
    }

    #[test]
    fn test_kind_serde() {
        let kind: PlanStoreKind = serde_json::from_str(r#"{"kind":"redb","path":"/var/lib/quarry/plans.redb"}"#).unwrap();
        assert_eq!(
            kind,
            PlanStoreKind::Redb {
                path: PathBuf::from("/var/lib/quarry/plans.redb")
            }
        );
    }
}
