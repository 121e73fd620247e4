// SPDX-License-Identifier: PMPL-1.0-or-later
//
// redb-backed durable plan store.
//
// One table maps cache key → JSON `PersistedPlan`. redb (pure Rust, B-tree,
// ACID, single file) is blocking, so every operation runs on the blocking
// pool via `spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::{debug, warn};

use crate::error::PersistError;
use crate::persist::{PersistedPlan, PersistedVisitor, PlanStore};
use crate::stability::StabilityMode;

const PLANS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("prepared_plans");

/// Durable [`PlanStore`] in a single redb file.
pub struct RedbPlanStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbPlanStore {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(&path).map_err(|e| {
            PersistError::BackendUnavailable(format!("failed to open redb at {}: {}", path.display(), e))
        })?;

        debug!(path = %path.display(), "opened redb plan store");

        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_all(db: &Database) -> Result<Vec<PersistedPlan>, PersistError> {
        let txn = db
            .begin_read()
            .map_err(|e| PersistError::BackendUnavailable(format!("read txn: {e}")))?;
        let table = match txn.open_table(PLANS_TABLE) {
            Ok(t) => t,
            // Nothing written yet.
            Err(_) => return Ok(Vec::new()),
        };

        let iter = table
            .range(""..)
            .map_err(|e| PersistError::CorruptedData(format!("range scan: {e}")))?;

        let mut plans = Vec::new();
        for entry in iter {
            let (key, value) = entry.map_err(|e| PersistError::CorruptedData(format!("scan entry: {e}")))?;
            match serde_json::from_slice::<PersistedPlan>(value.value()) {
                Ok(plan) => plans.push(plan),
                Err(e) => warn!(key = key.value(), error = %e, "skipping unreadable plan record"),
            }
        }
        Ok(plans)
    }
}

impl std::fmt::Debug for RedbPlanStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbPlanStore").field("path", &self.path).finish()
    }
}

#[async_trait]
impl PlanStore for RedbPlanStore {
    fn name(&self) -> &str {
        "redb"
    }

    fn supports_stability(&self) -> bool {
        true
    }

    async fn persist(&self, key: &str, encoded: &str, mode: StabilityMode) -> Result<(), PersistError> {
        let db = Arc::clone(&self.db);
        let record = PersistedPlan {
            key: key.to_string(),
            encoded: encoded.to_string(),
            mode,
        };
        let value = serde_json::to_vec(&record)
            .map_err(|e| PersistError::CorruptedData(format!("plan record: {e}")))?;

        tokio::task::spawn_blocking(move || -> Result<(), PersistError> {
            let txn = db
                .begin_write()
                .map_err(|e| PersistError::BackendUnavailable(format!("write txn: {e}")))?;
            {
                let mut table = txn
                    .open_table(PLANS_TABLE)
                    .map_err(|e| PersistError::BackendUnavailable(format!("open table: {e}")))?;
                table
                    .insert(record.key.as_str(), value.as_slice())
                    .map_err(|e| PersistError::CorruptedData(format!("insert: {e}")))?;
            }
            txn.commit()
                .map_err(|e| PersistError::CorruptedData(format!("commit: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| PersistError::BackendUnavailable(format!("task join: {e}")))?
    }

    async fn delete(&self, key: &str) -> Result<(), PersistError> {
        let db = Arc::clone(&self.db);
        let key = key.to_string();

        tokio::task::spawn_blocking(move || -> Result<(), PersistError> {
            let txn = db
                .begin_write()
                .map_err(|e| PersistError::BackendUnavailable(format!("write txn: {e}")))?;
            {
                let mut table = txn
                    .open_table(PLANS_TABLE)
                    .map_err(|e| PersistError::BackendUnavailable(format!("open table: {e}")))?;
                table
                    .remove(key.as_str())
                    .map_err(|e| PersistError::CorruptedData(format!("remove: {e}")))?;
            }
            txn.commit()
                .map_err(|e| PersistError::CorruptedData(format!("commit: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| PersistError::BackendUnavailable(format!("task join: {e}")))?
    }

    async fn for_each_persisted(&self, visitor: &mut PersistedVisitor<'_>) -> Result<(), PersistError> {
        let db = Arc::clone(&self.db);
        let plans = tokio::task::spawn_blocking(move || Self::load_all(&db))
            .await
            .map_err(|e| PersistError::BackendUnavailable(format!("task join: {e}")))??;

        for plan in plans {
            if !visitor(plan) {
                break;
            }
        }
        Ok(())
    }
}
