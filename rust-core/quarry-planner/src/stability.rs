// SPDX-License-Identifier: PMPL-1.0-or-later
//! Plan stability.
//!
//! With stability on, plans are mirrored into the durable [`PlanStore`] so a
//! restarted node serves the same plans it served before. Switching the mode
//! walks every cached entry and brings its durable copy and its stamped mode
//! in line with the new setting. Ad-hoc mode additionally caches unnamed
//! statements as implicit entries.
//!
//! [`PlanStore`]: crate::persist::PlanStore

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::PreparedError;
use crate::persist::PersistedPlan;
use crate::prepared::{Origin, PreparedCache, PreparedEntry};

/// Cluster-wide plan stability setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityMode {
    /// Nothing is persisted.
    #[default]
    Off,
    /// Explicitly prepared statements are persisted.
    PreparedOnly,
    /// Prepared statements and implicitly cached ad-hoc statements are
    /// persisted.
    AdHoc,
}

impl StabilityMode {
    pub fn is_on(self) -> bool {
        self != StabilityMode::Off
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StabilityMode::Off => "off",
            StabilityMode::PreparedOnly => "prepared_only",
            StabilityMode::AdHoc => "ad_hoc",
        }
    }
}

impl fmt::Display for StabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StabilityMode {
    type Err = PreparedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "off" => Ok(StabilityMode::Off),
            "prepared_only" => Ok(StabilityMode::PreparedOnly),
            "ad_hoc" | "adhoc" => Ok(StabilityMode::AdHoc),
            other => Err(PreparedError::InvalidConfig(format!("unknown plan stability mode: {other}"))),
        }
    }
}

impl PreparedCache {
    /// Switch the plan stability mode.
    ///
    /// Every cached entry is brought in line with `mode` before the switch
    /// takes effect. While the walk runs, plans compiled concurrently are
    /// already stamped and persisted under `mode`. The first failure aborts
    /// the walk and leaves the mode unchanged; entries already processed keep
    /// their new state.
    pub async fn set_stability_mode(&self, mode: StabilityMode) -> Result<(), PreparedError> {
        let _transition = self.transition.lock().await;

        let current = self.stability_mode();
        if current == mode {
            return Ok(());
        }
        if mode.is_on() && !self.store.supports_stability() {
            return Err(PreparedError::StabilityUnsupported(self.store.name().to_string()));
        }

        info!(from = %current, to = %mode, "changing plan stability mode");
        self.stability.write().target = Some(mode);

        let mut walked = 0usize;
        for (key, entry) in self.snapshot() {
            if let Err(e) = self.transition_entry(&key, &entry, current, mode).await {
                self.stability.write().target = None;
                warn!(key = %key, error = %e, walked, "plan stability transition aborted");
                return Err(e);
            }
            walked += 1;
        }

        {
            let mut state = self.stability.write();
            state.mode = mode;
            state.target = None;
        }
        info!(mode = %mode, walked, "plan stability mode changed");
        Ok(())
    }

    /// Seed the cache from the durable store. Returns how many plans were
    /// loaded; plans that fail to load are logged and skipped.
    pub async fn load_persisted(&self) -> Result<usize, PreparedError> {
        let mut records: Vec<PersistedPlan> = Vec::new();
        self.store
            .for_each_persisted(&mut |record| {
                records.push(record);
                true
            })
            .await?;

        let mut loaded = 0;
        for record in records {
            match self.insert_encoded(&record.key, &record.encoded, Origin::Persisted).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!(key = %record.key, error = %e, "cannot load persisted plan"),
            }
        }

        info!(loaded, store = self.store.name(), "loaded persisted plans");
        Ok(loaded)
    }

    async fn transition_entry(
        &self,
        key: &str,
        entry: &Arc<PreparedEntry>,
        from: StabilityMode,
        to: StabilityMode,
    ) -> Result<(), PreparedError> {
        let implicit = entry.plan().implicit;
        match (from, to) {
            (StabilityMode::Off, _) => {
                if entry.is_persisted() {
                    return Ok(());
                }
                self.restamp(key, entry, to, true).await
            }
            (_, StabilityMode::Off) => {
                self.store.delete(key).await?;
                if implicit {
                    self.drop_entry(key);
                    Ok(())
                } else {
                    self.restamp(key, entry, to, false).await
                }
            }
            (_, StabilityMode::PreparedOnly) => {
                if implicit {
                    self.store.delete(key).await?;
                    self.drop_entry(key);
                    Ok(())
                } else {
                    self.restamp(key, entry, to, true).await
                }
            }
            (_, StabilityMode::AdHoc) => {
                if implicit {
                    return Ok(());
                }
                self.restamp(key, entry, to, true).await
            }
        }
    }

    /// Swap in a copy of `entry` stamped with `mode`, then persist it if
    /// asked. Verification state carries over. If the entry was replaced
    /// concurrently, the replacement was written under the target mode and
    /// the restamp is skipped.
    async fn restamp(
        &self,
        key: &str,
        entry: &Arc<PreparedEntry>,
        mode: StabilityMode,
        persist: bool,
    ) -> Result<(), PreparedError> {
        let plan = entry.plan().restamped(mode);
        let encoded = codec::encode(&plan)?;
        let replacement = Arc::new(PreparedEntry::restamped(plan, encoded, entry));

        let swapped = self
            .cache
            .get_with(key, |current| {
                if Arc::ptr_eq(current, entry) {
                    *current = Arc::clone(&replacement);
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false);
        if !swapped {
            debug!(key, "entry replaced during stability transition");
            return Ok(());
        }

        if persist {
            self.store.persist(key, replacement.encoded(), mode).await?;
        }
        replacement.set_persisted(persist);
        Ok(())
    }

    /// Remove whatever implicit plan is cached under `key` now.
    fn drop_entry(&self, key: &str) {
        self.cache.delete_with_check(key, |current| current.plan().implicit);
    }
}
