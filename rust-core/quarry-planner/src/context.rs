// SPDX-License-Identifier: PMPL-1.0-or-later
//! Compilation context.
//!
//! Everything besides the statement text that can change the plan the
//! compiler produces. Two compilations of the same text under different
//! contexts must never share a cache slot, so the context is folded into the
//! cache key via [`CompilationContext::fingerprint`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current version of the index API the planner targets.
pub const INDEX_API_VERSION: u32 = 4;

/// Which optimizer produced the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerMode {
    /// Heuristic, rule-based planning.
    #[default]
    RuleBased,
    /// Cost-based planning using keyspace statistics.
    CostBased,
}

impl OptimizerMode {
    fn tag(self) -> u8 {
        match self {
            OptimizerMode::RuleBased => 0,
            OptimizerMode::CostBased => 1,
        }
    }
}

/// Options a statement was compiled under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompilationContext {
    /// Bitmask of planner feature flags in effect.
    pub feature_controls: u64,
    /// Index API version the plan's scans were generated for.
    pub index_api_version: u32,
    pub optimizer: OptimizerMode,
}

impl Default for CompilationContext {
    fn default() -> Self {
        Self {
            feature_controls: 0,
            index_api_version: INDEX_API_VERSION,
            optimizer: OptimizerMode::default(),
        }
    }
}

impl CompilationContext {
    /// Short, stable hash of this context combined with `namespace`.
    ///
    /// Returns the first 8 bytes of a SHA-256 digest as 16 lowercase hex
    /// characters.
    pub fn fingerprint(&self, namespace: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.feature_controls.to_le_bytes());
        hasher.update(self.index_api_version.to_le_bytes());
        hasher.update([self.optimizer.tag()]);
        hasher.update(namespace.as_bytes());
        let digest = hasher.finalize();

        digest
            .iter()
            .take(8)
            .map(|byte| format!("{:02x}", byte))
            .collect::<String>()
    }
}
