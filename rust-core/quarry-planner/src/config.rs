// SPDX-License-Identifier: PMPL-1.0-or-later
//! Prepared plan cache configuration.
//!
//! Defaults suit a single node: a 16384-entry cache, stability off, and
//! distribution on (it only takes effect once a transport is configured).
//! [`PreparedConfig::from_env`] overlays `QUARRY_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::distribution::PrimeConfig;
use crate::error::PreparedError;
use crate::persist::PlanStoreKind;
use crate::stability::StabilityMode;

/// Configuration for [`PreparedCache`](crate::PreparedCache).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreparedConfig {
    /// Maximum cached plans; zero disables the bound.
    pub limit: usize,
    /// Initial plan stability mode.
    pub stability: StabilityMode,
    /// Push newly compiled plans to peers.
    pub distribute: bool,
    /// Pending pushes held before new ones are dropped.
    pub queue_capacity: usize,
    /// Name this node advertises to peers.
    pub node_name: String,
    /// How long remote prime waits for cluster membership.
    pub prime_wait_ms: u64,
    /// Membership poll interval during remote prime.
    pub prime_poll_ms: u64,
    /// Durable plan store.
    pub store: PlanStoreKind,
}

impl Default for PreparedConfig {
    fn default() -> Self {
        Self {
            limit: 16384,
            stability: StabilityMode::Off,
            distribute: true,
            queue_capacity: 1024,
            node_name: "127.0.0.1:8093".to_string(),
            prime_wait_ms: 30_000,
            prime_poll_ms: 500,
            store: PlanStoreKind::Disabled,
        }
    }
}

impl PreparedConfig {
    /// Defaults overlaid with `QUARRY_*` environment variables.
    ///
    /// | variable | field |
    /// |---|---|
    /// | `QUARRY_PREPARED_LIMIT` | `limit` |
    /// | `QUARRY_PLAN_STABILITY` | `stability` (`off`, `prepared_only`, `ad_hoc`) |
    /// | `QUARRY_DISTRIBUTE` | `distribute` |
    /// | `QUARRY_DISTRIBUTION_QUEUE` | `queue_capacity` |
    /// | `QUARRY_NODE_NAME` | `node_name` |
    /// | `QUARRY_PRIME_WAIT_MS` | `prime_wait_ms` |
    /// | `QUARRY_PRIME_POLL_MS` | `prime_poll_ms` |
    /// | `QUARRY_PLAN_STORE` | `store` (`disabled`, `memory`, `redb`) |
    /// | `QUARRY_PLAN_STORE_PATH` | path for the `redb` store |
    pub fn from_env() -> Result<Self, PreparedError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PreparedError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("QUARRY_PREPARED_LIMIT") {
            config.limit = parse_var("QUARRY_PREPARED_LIMIT", &v)?;
        }
        if let Some(v) = lookup("QUARRY_PLAN_STABILITY") {
            config.stability = v.parse()?;
        }
        if let Some(v) = lookup("QUARRY_DISTRIBUTE") {
            config.distribute = parse_var("QUARRY_DISTRIBUTE", &v)?;
        }
        if let Some(v) = lookup("QUARRY_DISTRIBUTION_QUEUE") {
            config.queue_capacity = parse_var("QUARRY_DISTRIBUTION_QUEUE", &v)?;
        }
        if let Some(v) = lookup("QUARRY_NODE_NAME") {
            config.node_name = v;
        }
        if let Some(v) = lookup("QUARRY_PRIME_WAIT_MS") {
            config.prime_wait_ms = parse_var("QUARRY_PRIME_WAIT_MS", &v)?;
        }
        if let Some(v) = lookup("QUARRY_PRIME_POLL_MS") {
            config.prime_poll_ms = parse_var("QUARRY_PRIME_POLL_MS", &v)?;
        }
        if let Some(v) = lookup("QUARRY_PLAN_STORE") {
            config.store = match v.trim().to_ascii_lowercase().as_str() {
                "disabled" | "none" => PlanStoreKind::Disabled,
                "memory" => PlanStoreKind::Memory,
                "redb" => {
                    let path = lookup("QUARRY_PLAN_STORE_PATH").ok_or_else(|| {
                        PreparedError::InvalidConfig("QUARRY_PLAN_STORE=redb requires QUARRY_PLAN_STORE_PATH".to_string())
                    })?;
                    PlanStoreKind::Redb {
                        path: PathBuf::from(path),
                    }
                }
                other => {
                    return Err(PreparedError::InvalidConfig(format!("unknown plan store: {other}")));
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the cache cannot run with.
    pub fn validate(&self) -> Result<(), PreparedError> {
        if self.distribute && self.queue_capacity == 0 {
            return Err(PreparedError::InvalidConfig(
                "distribution queue capacity must be positive".to_string(),
            ));
        }
        if self.prime_poll_ms == 0 {
            return Err(PreparedError::InvalidConfig("prime poll interval must be positive".to_string()));
        }
        if self.node_name.trim().is_empty() {
            return Err(PreparedError::InvalidConfig("node name must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn prime_config(&self) -> PrimeConfig {
        PrimeConfig {
            membership_wait: Duration::from_millis(self.prime_wait_ms),
            poll_interval: Duration::from_millis(self.prime_poll_ms),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, PreparedError> {
    value
        .trim()
        .parse()
        .map_err(|_| PreparedError::InvalidConfig(format!("{name}: cannot parse {value:?}")))
}
