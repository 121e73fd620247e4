// SPDX-License-Identifier: PMPL-1.0-or-later
//! Quarry Planner
//!
//! Prepared plan caching for the Quarry query engine. Compiled plans are kept
//! in a node-local [`PreparedCache`], checked against live cluster metadata
//! before use, recompiled transparently when stale, pushed to peer nodes on a
//! best-effort basis and, with plan stability on, mirrored into a durable
//! store.
//!
//! Parsing, planning and the metadata catalog are external; they plug in
//! through [`StatementCompiler`] and [`MetadataStore`]. Peer exchange plugs in
//! through [`PeerTransport`].

pub mod codec;
pub mod compiler;
pub mod config;
pub mod context;
pub mod distribution;
pub mod error;
pub mod metadata;
pub mod naming;
pub mod persist;
pub mod plan;
pub mod prepared;
#[cfg(feature = "redb-backend")]
pub mod redb_store;
pub mod stability;

pub use compiler::{CompileRequest, CompiledPlan, StatementCompiler};
pub use config::PreparedConfig;
pub use context::{CompilationContext, OptimizerMode};
pub use distribution::{remote_prime, Distributor, PeerTransport, PrimeConfig, PrimeReport};
pub use error::{CompileError, PersistError, PreparedError, TransportError};
pub use metadata::{InMemoryMetadata, MetadataStore};
pub use naming::{plan_key, DEFAULT_NAMESPACE};
pub use persist::{open_plan_store, DisabledPlanStore, MemoryPlanStore, PersistedPlan, PlanStore, PlanStoreKind};
pub use plan::{IndexRef, KeyspaceRef, Operator, Plan, PLAN_VERSION};
pub use prepared::{
    AddedPlan, CacheStats, GetOptions, PrepareRequest, PreparedCache, PreparedCacheBuilder, PreparedEntry,
    PreparedInfo,
};
#[cfg(feature = "redb-backend")]
pub use redb_store::RedbPlanStore;
pub use stability::StabilityMode;
