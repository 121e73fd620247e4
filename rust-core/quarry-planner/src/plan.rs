// SPDX-License-Identifier: PMPL-1.0-or-later
//! Compiled plan types.
//!
//! A [`Plan`] is the cacheable output of the statement compiler: an operator
//! tree plus the identity it was compiled under and the metadata it depends
//! on. The cache never interprets the operator tree beyond collecting the
//! indexes it scans.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::CompilationContext;
use crate::metadata::MetadataStore;
use crate::stability::StabilityMode;

/// Newest plan layout this engine can execute.
pub const PLAN_VERSION: u32 = 2;

/// Kind of write a mutation operator performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationVerb {
    Insert,
    Upsert,
    Update,
    Delete,
}

/// A node of the executable operator tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operator {
    /// Produces a single empty row.
    DummyScan,
    /// Direct document access by key.
    KeyScan { keyspace: String },
    /// Full scan through the primary index.
    PrimaryScan { keyspace: String, index: String },
    /// Range scan of a secondary index.
    IndexScan {
        keyspace: String,
        index: String,
        spans: Vec<String>,
    },
    /// Fetch documents for the keys produced by `input`.
    Fetch { keyspace: String, input: Box<Operator> },
    Filter { condition: String, input: Box<Operator> },
    Project { terms: Vec<String>, input: Box<Operator> },
    /// ORDER BY terms with a descending flag each.
    Order {
        terms: Vec<(String, bool)>,
        input: Box<Operator>,
    },
    Limit { count: u64, input: Box<Operator> },
    Sequence { children: Vec<Operator> },
    Mutation {
        verb: MutationVerb,
        keyspace: String,
        input: Box<Operator>,
    },
}

impl Operator {
    /// Indexes scanned anywhere in this subtree, deduplicated and sorted.
    pub fn indexes(&self) -> Vec<IndexRef> {
        let mut found = BTreeSet::new();
        self.collect_indexes(&mut found);
        found.into_iter().collect()
    }

    fn collect_indexes(&self, found: &mut BTreeSet<IndexRef>) {
        match self {
            Operator::PrimaryScan { keyspace, index } | Operator::IndexScan { keyspace, index, .. } => {
                found.insert(IndexRef {
                    keyspace: keyspace.clone(),
                    name: index.clone(),
                });
            }
            Operator::Fetch { input, .. }
            | Operator::Filter { input, .. }
            | Operator::Project { input, .. }
            | Operator::Order { input, .. }
            | Operator::Limit { input, .. }
            | Operator::Mutation { input, .. } => input.collect_indexes(found),
            Operator::Sequence { children } => {
                for child in children {
                    child.collect_indexes(found);
                }
            }
            Operator::DummyScan | Operator::KeyScan { .. } => {}
        }
    }
}

/// A keyspace the plan reads or writes, with the metadata version observed
/// when it was compiled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceRef {
    pub name: String,
    pub version: u64,
}

/// An index the plan scans.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexRef {
    pub keyspace: String,
    pub name: String,
}

/// A compiled, executable plan together with its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Cache key the plan is stored under.
    pub name: String,
    /// Original statement text.
    pub text: String,
    pub namespace: String,
    pub query_context: String,
    pub context: CompilationContext,
    pub plan_version: u32,
    /// When the plan was last fully compiled; `None` if it never was.
    pub prepared_time: Option<DateTime<Utc>>,
    pub root: Operator,
    pub keyspaces: Vec<KeyspaceRef>,
    pub indexes: Vec<IndexRef>,
    pub stability: StabilityMode,
    /// Cached only because ad-hoc plan stability is on.
    pub implicit: bool,
}

impl Plan {
    /// Whether the plan has to be recompiled before it can be served at all,
    /// independent of metadata: it was produced by a newer engine or was
    /// never fully compiled.
    pub fn needs_reprepare(&self) -> bool {
        self.plan_version > PLAN_VERSION || self.prepared_time.is_none()
    }

    /// Cheap staleness test.
    ///
    /// Passes when nothing changed anywhere since `checked_at`, or when every
    /// keyspace this plan depends on still has the version it was compiled
    /// against.
    pub fn metadata_check(&self, metadata: &dyn MetadataStore, checked_at: u64) -> bool {
        if metadata.change_counter() == checked_at {
            return true;
        }
        self.keyspaces_unchanged(metadata)
    }

    /// Full validation against live metadata: every keyspace present at the
    /// compiled version, every scanned index online, and a plan layout this
    /// engine supports.
    pub fn verify(&self, metadata: &dyn MetadataStore) -> bool {
        self.plan_version <= PLAN_VERSION
            && self.keyspaces_unchanged(metadata)
            && self
                .indexes
                .iter()
                .all(|index| metadata.index_online(&index.keyspace, &index.name))
    }

    fn keyspaces_unchanged(&self, metadata: &dyn MetadataStore) -> bool {
        self.keyspaces
            .iter()
            .all(|ks| metadata.keyspace_version(&ks.name) == Some(ks.version))
    }

    /// Copy of this plan stamped with a different stability mode.
    pub fn restamped(&self, stability: StabilityMode) -> Plan {
        Plan {
            stability,
            ..self.clone()
        }
    }
}
