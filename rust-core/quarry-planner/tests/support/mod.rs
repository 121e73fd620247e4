// SPDX-License-Identifier: PMPL-1.0-or-later
//! Shared fixtures for quarry-planner integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use quarry_planner::{
    CompileError, CompileRequest, CompiledPlan, InMemoryMetadata, KeyspaceRef, MetadataStore, Operator,
    PeerTransport, PlanStore, PreparedCache, PreparedConfig, StatementCompiler, TransportError,
};

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// Toy compiler that understands just enough to produce realistic plans:
///
/// - `... FROM <ks> USE INDEX (<ix>) ...` → index scan of `<ix>`
/// - `... FROM <ks> ...` → primary scan
/// - statements without a literal keyspace → dummy scan
/// - text starting with `BAD` → parse error
pub struct MockCompiler {
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockCompiler {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Compiler that sleeps on every compile, widening race windows.
    pub fn slow(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StatementCompiler for MockCompiler {
    fn compile(
        &self,
        request: &CompileRequest<'_>,
        metadata: &dyn MetadataStore,
    ) -> Result<CompiledPlan, CompileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        if request.text.starts_with("BAD") {
            return Err(CompileError::Parse(format!("syntax error near {:?}", request.text)));
        }

        let keyspace = request
            .text
            .split(" FROM ")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .filter(|ks| !ks.starts_with('$'));
        let Some(keyspace) = keyspace else {
            return Ok(CompiledPlan {
                root: Operator::DummyScan,
                keyspaces: Vec::new(),
            });
        };

        let version = metadata
            .keyspace_version(keyspace)
            .ok_or_else(|| CompileError::Plan(format!("keyspace not found: {keyspace}")))?;

        let index = request
            .text
            .split("USE INDEX (")
            .nth(1)
            .and_then(|rest| rest.split(')').next());
        let scan = match index {
            Some(index) => {
                if !metadata.index_online(keyspace, index) {
                    return Err(CompileError::Plan(format!("index {index} not online")));
                }
                Operator::IndexScan {
                    keyspace: keyspace.to_string(),
                    index: index.to_string(),
                    spans: Vec::new(),
                }
            }
            None => Operator::PrimaryScan {
                keyspace: keyspace.to_string(),
                index: "#primary".to_string(),
            },
        };

        Ok(CompiledPlan {
            root: Operator::Fetch {
                keyspace: keyspace.to_string(),
                input: Box::new(scan),
            },
            keyspaces: vec![KeyspaceRef {
                name: keyspace.to_string(),
                version,
            }],
        })
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// In-process stand-in for a cluster.
///
/// Each peer's plan set is a map the test seeds directly; `put` records the
/// push and stores the plan on the target peer.
pub struct MockTransport {
    local: String,
    members: Mutex<Option<Vec<String>>>,
    holdings: Mutex<HashMap<String, BTreeMap<String, String>>>,
    pushes: Mutex<Vec<(String, String)>>,
    unreachable: Mutex<HashSet<String>>,
    gets: AtomicUsize,
}

impl MockTransport {
    pub fn new(local: &str, members: &[&str]) -> Self {
        Self {
            local: local.to_string(),
            members: Mutex::new(Some(members.iter().map(|m| m.to_string()).collect())),
            holdings: Mutex::new(HashMap::new()),
            pushes: Mutex::new(Vec::new()),
            unreachable: Mutex::new(HashSet::new()),
            gets: AtomicUsize::new(0),
        }
    }

    /// Membership unknown until [`set_members`](Self::set_members).
    pub fn without_membership(local: &str) -> Self {
        let transport = Self::new(local, &[]);
        *transport.members.lock() = None;
        transport
    }

    pub fn set_members(&self, members: &[&str]) {
        *self.members.lock() = Some(members.iter().map(|m| m.to_string()).collect());
    }

    pub fn hold(&self, peer: &str, key: &str, encoded: &str) {
        self.holdings
            .lock()
            .entry(peer.to_string())
            .or_default()
            .insert(key.to_string(), encoded.to_string());
    }

    pub fn set_unreachable(&self, peer: &str) {
        self.unreachable.lock().insert(peer.to_string());
    }

    /// `(peer, key)` of every push received, in order.
    pub fn pushes(&self) -> Vec<(String, String)> {
        self.pushes.lock().clone()
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn check_reachable(&self, peer: &str) -> Result<(), TransportError> {
        if self.unreachable.lock().contains(peer) {
            return Err(TransportError::Unreachable {
                peer: peer.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    fn local_node(&self) -> &str {
        &self.local
    }

    async fn members(&self) -> Option<Vec<String>> {
        self.members.lock().clone()
    }

    async fn put(&self, peer: &str, key: &str, encoded: &str) -> Result<(), TransportError> {
        self.check_reachable(peer)?;
        self.pushes.lock().push((peer.to_string(), key.to_string()));
        self.hold(peer, key, encoded);
        Ok(())
    }

    async fn list(&self, peer: &str, prefix: &str) -> Result<Vec<String>, TransportError> {
        self.check_reachable(peer)?;
        Ok(self
            .holdings
            .lock()
            .get(peer)
            .map(|plans| plans.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, peer: &str, key: &str) -> Result<Option<String>, TransportError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check_reachable(peer)?;
        Ok(self.holdings.lock().get(peer).and_then(|plans| plans.get(key).cloned()))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Metadata with a `travel` keyspace (primary index plus `by_city`) and an
/// empty `hotels` keyspace.
pub fn travel_metadata() -> Arc<InMemoryMetadata> {
    let metadata = Arc::new(InMemoryMetadata::new());
    metadata.create_index("travel", "#primary");
    metadata.create_index("travel", "by_city");
    metadata.create_index("hotels", "#primary");
    metadata
}

pub struct Node {
    pub cache: PreparedCache,
    pub compiler: Arc<MockCompiler>,
    pub metadata: Arc<InMemoryMetadata>,
}

pub fn node(config: PreparedConfig) -> Node {
    node_with(config, None, None)
}

pub fn node_with(
    config: PreparedConfig,
    store: Option<Arc<dyn PlanStore>>,
    transport: Option<Arc<dyn PeerTransport>>,
) -> Node {
    let compiler = Arc::new(MockCompiler::new());
    let metadata = travel_metadata();
    let mut builder = PreparedCache::builder(compiler.clone(), metadata.clone()).config(config);
    if let Some(store) = store {
        builder = builder.store(store);
    }
    if let Some(transport) = transport {
        builder = builder.transport(transport);
    }
    Node {
        cache: builder.build().expect("cache builds"),
        compiler,
        metadata,
    }
}

/// Poll `condition` for up to a second.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
