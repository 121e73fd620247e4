// SPDX-License-Identifier: PMPL-1.0-or-later

//! The prepared plan cache.
//!
//! [`PreparedCache`] keeps compiled plans in a [`GenericCache`] and decides
//! when a cached plan may be served:
//!
//! - **Lookup**: by name, with `[node]` origin hints stripped. Misses fall back
//!   to the builtin predefined statements, then to a fetch from a peer.
//! - **Verification**: a cheap metadata check on the fast path; a full check
//!   under the entry lock on the slow path, so one key is verified by one
//!   caller at a time while other keys proceed.
//! - **Reprepare**: a plan that fails verification is recompiled from its text
//!   under its original compilation context, outside the entry lock, and
//!   added back under the same key if the cached text still matches.
//!   Concurrent reprepares of one key may both complete; the last add wins.
//! - **Publication**: successful compiles are persisted while plan stability
//!   is on and queued for distribution to peers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use quarry_cache::{AddOutcome, ConflictAction, GenericCache};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec;
use crate::compiler::{CompileRequest, StatementCompiler};
use crate::config::PreparedConfig;
use crate::context::CompilationContext;
use crate::distribution::{remote_prime, Distributor, PeerTransport, PrimeReport};
use crate::error::PreparedError;
use crate::metadata::MetadataStore;
use crate::naming::{plan_key, predefined, strip_node_hint, with_query_context, Predefined, DEFAULT_NAMESPACE};
use crate::persist::{open_plan_store, PlanStore};
use crate::plan::{Plan, PLAN_VERSION};
use crate::stability::StabilityMode;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Cache payload: a plan, its encoded form and its verification state.
#[derive(Debug)]
pub struct PreparedEntry {
    plan: Arc<Plan>,
    encoded: String,
    /// Verified against metadata since the last relevant change.
    populated: AtomicBool,
    /// Metadata change counter at the last successful verification.
    checked_at: AtomicU64,
    /// A durable copy exists in the plan store.
    persisted: AtomicBool,
}

impl PreparedEntry {
    fn new(plan: Plan, populated_at: Option<u64>) -> Result<Self, PreparedError> {
        let encoded = codec::encode(&plan)?;
        Ok(Self::with_encoded(plan, encoded, populated_at))
    }

    fn with_encoded(plan: Plan, encoded: String, populated_at: Option<u64>) -> Self {
        Self {
            plan: Arc::new(plan),
            encoded,
            populated: AtomicBool::new(populated_at.is_some()),
            checked_at: AtomicU64::new(populated_at.unwrap_or(0)),
            persisted: AtomicBool::new(false),
        }
    }

    /// Entry for a restamped copy of `previous`'s plan, keeping its
    /// verification state.
    pub(crate) fn restamped(plan: Plan, encoded: String, previous: &PreparedEntry) -> Self {
        let populated_at = previous.is_populated().then(|| previous.checked_at());
        Self::with_encoded(plan, encoded, populated_at)
    }

    pub fn plan(&self) -> &Arc<Plan> {
        &self.plan
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::Acquire)
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::Acquire)
    }

    pub(crate) fn checked_at(&self) -> u64 {
        self.checked_at.load(Ordering::Acquire)
    }

    pub(crate) fn mark_populated(&self, counter: u64) {
        self.checked_at.store(counter, Ordering::Release);
        self.populated.store(true, Ordering::Release);
    }

    pub(crate) fn set_persisted(&self, persisted: bool) {
        self.persisted.store(persisted, Ordering::Release);
    }
}

/// Options for [`PreparedCache::get_plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOptions {
    /// Validate the plan against metadata before returning it.
    pub verify: bool,
    /// Caller only inspects the plan: a stale plan yields
    /// [`PreparedError::Stale`] instead of being reprepared.
    pub metadata_only: bool,
    /// On a miss, try fetching the plan from a peer.
    pub remote: bool,
    /// Peer to fetch from; overrides the name's `[node]` hint.
    pub peer: Option<String>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            verify: true,
            metadata_only: false,
            remote: true,
            peer: None,
        }
    }
}

impl GetOptions {
    /// Local lookup with verification, never touching peers.
    pub fn local() -> Self {
        Self {
            remote: false,
            ..Self::default()
        }
    }
}

/// An explicit PREPARE.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrepareRequest {
    /// User-chosen name; derived from the text when absent.
    #[serde(default)]
    pub name: Option<String>,
    pub text: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub query_context: String,
    #[serde(default)]
    pub context: CompilationContext,
}

impl PrepareRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn named(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(text)
        }
    }

    pub fn with_query_context(mut self, query_context: impl Into<String>) -> Self {
        self.query_context = query_context.into();
        self
    }

    pub fn with_context(mut self, context: CompilationContext) -> Self {
        self.context = context;
        self
    }
}

/// How [`PreparedCache::add_encoded`] cached a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddedPlan {
    /// The encoded plan was decoded and cached as is.
    Cached,
    /// The encoded body was unusable; the plan was recompiled from its text.
    Reprepared,
}

/// Listing row for one cached plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedInfo {
    pub name: String,
    pub text: String,
    pub namespace: String,
    pub query_context: String,
    pub uses: u64,
    pub last_use: Option<DateTime<Utc>>,
    pub prepared_time: Option<DateTime<Utc>>,
    pub populated: bool,
    pub persisted: bool,
    pub stability: StabilityMode,
    pub implicit: bool,
    pub encoded_size: usize,
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub size: usize,
    /// Zero means unbounded.
    pub limit: usize,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0.0 before the first lookup.
    pub hit_ratio: f64,
    pub reprepares: u64,
    pub remote_fetches: u64,
    pub evictions: u64,
}

/// Result of checking a cached entry on the slow path.
enum Checked {
    Fresh(Arc<PreparedEntry>),
    Stale(Arc<PreparedEntry>),
}

/// Where an encoded plan came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Peer,
    Persisted,
}

/// Identity carried from a statement request (or a stale plan) into a fresh
/// compile.
struct PlanIdentity {
    name: String,
    text: String,
    namespace: String,
    query_context: String,
    context: CompilationContext,
    stability: StabilityMode,
    implicit: bool,
}

impl PlanIdentity {
    fn of(plan: &Plan) -> Self {
        Self {
            name: plan.name.clone(),
            text: plan.text.clone(),
            namespace: plan.namespace.clone(),
            query_context: plan.query_context.clone(),
            context: plan.context.clone(),
            stability: plan.stability,
            implicit: plan.implicit,
        }
    }
}

/// Committed stability mode, plus the mode a running transition is moving to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StabilityState {
    pub(crate) mode: StabilityMode,
    pub(crate) target: Option<StabilityMode>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    reprepares: AtomicU64,
    remote_fetches: AtomicU64,
}

fn namespace_or_default(namespace: &str) -> &str {
    if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    }
}

// ---------------------------------------------------------------------------
// PreparedCache
// ---------------------------------------------------------------------------

/// Node-wide cache of compiled plans.
///
/// Build one per node with [`PreparedCache::builder`] and share it behind an
/// `Arc`.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use quarry_planner::{GetOptions, InMemoryMetadata, PrepareRequest, PreparedCache, StatementCompiler};
///
/// # async fn example(compiler: Arc<dyn StatementCompiler>) -> Result<(), quarry_planner::PreparedError> {
/// let cache = PreparedCache::builder(compiler, Arc::new(InMemoryMetadata::new())).build()?;
///
/// let plan = cache.prepare(PrepareRequest::named("by_city", "SELECT * FROM travel WHERE city = $1")).await?;
/// let again = cache.get_plan(&plan.name, &GetOptions::default()).await?;
/// assert_eq!(plan.text, again.text);
/// # Ok(())
/// # }
/// ```
pub struct PreparedCache {
    pub(crate) cache: GenericCache<Arc<PreparedEntry>>,
    compiler: Arc<dyn StatementCompiler>,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) store: Arc<dyn PlanStore>,
    transport: Option<Arc<dyn PeerTransport>>,
    distributor: Option<Distributor>,
    pub(crate) stability: RwLock<StabilityState>,
    /// Serializes stability mode transitions.
    pub(crate) transition: tokio::sync::Mutex<()>,
    counters: Counters,
}

/// Builder for [`PreparedCache`].
pub struct PreparedCacheBuilder {
    config: PreparedConfig,
    compiler: Arc<dyn StatementCompiler>,
    metadata: Arc<dyn MetadataStore>,
    store: Option<Arc<dyn PlanStore>>,
    transport: Option<Arc<dyn PeerTransport>>,
}

impl PreparedCacheBuilder {
    pub fn config(mut self, config: PreparedConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `store` instead of opening the one named in the configuration.
    pub fn store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Enable remote fetch, and distribution if configured.
    pub fn transport(mut self, transport: Arc<dyn PeerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the cache. Spawns the distribution worker when distribution is
    /// enabled and a transport is set, so it must then run inside a tokio
    /// runtime.
    pub fn build(self) -> Result<PreparedCache, PreparedError> {
        self.config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => open_plan_store(&self.config.store)?,
        };
        if self.config.stability.is_on() && !store.supports_stability() {
            return Err(PreparedError::StabilityUnsupported(store.name().to_string()));
        }

        let distributor = match (&self.transport, self.config.distribute) {
            (Some(transport), true) => Some(Distributor::spawn(Arc::clone(transport), self.config.queue_capacity)),
            _ => None,
        };

        info!(
            limit = self.config.limit,
            stability = %self.config.stability,
            store = store.name(),
            distribute = distributor.is_some(),
            "prepared plan cache ready"
        );

        Ok(PreparedCache {
            cache: GenericCache::new(self.config.limit),
            compiler: self.compiler,
            metadata: self.metadata,
            store,
            transport: self.transport,
            distributor,
            stability: RwLock::new(StabilityState {
                mode: self.config.stability,
                target: None,
            }),
            transition: tokio::sync::Mutex::new(()),
            counters: Counters::default(),
        })
    }
}

impl PreparedCache {
    pub fn builder(compiler: Arc<dyn StatementCompiler>, metadata: Arc<dyn MetadataStore>) -> PreparedCacheBuilder {
        PreparedCacheBuilder {
            config: PreparedConfig::default(),
            compiler,
            metadata,
            store: None,
            transport: None,
        }
    }

    /// Resolve `name` to a plan that is safe to execute.
    ///
    /// A stale plan is transparently reprepared (unless
    /// `options.metadata_only`). Returns [`PreparedError::NotFound`] when the
    /// name resolves nowhere; peer failures are logged and treated as a miss.
    pub async fn get_plan(&self, name: &str, options: &GetOptions) -> Result<Arc<Plan>, PreparedError> {
        let (hint, key) = strip_node_hint(name);

        let entry = match self.cache.use_entry(key) {
            Some(entry) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                entry
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.resolve_missing(key, hint, options).await?
            }
        };

        let unusable = entry.plan.needs_reprepare();
        if !unusable && (!options.verify || self.is_fresh(&entry)) {
            return Ok(Arc::clone(&entry.plan));
        }

        // Slow path. Only the re-check and verification run under the entry
        // lock; recompiling happens outside it. If the entry vanished
        // meanwhile, check the copy we already hold.
        let checked = match self
            .cache
            .get_with(key, |current| self.verify_locked(key, current, options.metadata_only))
        {
            Some(checked) => checked?,
            None => self.verify_locked(key, &entry, options.metadata_only)?,
        };

        let stale = match checked {
            Checked::Fresh(current) => return Ok(Arc::clone(&current.plan)),
            Checked::Stale(stale) => stale,
        };

        // Racing callers may each get here and recompile; the last install
        // wins.
        let counter = self.metadata.change_counter();
        let mut identity = PlanIdentity::of(&stale.plan);
        identity.stability = self.write_mode();
        let fresh = Arc::new(PreparedEntry::new(self.compile(identity)?, Some(counter))?);
        self.install(key, &fresh)?;

        self.counters.reprepares.fetch_add(1, Ordering::Relaxed);
        info!(key, "reprepared stale plan");
        self.publish(key, &fresh).await;
        Ok(Arc::clone(&fresh.plan))
    }

    /// Compile and cache a statement under its given or derived name.
    ///
    /// Re-preparing the same text under the same name replaces the entry;
    /// different text under a taken name is a [`PreparedError::NameCollision`].
    pub async fn prepare(&self, request: PrepareRequest) -> Result<Arc<Plan>, PreparedError> {
        let namespace = namespace_or_default(&request.namespace).to_string();
        let key = match &request.name {
            Some(name) => with_query_context(strip_node_hint(name).1, &request.query_context),
            None => plan_key(&request.text, &request.context, &namespace, &request.query_context),
        };

        let counter = self.metadata.change_counter();
        let plan = self.compile(PlanIdentity {
            name: key.clone(),
            text: request.text,
            namespace,
            query_context: request.query_context,
            context: request.context,
            stability: self.write_mode(),
            implicit: false,
        })?;
        let entry = Arc::new(PreparedEntry::new(plan, Some(counter))?);
        self.install(&key, &entry)?;

        debug!(key = %key, "prepared statement");
        self.publish(&key, &entry).await;
        Ok(Arc::clone(&entry.plan))
    }

    /// Plan for an unnamed statement.
    ///
    /// With ad-hoc plan stability on, the plan is looked up and implicitly
    /// cached by its derived name. Otherwise it is compiled and not cached.
    pub async fn adhoc_plan(
        &self,
        text: &str,
        namespace: &str,
        query_context: &str,
        context: &CompilationContext,
    ) -> Result<Arc<Plan>, PreparedError> {
        let namespace = namespace_or_default(namespace);
        let key = plan_key(text, context, namespace, query_context);
        let mode = self.write_mode();
        let identity = PlanIdentity {
            name: key.clone(),
            text: text.to_string(),
            namespace: namespace.to_string(),
            query_context: query_context.to_string(),
            context: context.clone(),
            stability: mode,
            implicit: true,
        };

        if mode != StabilityMode::AdHoc {
            return self.compile(identity).map(Arc::new);
        }

        match self.get_plan(&key, &GetOptions::local()).await {
            Err(PreparedError::NotFound(_)) => {}
            found => return found,
        }

        let counter = self.metadata.change_counter();
        let entry = Arc::new(PreparedEntry::new(self.compile(identity)?, Some(counter))?);
        let outcome = self.cache.add(&key, Arc::clone(&entry), |existing| {
            if existing.plan.text == text {
                ConflictAction::Keep
            } else {
                ConflictAction::Ignore
            }
        });

        match outcome {
            AddOutcome::Inserted => {
                debug!(key = %key, "cached ad-hoc plan");
                self.publish(&key, &entry).await;
                Ok(Arc::clone(&entry.plan))
            }
            // Someone else cached it first; serve theirs.
            AddOutcome::Amended => Ok(self
                .cache
                .get(&key)
                .map(|current| Arc::clone(&current.plan))
                .unwrap_or_else(|| Arc::clone(&entry.plan))),
            AddOutcome::Ignored => Err(PreparedError::NameCollision { name: key }),
        }
    }

    /// Cache an encoded plan received from a peer.
    ///
    /// The decoded identity must match `key`. If the body cannot be decoded
    /// but the envelope still names `key`, the statement is recompiled from
    /// its text.
    pub async fn add_encoded(&self, key: &str, encoded: &str) -> Result<AddedPlan, PreparedError> {
        self.insert_encoded(key, encoded, Origin::Peer)
            .await
            .map(|(_, added)| added)
    }

    /// Encoded form of a cached plan. Does not count as a use.
    pub fn encoded(&self, name: &str) -> Option<String> {
        let (_, key) = strip_node_hint(name);
        self.cache.get(key).map(|entry| entry.encoded.clone())
    }

    /// Whether `key` is cached.
    pub fn contains(&self, key: &str) -> bool {
        self.cache.get(key).is_some()
    }

    /// Remove a plan and its durable copy. Returns whether it was cached.
    pub async fn delete(&self, name: &str) -> Result<bool, PreparedError> {
        let (_, key) = strip_node_hint(name);

        let mut persisted = false;
        let removed = self.cache.delete_with(key, |entry| persisted = entry.is_persisted());
        if persisted || self.stability_mode().is_on() || self.write_mode().is_on() {
            self.store.delete(key).await?;
        }
        if removed {
            debug!(key, "deleted prepared statement");
        }
        Ok(removed)
    }

    /// Names of all cached plans, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names = self.cache.names();
        names.sort();
        names
    }

    /// One row per cached plan, sorted by name.
    pub fn entries(&self) -> Vec<PreparedInfo> {
        let mut infos: Vec<PreparedInfo> = self
            .snapshot()
            .into_iter()
            .map(|(key, entry)| {
                let stats = self.cache.stats(&key);
                let plan = &entry.plan;
                PreparedInfo {
                    uses: stats.as_ref().map_or(0, |s| s.use_count),
                    last_use: stats.map(|s| s.last_use),
                    name: key,
                    text: plan.text.clone(),
                    namespace: plan.namespace.clone(),
                    query_context: plan.query_context.clone(),
                    prepared_time: plan.prepared_time,
                    populated: entry.is_populated(),
                    persisted: entry.is_persisted(),
                    stability: plan.stability,
                    implicit: plan.implicit,
                    encoded_size: entry.encoded.len(),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            size: self.cache.size(),
            limit: self.cache.limit(),
            hits,
            misses,
            hit_ratio: if lookups > 0 { hits as f64 / lookups as f64 } else { 0.0 },
            reprepares: self.counters.reprepares.load(Ordering::Relaxed),
            remote_fetches: self.counters.remote_fetches.load(Ordering::Relaxed),
            evictions: self.cache.evictions(),
        }
    }

    pub fn size(&self) -> usize {
        self.cache.size()
    }

    pub fn limit(&self) -> usize {
        self.cache.limit()
    }

    /// Change the capacity; shrinking evicts at once.
    pub fn set_limit(&self, limit: usize) {
        info!(limit, "prepared cache limit changed");
        self.cache.set_limit(limit);
    }

    pub fn stability_mode(&self) -> StabilityMode {
        self.stability.read().mode
    }

    /// Mode that new and recompiled plans are stamped and persisted with.
    /// During a transition this is already the target mode.
    pub(crate) fn write_mode(&self) -> StabilityMode {
        let state = self.stability.read();
        state.target.unwrap_or(state.mode)
    }

    pub fn local_node(&self) -> Option<&str> {
        self.transport.as_deref().map(|t| t.local_node())
    }

    pub fn distributor(&self) -> Option<&Distributor> {
        self.distributor.as_ref()
    }

    /// Seed the cache from a peer through the configured transport.
    pub async fn prime_from_peers(&self, config: &crate::distribution::PrimeConfig) -> PrimeReport {
        match &self.transport {
            Some(transport) => remote_prime(self, transport.as_ref(), config).await,
            None => PrimeReport::default(),
        }
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    pub(crate) fn snapshot(&self) -> Vec<(String, Arc<PreparedEntry>)> {
        let mut snapshot = Vec::with_capacity(self.cache.size());
        self.cache.for_each(|key, entry| {
            snapshot.push((key.to_string(), Arc::clone(entry)));
            true
        });
        snapshot
    }

    fn is_fresh(&self, entry: &PreparedEntry) -> bool {
        entry.is_populated() && entry.plan.metadata_check(self.metadata.as_ref(), entry.checked_at())
    }

    /// Re-check `current` under its entry lock and verify it against
    /// metadata. A plan that fails is marked unpopulated and handed back for
    /// recompiling.
    fn verify_locked(
        &self,
        key: &str,
        current: &Arc<PreparedEntry>,
        metadata_only: bool,
    ) -> Result<Checked, PreparedError> {
        if !current.plan.needs_reprepare() {
            if self.is_fresh(current) {
                return Ok(Checked::Fresh(Arc::clone(current)));
            }
            let counter = self.metadata.change_counter();
            if current.plan.verify(self.metadata.as_ref()) {
                current.mark_populated(counter);
                return Ok(Checked::Fresh(Arc::clone(current)));
            }
            current.populated.store(false, Ordering::Release);
        }

        if metadata_only {
            return Err(PreparedError::Stale(key.to_string()));
        }
        Ok(Checked::Stale(Arc::clone(current)))
    }

    async fn resolve_missing(
        &self,
        key: &str,
        hint: Option<&str>,
        options: &GetOptions,
    ) -> Result<Arc<PreparedEntry>, PreparedError> {
        if let Some(statement) = predefined(key) {
            return self.synthesize(statement);
        }

        if options.remote {
            if let Some(transport) = &self.transport {
                let peer = options.peer.as_deref().or(hint);
                if let Some(peer) = peer.filter(|p| *p != transport.local_node()) {
                    match self.fetch_remote(transport.as_ref(), peer, key).await {
                        Ok(entry) => return Ok(entry),
                        Err(e) => warn!(peer, key, error = %e, "remote plan fetch failed"),
                    }
                }
            }
        }

        Err(PreparedError::NotFound(key.to_string()))
    }

    fn synthesize(&self, statement: &Predefined) -> Result<Arc<PreparedEntry>, PreparedError> {
        let counter = self.metadata.change_counter();
        let plan = self.compile(PlanIdentity {
            name: statement.name.to_string(),
            text: statement.text.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            query_context: String::new(),
            context: CompilationContext::default(),
            stability: self.write_mode(),
            implicit: false,
        })?;
        let entry = Arc::new(PreparedEntry::new(plan, Some(counter))?);

        // A concurrent synthesis may have won; either copy is equivalent.
        self.cache.add(statement.name, Arc::clone(&entry), |_| ConflictAction::Keep);
        debug!(name = statement.name, "synthesized predefined statement");
        Ok(self.cache.get(statement.name).unwrap_or(entry))
    }

    async fn fetch_remote(
        &self,
        transport: &dyn PeerTransport,
        peer: &str,
        key: &str,
    ) -> Result<Arc<PreparedEntry>, PreparedError> {
        let remote_error = |reason: String| PreparedError::RemoteFetch {
            peer: peer.to_string(),
            key: key.to_string(),
            reason,
        };

        let encoded = transport
            .get(peer, key)
            .await
            .map_err(|e| remote_error(e.to_string()))?
            .ok_or_else(|| remote_error("not cached on peer".to_string()))?;

        let (entry, _) = self.insert_encoded(key, &encoded, Origin::Peer).await?;
        self.counters.remote_fetches.fetch_add(1, Ordering::Relaxed);
        debug!(peer, key, "fetched plan from peer");
        Ok(entry)
    }

    pub(crate) async fn insert_encoded(
        &self,
        key: &str,
        encoded: &str,
        origin: Origin,
    ) -> Result<(Arc<PreparedEntry>, AddedPlan), PreparedError> {
        let (entry, added) = match codec::decode_for(key, encoded) {
            Ok(plan) => (
                Arc::new(PreparedEntry::with_encoded(plan, encoded.to_string(), None)),
                AddedPlan::Cached,
            ),
            Err(err @ (PreparedError::Decode(_) | PreparedError::VersionMismatch { .. })) => {
                debug!(key, error = %err, "encoded plan unusable, recompiling from text");
                let header = codec::decode_header(encoded).map_err(|_| err)?;
                codec::check_identity(key, &header.name, &header.query_context)?;

                let counter = self.metadata.change_counter();
                let plan = self.compile(PlanIdentity {
                    namespace: namespace_or_default(&header.namespace).to_string(),
                    name: header.name,
                    text: header.text,
                    query_context: header.query_context,
                    context: header.context.unwrap_or_default(),
                    stability: self.write_mode(),
                    implicit: false,
                })?;
                (Arc::new(PreparedEntry::new(plan, Some(counter))?), AddedPlan::Reprepared)
            }
            Err(e) => return Err(e),
        };

        if origin == Origin::Persisted && added == AddedPlan::Cached {
            entry.set_persisted(true);
        }
        self.install(key, &entry)?;

        if added == AddedPlan::Reprepared {
            self.counters.reprepares.fetch_add(1, Ordering::Relaxed);
            if origin == Origin::Persisted {
                self.persist_entry(key, &entry).await;
            }
        }
        Ok((entry, added))
    }

    fn compile(&self, identity: PlanIdentity) -> Result<Plan, PreparedError> {
        let request = CompileRequest {
            text: &identity.text,
            namespace: &identity.namespace,
            query_context: &identity.query_context,
            context: &identity.context,
        };
        let compiled = self.compiler.compile(&request, self.metadata.as_ref())?;

        Ok(Plan {
            name: identity.name,
            text: identity.text,
            namespace: identity.namespace,
            query_context: identity.query_context,
            context: identity.context,
            plan_version: PLAN_VERSION,
            prepared_time: Some(Utc::now()),
            indexes: compiled.root.indexes(),
            root: compiled.root,
            keyspaces: compiled.keyspaces,
            stability: identity.stability,
            implicit: identity.implicit,
        })
    }

    /// Insert or replace `entry`; an existing entry with different text is a
    /// name collision.
    fn install(&self, key: &str, entry: &Arc<PreparedEntry>) -> Result<AddOutcome, PreparedError> {
        let text = entry.plan.text.as_str();
        let outcome = self.cache.add(key, Arc::clone(entry), |existing| {
            if existing.plan.text == text {
                ConflictAction::Replace
            } else {
                ConflictAction::Ignore
            }
        });

        match outcome {
            AddOutcome::Ignored => Err(PreparedError::NameCollision { name: key.to_string() }),
            outcome => Ok(outcome),
        }
    }

    /// Persist (while stability is on) and distribute a freshly compiled
    /// entry.
    async fn publish(&self, key: &str, entry: &PreparedEntry) {
        self.persist_entry(key, entry).await;
        if let Some(distributor) = &self.distributor {
            distributor.submit(key, &entry.encoded);
        }
    }

    async fn persist_entry(&self, key: &str, entry: &PreparedEntry) {
        let mode = self.write_mode();
        if !mode.is_on() || (entry.plan.implicit && mode != StabilityMode::AdHoc) {
            return;
        }
        match self.store.persist(key, &entry.encoded, mode).await {
            Ok(()) => entry.set_persisted(true),
            Err(e) => warn!(key, store = self.store.name(), error = %e, "cannot persist plan"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
