// SPDX-License-Identifier: PMPL-1.0-or-later
//! Best-effort plan distribution between nodes.
//!
//! Successful compiles are pushed to every other cluster member through a
//! bounded queue drained by one background task. Pushes are at most once: a
//! full queue drops the push and a failed send is only logged. A node that
//! misses a push fetches the plan on demand (see `PreparedCache::get_plan`)
//! or seeds itself at startup with [`remote_prime`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::prepared::{AddedPlan, PreparedCache};

/// Node-to-node plan exchange.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Name other members know this node by.
    fn local_node(&self) -> &str;

    /// Current cluster members including this node, or `None` while
    /// membership is not yet known.
    async fn members(&self) -> Option<Vec<String>>;

    /// Push an encoded plan to `peer`.
    async fn put(&self, peer: &str, key: &str, encoded: &str) -> Result<(), TransportError>;

    /// Names of the plans `peer` holds whose key starts with `prefix`.
    async fn list(&self, peer: &str, prefix: &str) -> Result<Vec<String>, TransportError>;

    /// Fetch one encoded plan from `peer`.
    async fn get(&self, peer: &str, key: &str) -> Result<Option<String>, TransportError>;
}

struct Push {
    key: String,
    encoded: String,
}

/// Handle to the background distribution worker.
///
/// Dropping the handle closes the queue; the worker finishes the pushes
/// already queued and exits.
pub struct Distributor {
    tx: mpsc::Sender<Push>,
    dropped: AtomicU64,
    worker: JoinHandle<()>,
}

impl Distributor {
    /// Start the worker. Must be called inside a tokio runtime.
    ///
    /// `capacity` is clamped to at least one.
    pub fn spawn(transport: Arc<dyn PeerTransport>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(transport, rx));
        Self {
            tx,
            dropped: AtomicU64::new(0),
            worker,
        }
    }

    /// Queue a push without waiting. Returns `false` if it was dropped.
    pub fn submit(&self, key: &str, encoded: &str) -> bool {
        let push = Push {
            key: key.to_string(),
            encoded: encoded.to_string(),
        };
        match self.tx.try_send(push) {
            Ok(()) => true,
            Err(TrySendError::Full(push)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(key = %push.key, "distribution queue full, dropping plan push");
                false
            }
            Err(TrySendError::Closed(push)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(key = %push.key, "distribution worker stopped, dropping plan push");
                false
            }
        }
    }

    /// Pushes dropped since start.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the worker to drain it.
    pub async fn shutdown(self) {
        let Distributor { tx, worker, .. } = self;
        drop(tx);
        if let Err(e) = worker.await {
            warn!(error = %e, "distribution worker ended abnormally");
        }
    }
}

async fn run_worker(transport: Arc<dyn PeerTransport>, mut rx: mpsc::Receiver<Push>) {
    while let Some(push) = rx.recv().await {
        let Some(members) = transport.members().await else {
            debug!(key = %push.key, "membership unknown, skipping plan push");
            continue;
        };

        for peer in members.iter().filter(|m| m.as_str() != transport.local_node()) {
            match transport.put(peer, &push.key, &push.encoded).await {
                Ok(()) => debug!(peer = %peer, key = %push.key, "pushed plan"),
                Err(e) => warn!(peer = %peer, key = %push.key, error = %e, "plan push failed"),
            }
        }
    }
    debug!("distribution worker stopped");
}

// ---------------------------------------------------------------------------
// Remote prime
// ---------------------------------------------------------------------------

/// Timing for [`remote_prime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeConfig {
    /// How long to wait for membership to become known.
    pub membership_wait: Duration,
    /// Delay between membership polls.
    pub poll_interval: Duration,
}

impl Default for PrimeConfig {
    fn default() -> Self {
        Self {
            membership_wait: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Outcome of a remote prime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimeReport {
    /// Peer the cache was seeded from, if any yielded plans.
    pub peer: Option<String>,
    /// Plans added to the local cache.
    pub primed: usize,
    /// Plans that could not be fetched or added.
    pub failed: usize,
    /// Of the primed plans, those recompiled from text because the encoded
    /// body was unusable.
    pub reprepared: usize,
}

/// Seed `cache` from a peer at startup.
///
/// Waits up to `config.membership_wait` for membership, then tries the other
/// members in random order until one yields at least one plan. Keys already
/// cached locally are skipped. Never fails; problems are logged and counted.
pub async fn remote_prime(
    cache: &PreparedCache,
    transport: &dyn PeerTransport,
    config: &PrimeConfig,
) -> PrimeReport {
    let mut report = PrimeReport::default();

    let deadline = Instant::now() + config.membership_wait;
    let members = loop {
        if let Some(members) = transport.members().await {
            break members;
        }
        if Instant::now() >= deadline {
            info!("cluster membership unknown, skipping remote prime");
            return report;
        }
        sleep(config.poll_interval).await;
    };

    let mut peers: Vec<String> = members
        .into_iter()
        .filter(|m| m.as_str() != transport.local_node())
        .collect();
    if peers.is_empty() {
        info!("standalone node, nothing to prime from");
        return report;
    }
    peers.shuffle(&mut rand::thread_rng());

    for peer in peers {
        let keys = match transport.list(&peer, "").await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(peer = %peer, error = %e, "cannot list peer plans");
                continue;
            }
        };

        let mut primed_here = 0;
        for key in keys {
            if cache.contains(&key) {
                continue;
            }
            let encoded = match transport.get(&peer, &key).await {
                Ok(Some(encoded)) => encoded,
                // Deleted on the peer since listing.
                Ok(None) => continue,
                Err(e) => {
                    warn!(peer = %peer, key = %key, error = %e, "cannot fetch peer plan");
                    report.failed += 1;
                    continue;
                }
            };

            match cache.add_encoded(&key, &encoded).await {
                Ok(added) => {
                    primed_here += 1;
                    if added == AddedPlan::Reprepared {
                        report.reprepared += 1;
                    }
                }
                Err(e) => {
                    warn!(peer = %peer, key = %key, error = %e, "cannot add peer plan");
                    report.failed += 1;
                }
            }
        }

        if primed_here > 0 {
            report.primed = primed_here;
            info!(peer = %peer, primed = report.primed, failed = report.failed, "primed plan cache");
            report.peer = Some(peer);
            break;
        }
    }

    report
}
