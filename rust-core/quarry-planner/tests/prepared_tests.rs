// SPDX-License-Identifier: PMPL-1.0-or-later
//! Integration tests for the prepared plan cache: lookup, eviction,
//! reprepare under concurrency, and remote fetch.

mod support;

use std::sync::Arc;
use std::time::Duration;

use quarry_planner::{
    AddedPlan, CompilationContext, GetOptions, MemoryPlanStore, OptimizerMode, PeerTransport, PlanStore,
    PrepareRequest, PreparedCache, PreparedConfig, PreparedError,
};
use support::{node, node_with, travel_metadata, MockCompiler, MockTransport};

fn local_config(limit: usize) -> PreparedConfig {
    PreparedConfig {
        limit,
        distribute: false,
        ..PreparedConfig::default()
    }
}

/// Encoded form of `text` prepared as `name` on a throwaway node.
async fn encoded_elsewhere(name: &str, text: &str) -> String {
    let source = node(local_config(16));
    source
        .cache
        .prepare(PrepareRequest::named(name, text))
        .await
        .expect("source prepare");
    source.cache.encoded(name).expect("source holds plan")
}

/// Rewrite one top-level field of an encoded envelope.
fn tamper(encoded: &str, field: &str, value: serde_json::Value) -> String {
    let mut envelope: serde_json::Value = serde_json::from_str(encoded).expect("envelope is JSON");
    envelope[field] = value;
    envelope.to_string()
}

// -- Test 1: Re-preparing a taken name with different text --

#[tokio::test]
async fn test_name_collision_keeps_original() {
    let n = node(local_config(16));
    n.cache
        .prepare(PrepareRequest::named("p1", "SELECT * FROM travel"))
        .await
        .unwrap();

    // Same text under the same name simply replaces.
    n.cache
        .prepare(PrepareRequest::named("p1", "SELECT * FROM travel"))
        .await
        .expect("identical re-prepare succeeds");

    let err = n
        .cache
        .prepare(PrepareRequest::named("p1", "SELECT * FROM hotels"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, PreparedError::NameCollision { ref name } if name == "p1"),
        "expected a name collision, got {err:?}"
    );

    let plan = n.cache.get_plan("p1", &GetOptions::local()).await.unwrap();
    assert_eq!(plan.text, "SELECT * FROM travel", "original plan must survive the collision");
}

// -- Test 2: A cache of one evicts the older plan --

#[tokio::test]
async fn test_limit_one_evicts_oldest() {
    let n = node(local_config(1));
    n.cache.prepare(PrepareRequest::named("p1", "SELECT * FROM travel")).await.unwrap();
    n.cache.prepare(PrepareRequest::named("p2", "SELECT * FROM hotels")).await.unwrap();

    assert_eq!(n.cache.size(), 1);
    assert_eq!(n.cache.names(), vec!["p2"]);
    assert!(matches!(
        n.cache.get_plan("p1", &GetOptions::local()).await,
        Err(PreparedError::NotFound(_))
    ));
    assert_eq!(n.cache.stats().evictions, 1);
}

// -- Test 3: Shrinking the limit evicts at once --

#[tokio::test]
async fn test_set_limit_shrinks() {
    let n = node(local_config(0));
    for i in 0..10 {
        n.cache
            .prepare(PrepareRequest::named(format!("p{i}"), format!("SELECT {i}")))
            .await
            .unwrap();
    }
    assert_eq!(n.cache.size(), 10, "limit zero is unbounded");

    n.cache.set_limit(4);
    assert_eq!(n.cache.size(), 4);
    assert_eq!(n.cache.limit(), 4);
}

// -- Test 4: Unknown names never compile anything --

#[tokio::test]
async fn test_unknown_name_is_not_found_without_compiling() {
    let n = node(local_config(16));
    let err = n.cache.get_plan("never_prepared", &GetOptions::default()).await.unwrap_err();

    assert!(matches!(err, PreparedError::NotFound(ref name) if name == "never_prepared"));
    assert_eq!(n.compiler.calls(), 0, "a miss must not reach the compiler");
    let stats = n.cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.reprepares, 0);
}

// -- Test 5: Derived names are stable and context sensitive --

#[tokio::test]
async fn test_derived_names() {
    let n = node(local_config(16));
    let a = n.cache.prepare(PrepareRequest::new("SELECT * FROM travel")).await.unwrap();
    let b = n.cache.prepare(PrepareRequest::new("SELECT * FROM travel")).await.unwrap();
    assert_eq!(a.name, b.name, "same text and context must derive the same name");
    assert_eq!(n.cache.size(), 1);

    let cost_based = CompilationContext {
        optimizer: OptimizerMode::CostBased,
        ..CompilationContext::default()
    };
    let c = n
        .cache
        .prepare(PrepareRequest::new("SELECT * FROM travel").with_context(cost_based))
        .await
        .unwrap();
    assert_ne!(a.name, c.name, "a different optimizer must derive a different name");

    let d = n
        .cache
        .prepare(PrepareRequest::new("SELECT * FROM travel").with_query_context("default:travel"))
        .await
        .unwrap();
    assert!(d.name.ends_with("(default:travel)"));
    assert_eq!(n.cache.size(), 3);
}

// -- Test 6: Dropping an index the plan uses forces a reprepare --

#[tokio::test]
async fn test_dropped_index_reprepares() {
    let n = node(local_config(16));
    n.cache
        .prepare(PrepareRequest::named("by_city", "SELECT * FROM travel USE INDEX (by_city)"))
        .await
        .unwrap();

    n.metadata.drop_index("travel", "by_city");
    let err = n.cache.get_plan("by_city", &GetOptions::local()).await.unwrap_err();
    assert!(
        matches!(err, PreparedError::Reprepare(_)),
        "recompiling against a missing index must fail, got {err:?}"
    );

    n.metadata.create_index("travel", "by_city");
    let plan = n.cache.get_plan("by_city", &GetOptions::local()).await.unwrap();
    assert_eq!(plan.indexes.len(), 1);
    assert_eq!(n.cache.stats().reprepares, 1);
}

// -- Test 7: Unrelated metadata changes do not reprepare --

#[tokio::test]
async fn test_unrelated_change_keeps_plan() {
    let n = node(local_config(16));
    let before = n.cache.prepare(PrepareRequest::named("p1", "SELECT * FROM travel")).await.unwrap();

    n.metadata.create_index("hotels", "by_stars");
    let after = n.cache.get_plan("p1", &GetOptions::local()).await.unwrap();

    assert!(Arc::ptr_eq(&before, &after), "the plan must be reused as is");
    assert_eq!(n.compiler.calls(), 1);
}

// -- Test 8: Concurrent lookups of one stale plan may race to reprepare --

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stale_lookups_all_succeed() {
    let compiler = Arc::new(MockCompiler::slow(Duration::from_millis(50)));
    let metadata = travel_metadata();
    let cache = Arc::new(
        PreparedCache::builder(compiler.clone(), metadata.clone())
            .config(local_config(16))
            .build()
            .unwrap(),
    );
    cache.prepare(PrepareRequest::named("p1", "SELECT * FROM travel")).await.unwrap();
    assert_eq!(compiler.calls(), 1);

    metadata.create_index("travel", "by_country");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        tasks.push(tokio::spawn(async move {
            cache.get_plan("p1", &GetOptions::local()).await
        }));
    }
    for task in tasks {
        let plan = task.await.expect("task joins").expect("lookup succeeds");
        assert_eq!(plan.name, "p1");
    }

    // Racing callers may each recompile; the last add wins.
    let reprepares = cache.stats().reprepares;
    assert!((1..=8).contains(&reprepares), "got {reprepares} reprepares");
    assert_eq!(compiler.calls() as u64, 1 + reprepares);

    // Whichever copy won is fresh.
    cache.get_plan("p1", &GetOptions::local()).await.unwrap();
    assert_eq!(compiler.calls() as u64, 1 + reprepares);
    assert_eq!(cache.size(), 1);
}

// -- Test 9: Lookups on different keys proceed during a reprepare --

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_other_keys_not_blocked_by_reprepare() {
    let compiler = Arc::new(MockCompiler::slow(Duration::from_millis(200)));
    let metadata = travel_metadata();
    let cache = Arc::new(
        PreparedCache::builder(compiler.clone(), metadata.clone())
            .config(local_config(16))
            .build()
            .unwrap(),
    );
    cache.prepare(PrepareRequest::named("slow", "SELECT * FROM travel")).await.unwrap();
    cache.prepare(PrepareRequest::named("fast", "SELECT * FROM hotels")).await.unwrap();

    metadata.create_index("travel", "by_country");
    let reprepare = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.get_plan("slow", &GetOptions::local()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = std::time::Instant::now();
    cache.get_plan("fast", &GetOptions::local()).await.unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(150),
        "lookup of an unrelated key waited on a reprepare"
    );

    reprepare.await.unwrap().unwrap();
}

// -- Test 10: A node hint triggers a fetch from that peer --

#[tokio::test]
async fn test_remote_fetch_via_node_hint() {
    let encoded = encoded_elsewhere("p1", "SELECT * FROM travel").await;
    let transport = Arc::new(MockTransport::new("n1", &["n1", "n2"]));
    transport.hold("n2", "p1", &encoded);

    let n = node_with(local_config(16), None, Some(transport.clone() as Arc<dyn PeerTransport>));
    let plan = n.cache.get_plan("[n2]p1", &GetOptions::default()).await.unwrap();

    assert_eq!(plan.name, "p1");
    assert_eq!(n.compiler.calls(), 0, "a decodable peer plan is used without compiling");
    assert!(n.cache.contains("p1"));
    assert_eq!(n.cache.stats().remote_fetches, 1);

    // Now local.
    n.cache.get_plan("[n2]p1", &GetOptions::default()).await.unwrap();
    assert_eq!(transport.gets(), 1);
}

// -- Test 11: Explicit peer overrides the hint --

#[tokio::test]
async fn test_remote_fetch_explicit_peer() {
    let encoded = encoded_elsewhere("p1", "SELECT * FROM travel").await;
    let transport = Arc::new(MockTransport::new("n1", &["n1", "n2", "n3"]));
    transport.hold("n3", "p1", &encoded);

    let n = node_with(local_config(16), None, Some(transport as Arc<dyn PeerTransport>));
    let options = GetOptions {
        peer: Some("n3".to_string()),
        ..GetOptions::default()
    };
    let plan = n.cache.get_plan("[n2]p1", &options).await.unwrap();
    assert_eq!(plan.text, "SELECT * FROM travel");
}

// -- Test 12: Failed or pointless remote fetches degrade to NotFound --

#[tokio::test]
async fn test_remote_fetch_failures_are_not_found() {
    let transport = Arc::new(MockTransport::new("n1", &["n1", "n2", "n3"]));
    transport.set_unreachable("n2");
    let n = node_with(local_config(16), None, Some(transport.clone() as Arc<dyn PeerTransport>));

    // Peer unreachable.
    assert!(matches!(
        n.cache.get_plan("[n2]p1", &GetOptions::default()).await,
        Err(PreparedError::NotFound(_))
    ));
    // Peer reachable but does not hold the plan.
    assert!(matches!(
        n.cache.get_plan("[n3]p1", &GetOptions::default()).await,
        Err(PreparedError::NotFound(_))
    ));
    assert_eq!(transport.gets(), 2);

    // Hint names this node, and remote disabled: no fetch attempted.
    n.cache.get_plan("[n1]p1", &GetOptions::default()).await.unwrap_err();
    n.cache.get_plan("[n3]p1", &GetOptions::local()).await.unwrap_err();
    assert_eq!(transport.gets(), 2);
    assert_eq!(n.cache.stats().remote_fetches, 0);
}

// -- Test 13: Encoded plans with an unusable body are recompiled --

#[tokio::test]
async fn test_add_encoded_recovers_from_corrupt_body() {
    let encoded = encoded_elsewhere("p1", "SELECT * FROM travel").await;
    let n = node(local_config(16));

    let corrupt = tamper(&encoded, "plan", serde_json::json!("!!not base64!!"));
    assert_eq!(n.cache.add_encoded("p1", &corrupt).await.unwrap(), AddedPlan::Reprepared);
    assert_eq!(n.compiler.calls(), 1);

    let plan = n.cache.get_plan("p1", &GetOptions::local()).await.unwrap();
    assert_eq!(plan.text, "SELECT * FROM travel");
    assert_eq!(n.cache.stats().reprepares, 1);
}

// -- Test 14: Plans from a newer encoding are recompiled --

#[tokio::test]
async fn test_add_encoded_newer_version_recompiles() {
    let encoded = encoded_elsewhere("p1", "SELECT * FROM hotels").await;
    let n = node(local_config(16));

    let newer = tamper(&encoded, "version", serde_json::json!(99));
    assert_eq!(n.cache.add_encoded("p1", &newer).await.unwrap(), AddedPlan::Reprepared);
    assert!(n.cache.contains("p1"));
}

// -- Test 15: Unreadable envelopes and identity mismatches are rejected --

#[tokio::test]
async fn test_add_encoded_rejects_garbage() {
    let encoded = encoded_elsewhere("p1", "SELECT * FROM travel").await;
    let n = node(local_config(16));

    assert!(matches!(
        n.cache.add_encoded("p1", "not json at all").await,
        Err(PreparedError::Decode(_))
    ));

    let corrupt = tamper(&encoded, "plan", serde_json::json!("AAAA"));
    assert!(matches!(
        n.cache.add_encoded("p9", &corrupt).await,
        Err(PreparedError::EncodingMismatch { .. })
    ));
    assert_eq!(n.cache.size(), 0);
    assert_eq!(n.compiler.calls(), 0);
}

// -- Test 16: Ad-hoc mode caches unnamed statements implicitly --

#[tokio::test]
async fn test_adhoc_mode_caches_implicitly() {
    let store: Arc<dyn PlanStore> = Arc::new(MemoryPlanStore::new());
    let config = PreparedConfig {
        stability: quarry_planner::StabilityMode::AdHoc,
        ..local_config(16)
    };
    let n = node_with(config, Some(store), None);
    let ctx = CompilationContext::default();

    let first = n.cache.adhoc_plan("SELECT * FROM travel", "", "", &ctx).await.unwrap();
    let second = n.cache.adhoc_plan("SELECT * FROM travel", "", "", &ctx).await.unwrap();

    assert!(first.implicit);
    assert!(Arc::ptr_eq(&first, &second), "the second ad-hoc request is served from the cache");
    assert_eq!(n.compiler.calls(), 1);

    let infos = n.cache.entries();
    assert_eq!(infos.len(), 1);
    assert!(infos[0].implicit);
    assert!(infos[0].persisted);
}

// -- Test 17: Stats track hits, misses and the hit ratio --

#[tokio::test]
async fn test_stats_hit_ratio() {
    let n = node(local_config(16));
    n.cache.prepare(PrepareRequest::named("p1", "SELECT 1")).await.unwrap();
    for _ in 0..3 {
        n.cache.get_plan("p1", &GetOptions::local()).await.unwrap();
    }
    n.cache.get_plan("p2", &GetOptions::local()).await.unwrap_err();

    let stats = n.cache.stats();
    assert_eq!(stats.hits, 3);
    assert_eq!(stats.misses, 1);
    assert!((stats.hit_ratio - 0.75).abs() < f64::EPSILON);
    assert_eq!(stats.size, 1);
    assert_eq!(stats.limit, 16);
}

// -- Test 18: Lookups in sequence after a change reprepare exactly once --

#[tokio::test]
async fn test_sequential_lookups_reprepare_once() {
    let n = node(local_config(16));
    n.cache.prepare(PrepareRequest::named("p1", "SELECT * FROM travel")).await.unwrap();

    n.metadata.create_index("travel", "by_country");
    for _ in 0..3 {
        n.cache.get_plan("p1", &GetOptions::local()).await.unwrap();
    }

    assert_eq!(n.compiler.calls(), 2);
    assert_eq!(n.cache.stats().reprepares, 1);
}

// -- Test 19: Reading a plan's encoded form does not wait on its reprepare --

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_encoded_not_blocked_by_reprepare() {
    let compiler = Arc::new(MockCompiler::slow(Duration::from_millis(300)));
    let metadata = travel_metadata();
    let cache = Arc::new(
        PreparedCache::builder(compiler.clone(), metadata.clone())
            .config(local_config(16))
            .build()
            .unwrap(),
    );
    cache.prepare(PrepareRequest::named("slow", "SELECT * FROM travel")).await.unwrap();
    let before = cache.encoded("slow").unwrap();

    metadata.create_index("travel", "by_country");
    let reprepare = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.get_plan("slow", &GetOptions::local()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let started = std::time::Instant::now();
    let during = cache.encoded("slow");
    let stats = cache.entries();
    assert!(
        started.elapsed() < Duration::from_millis(150),
        "passive reads of the key waited on its recompile"
    );
    assert_eq!(during, Some(before.clone()), "the old plan is served until the new one lands");
    assert_eq!(stats.len(), 1);

    reprepare.await.unwrap().unwrap();
    assert_ne!(cache.encoded("slow"), Some(before));
}

// -- Test 20: User names with parentheses travel between nodes --

#[tokio::test]
async fn test_parenthesized_name_moves_between_nodes() {
    let encoded = encoded_elsewhere("q(1)", "SELECT * FROM travel").await;
    let n = node(local_config(16));

    assert_eq!(n.cache.add_encoded("q(1)", &encoded).await.unwrap(), AddedPlan::Cached);
    let plan = n.cache.get_plan("q(1)", &GetOptions::local()).await.unwrap();
    assert_eq!(plan.query_context, "");
    assert_eq!(n.compiler.calls(), 0);
}
