//! Weighted selection tests for the balanced pool.

use std::collections::HashMap;
use std::sync::Arc;

use dispatch_resilience::dispatcher::{DispatchOptions, Dispatcher};
use dispatch_resilience::error::DispatchError;
use dispatch_resilience::load_balancer::{BalancedPool, BalancedPoolOptions};

mod common;

use common::{member_for, mock_upstream_factory, try_outcome, MockRegistry, ResponseCollector};

const ORIGINS: [&str; 3] = ["http://a.test", "http://b.test", "http://c.test"];

fn balanced(origins: &[&str], capacity: usize) -> (Arc<BalancedPool>, MockRegistry) {
    let (factory, registry) = mock_upstream_factory(capacity);
    let pool = BalancedPool::new(
        origins.iter().copied(),
        BalancedPoolOptions {
            factory: Some(factory),
            ..BalancedPoolOptions::default()
        },
    )
    .unwrap();
    (pool, registry)
}

/// Dispatch `n` requests and report which origin took each one.
fn dispatch_many(pool: &BalancedPool, registry: &MockRegistry, n: usize) -> Vec<String> {
    let mut seen: HashMap<String, usize> = registry
        .lock()
        .unwrap()
        .iter()
        .map(|m| (m.origin().to_string(), m.paths().len()))
        .collect();
    let mut order = Vec::with_capacity(n);
    for i in 0..n {
        let (handler, _rx) = ResponseCollector::new();
        assert!(pool.dispatch(DispatchOptions::get(format!("/{i}")), handler));
        let members = registry.lock().unwrap().clone();
        let picked = members
            .iter()
            .find(|m| m.paths().len() > seen.get(m.origin()).copied().unwrap_or(0))
            .expect("request reached no member");
        *seen.entry(picked.origin().to_string()).or_default() += 1;
        order.push(picked.origin().to_string());
    }
    order
}

#[tokio::test]
async fn test_equal_weights_share_evenly() {
    let (pool, registry) = balanced(&ORIGINS, 1000);

    let order = dispatch_many(&pool, &registry, 6);
    assert_eq!(order, vec![ORIGINS[0], ORIGINS[1], ORIGINS[2], ORIGINS[0], ORIGINS[1], ORIGINS[2]]);

    dispatch_many(&pool, &registry, 294);
    for origin in ORIGINS {
        let share = member_for(&registry, origin).paths().len() as f64 / 300.0;
        assert!((0.30..=0.36).contains(&share), "{origin} share {share}");
    }
}

#[tokio::test]
async fn test_connection_error_penalizes_upstream() {
    let (pool, registry) = balanced(&ORIGINS, 1000);
    dispatch_many(&pool, &registry, 3);

    let a = member_for(&registry, ORIGINS[0]);
    a.connection_error(DispatchError::ConnectionRefused("a.test".into()));

    let weights: HashMap<String, u32> = pool.upstream_weights().into_iter().collect();
    assert!(weights[ORIGINS[0]] < weights[ORIGINS[1]]);
    assert!(weights[ORIGINS[0]] < weights[ORIGINS[2]]);

    let order = dispatch_many(&pool, &registry, 10);
    assert!(order.iter().all(|origin| origin != ORIGINS[0]), "penalized upstream picked: {order:?}");
}

#[tokio::test]
async fn test_no_upstreams_is_missing_upstream() {
    let (pool, _registry) = balanced(&[], 10);
    let (handler, mut rx) = ResponseCollector::new();
    assert!(!pool.dispatch(DispatchOptions::get("/"), handler));
    assert!(matches!(try_outcome(&mut rx), Some(Err(DispatchError::MissingUpstream))));
}

#[tokio::test]
async fn test_add_and_remove_upstream() {
    let (pool, registry) = balanced(&ORIGINS[..1], 10);

    pool.add_upstream("http://b.test/").unwrap();
    pool.add_upstream(ORIGINS[1]).unwrap();
    assert_eq!(pool.upstreams(), vec![ORIGINS[0], ORIGINS[1]]);
    assert_eq!(registry.lock().unwrap().len(), 2);

    pool.remove_upstream(ORIGINS[0]).await.unwrap();
    assert_eq!(pool.upstreams(), vec![ORIGINS[1]]);
    assert!(member_for(&registry, ORIGINS[0]).is_closed());

    let order = dispatch_many(&pool, &registry, 3);
    assert!(order.iter().all(|origin| origin == ORIGINS[1]));

    pool.remove_upstream("http://unknown.test").await.unwrap();
    assert!(pool.add_upstream("not a url").is_err());
}

#[tokio::test]
async fn test_busy_upstream_spills_to_next() {
    let (pool, registry) = balanced(&ORIGINS[..2], 1);

    let order = dispatch_many(&pool, &registry, 2);
    assert_eq!(order, vec![ORIGINS[0], ORIGINS[1]]);

    let (handler, _rx) = ResponseCollector::new();
    assert!(!pool.dispatch(DispatchOptions::get("/queued"), handler));
    assert_eq!(pool.queued(), 1);

    member_for(&registry, ORIGINS[1]).respond(200, "ok");
    assert_eq!(pool.queued(), 0);
    assert_eq!(member_for(&registry, ORIGINS[1]).paths(), vec!["/1", "/queued"]);
}

#[tokio::test]
async fn test_replayed_request_charges_upstream_weight() {
    let (pool, registry) = balanced(&ORIGINS[..2], 1);

    // One full pass: both charged once, then both recovered.
    dispatch_many(&pool, &registry, 2);
    let weights: HashMap<String, u32> = pool.upstream_weights().into_iter().collect();
    assert_eq!(weights[ORIGINS[0]], 100);
    assert_eq!(weights[ORIGINS[1]], 100);

    let (handler, _rx) = ResponseCollector::new();
    assert!(!pool.dispatch(DispatchOptions::get("/queued"), handler));
    member_for(&registry, ORIGINS[1]).respond(200, "ok");
    assert_eq!(pool.queued(), 0);

    let weights: HashMap<String, u32> = pool.upstream_weights().into_iter().collect();
    assert_eq!(weights[ORIGINS[0]], 100);
    assert_eq!(weights[ORIGINS[1]], 99);
}
