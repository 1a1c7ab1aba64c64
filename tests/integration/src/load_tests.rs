//! Load tests for naming-cache with thousands of records.
//!
//! These tests verify the caches hold up under volume and contention:
//! - 1000 services with 10 instances each
//! - Many concurrent `update` callers sharing pulls
//! - Readers running while rules churn
//! - Incremental pulls staying small after a large first load
//!
//! Run with: `cargo test --package naming-integration-tests --test load_tests -- --nocapture`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use naming_control::cache::CircuitBreakerCache;
use naming_control::core::memory::table;
use naming_control::core::model::{CircuitBreakerRule, Instance, Service};
use naming_control::prelude::*;
use tokio::sync::Barrier;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn breaker(id: usize, service: usize) -> CircuitBreakerRule {
    CircuitBreakerRule {
        id: format!("cb-{id}"),
        dst_namespace: "default".into(),
        dst_service: format!("svc-{service}"),
        enable: true,
        revision: format!("cb-{id}-rev-{}", id % 7),
        valid: true,
        ..Default::default()
    }
}

fn populate(store: &MemoryStore, services: usize, per_service: usize) {
    for s in 0..services {
        let ns = if s % 2 == 0 { "default" } else { "prod" };
        store.put_service(Service::new(format!("svc-{s}"), ns, format!("service-{s}")));
        for i in 0..per_service {
            let mut instance = Instance::new(
                format!("ins-{s}-{i}"),
                format!("svc-{s}"),
                format!("10.{}.{}.{}", s / 256, s % 256, i),
                8080,
            );
            instance.namespace = ns.into();
            instance.healthy = i % 5 != 0;
            store.put_instance(instance);
        }
    }
}

/// Test a first load of 1000 services and 10000 instances.
#[tokio::test]
async fn test_1000_services_10000_instances() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    populate(&store, 1000, 10);

    let registry = CacheRegistry::builder()
        .store(Arc::clone(&store) as Arc<dyn Store>)
        .build()
        .expect("registry should build");
    registry.initialize().expect("registry should initialize");

    let start = Instant::now();
    registry.update_all().await.unwrap();
    let load_duration = start.elapsed();
    println!("First load of 1000 services / 10000 instances in {:?}", load_duration);

    let services = registry.services().unwrap();
    let instances = registry.instances().unwrap();
    assert_eq!(services.services_count(), 1000);
    assert_eq!(instances.instances_count(), 10_000);
    assert_eq!(instances.services_with_instances(), 1000);

    let count = instances.get_instance_count("svc-0").unwrap();
    assert_eq!(count.total, 10);
    assert_eq!(count.healthy, 8);

    let default = services.get_namespace_count("default").unwrap();
    assert_eq!(default.service_count, 500);
    assert_eq!(default.instance_count.total, 5000);

    let start = Instant::now();
    for s in 0..1000 {
        let ns = if s % 2 == 0 { "default" } else { "prod" };
        assert!(services.get_service_by_name(ns, &format!("service-{s}")).is_some());
    }
    let get_duration = start.elapsed();
    println!(
        "Looked up 1000 services by name in {:?} ({:.2} µs/op)",
        get_duration,
        get_duration.as_micros() as f64 / 1000.0
    );

    registry.close();
}

/// Test that an incremental pull after a large load only carries the delta.
#[tokio::test]
async fn test_incremental_pull_after_large_load() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    populate(&store, 200, 10);

    let registry = CacheRegistry::builder()
        .store(Arc::clone(&store) as Arc<dyn Store>)
        .build()
        .unwrap();
    registry.initialize().unwrap();
    // Move the store clock past the skew window so the next pull only sees
    // records written after the full load.
    store.advance(Duration::from_secs(10));
    registry.update_all().await.unwrap();

    store.advance(Duration::from_secs(5));
    for i in 0..10 {
        let mut instance = Instance::new(format!("ins-new-{i}"), "svc-0", "10.9.9.9", 9000 + i);
        instance.namespace = "default".into();
        store.put_instance(instance);
    }

    let instances = registry.instances().unwrap();
    let start = Instant::now();
    let summary = instances.update().await.unwrap();
    println!("Incremental pull of {} instances in {:?}", summary.total, start.elapsed());

    assert_eq!(summary.total, 10);
    assert_eq!(instances.instances_count(), 2010);
    assert_eq!(instances.get_instance_count("svc-0").unwrap().total, 20);
    registry.close();
}

/// Test that many concurrent callers share store round trips.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_update_callers() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    for i in 0..1000 {
        store.put_circuit_breaker_rule(breaker(i, i % 100));
    }
    store.set_latency(Some(Duration::from_millis(20)));

    let cache = Arc::new(CircuitBreakerCache::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(CacheConfig::default()),
    ));
    let num_tasks = 50;
    let barrier = Arc::new(Barrier::new(num_tasks));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..num_tasks {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            cache.update().await
        }));
    }
    for handle in handles {
        handle.await.expect("Task panicked").expect("update failed");
    }
    let duration = start.elapsed();

    let pulls = store.pull_count(table::CIRCUIT_BREAKERS);
    let stats = cache.core().stats();
    println!(
        "{} concurrent updates in {:?}: {} pulls, {} coalesced",
        num_tasks,
        duration,
        pulls,
        stats.updates_coalesced()
    );

    assert!(pulls < num_tasks);
    assert_eq!(stats.updates_run() + stats.updates_coalesced(), num_tasks as u64);
    assert_eq!(stats.updates_run() as usize, pulls);
    assert_eq!(cache.circuit_breaker_rules_count(), 1000);
}

/// Stress test: readers never observe a torn rule set while rules churn.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_during_updates() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    for i in 0..100 {
        store.put_circuit_breaker_rule(breaker(i, i % 10));
    }
    let cache = Arc::new(CircuitBreakerCache::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::new(CacheConfig::default()),
    ));
    cache.update().await.unwrap();

    let num_readers = 8;
    let rounds = 50;
    let barrier = Arc::new(Barrier::new(num_readers + 1));
    let read_count = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();
    for reader in 0..num_readers {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        let read_count = Arc::clone(&read_count);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            for i in 0..2000 {
                let key = ServiceKey::new("default", format!("svc-{}", (reader + i) % 10));
                let set = cache.get_circuit_breaker_rules(&key);
                // Every service keeps at least its ten original rules.
                assert!(set.len() >= 10);
                assert!(!set.revision.is_empty());
                read_count.fetch_add(1, Ordering::Relaxed);
                if i % 100 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    let writer = {
        let cache = Arc::clone(&cache);
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move {
            barrier.wait().await;
            for round in 0..rounds {
                store.advance(Duration::from_secs(1));
                let mut extra = breaker(1000 + round, round % 10);
                store.put_circuit_breaker_rule(extra.clone());
                cache.update().await.unwrap();

                store.advance(Duration::from_secs(1));
                extra.valid = false;
                store.put_circuit_breaker_rule(extra);
                cache.update().await.unwrap();
            }
        })
    };

    let start = Instant::now();
    writer.await.expect("Writer panicked");
    for handle in handles {
        handle.await.expect("Reader panicked");
    }
    let duration = start.elapsed();

    println!(
        "Concurrent reads during {} update rounds: {} reads in {:?}",
        rounds,
        read_count.load(Ordering::Relaxed),
        duration
    );
    assert_eq!(cache.circuit_breaker_rules_count(), 100);
}
