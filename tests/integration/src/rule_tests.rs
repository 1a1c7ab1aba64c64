//! Governance rule integration tests.
//!
//! Covers the wildcard tiers (backfill and unwinding), the difference
//! between union reads and first-match reads, and per-service rate-limit
//! revisions.

use std::sync::Arc;
use std::time::Duration;

use naming_control::core::memory::table;
use naming_control::core::model::{
    CircuitBreakerRule, L5Route, LaneGroup, RateLimit, RouterRule, Service, ServiceContract,
};
use naming_control::prelude::*;

async fn registry(store: &Arc<MemoryStore>) -> Arc<CacheRegistry> {
    let registry = CacheRegistry::builder()
        .store(Arc::clone(store) as Arc<dyn Store>)
        .revision_workers(2)
        .build()
        .expect("registry should build");
    registry.initialize().expect("registry should initialize");
    registry.update_all().await.expect("first load");
    Arc::new(registry)
}

fn router_rule(id: &str, ns: &str, svc: &str) -> RouterRule {
    RouterRule {
        id: id.into(),
        name: id.into(),
        namespace: ns.into(),
        enable: true,
        config: format!(r#"{{"rules":[{{"sources":[{{"service":"{svc}","namespace":"{ns}"}}]}}]}}"#),
        revision: format!("{id}-rev"),
        valid: true,
        ..Default::default()
    }
}

fn breaker(id: &str, ns: &str, svc: &str) -> CircuitBreakerRule {
    CircuitBreakerRule {
        id: id.into(),
        dst_namespace: ns.into(),
        dst_service: svc.into(),
        enable: true,
        revision: format!("{id}-rev"),
        valid: true,
        ..Default::default()
    }
}

fn rate_limit(id: &str, ns: &str, svc: &str) -> RateLimit {
    RateLimit {
        id: id.into(),
        namespace: ns.into(),
        service: svc.into(),
        revision: format!("{id}-rev"),
        valid: true,
        ..Default::default()
    }
}

// === Wildcard Tier Tests ===

#[tokio::test]
async fn routing_unions_while_breakers_take_first_match() {
    let store = Arc::new(MemoryStore::new());
    for (id, ns, svc) in [("exact", "default", "orders"), ("ns", "default", "*"), ("all", "*", "*")] {
        store.put_router_rule(router_rule(id, ns, svc));
        store.put_circuit_breaker_rule(breaker(id, ns, svc));
    }
    let registry = registry(&store).await;
    let key = ServiceKey::new("default", "orders");

    let routes = registry.routing().unwrap().search_router_rules(&key);
    assert_eq!(routes.ids(), vec!["exact", "ns", "all"]);

    let breakers = registry.circuit_breakers().unwrap().get_circuit_breaker_rules(&key);
    assert_eq!(breakers.ids(), vec!["exact", "ns", "all"]);

    // A service with no exact bucket falls through to its namespace bucket.
    let other = ServiceKey::new("default", "users");
    let breakers = registry.circuit_breakers().unwrap().get_circuit_breaker_rules(&other);
    assert_eq!(breakers.ids(), vec!["ns", "all"]);
    let routes = registry.routing().unwrap().search_router_rules(&other);
    assert_eq!(routes.ids(), vec!["ns", "all"]);

    let elsewhere = ServiceKey::new("prod", "api");
    let breakers = registry.circuit_breakers().unwrap().get_circuit_breaker_rules(&elsewhere);
    assert_eq!(breakers.ids(), vec!["all"]);
    registry.close();
}

#[tokio::test]
async fn wildcard_rule_backfills_later_buckets_and_unwinds() {
    let store = Arc::new(MemoryStore::new());
    let mut global = breaker("global", "*", "*");
    store.put_circuit_breaker_rule(global.clone());
    let registry = registry(&store).await;
    let breakers = registry.circuit_breakers().unwrap();

    store.advance(Duration::from_secs(10));
    store.put_circuit_breaker_rule(breaker("e1", "default", "orders"));
    store.put_circuit_breaker_rule(breaker("n1", "prod", "*"));
    registry.update_all().await.unwrap();

    let orders = ServiceKey::new("default", "orders");
    let prod = ServiceKey::new("prod", "api");
    assert_eq!(breakers.get_circuit_breaker_rules(&orders).ids(), vec!["e1", "global"]);
    assert_eq!(breakers.get_circuit_breaker_rules(&prod).ids(), vec!["n1", "global"]);

    store.advance(Duration::from_secs(10));
    global.valid = false;
    store.put_circuit_breaker_rule(global);
    registry.update_all().await.unwrap();

    assert_eq!(breakers.get_circuit_breaker_rules(&orders).ids(), vec!["e1"]);
    assert_eq!(breakers.get_circuit_breaker_rules(&prod).ids(), vec!["n1"]);
    assert!(breakers.get_circuit_breaker_rules(&ServiceKey::new("dev", "x")).is_empty());
    registry.close();
}

#[tokio::test]
async fn revision_changes_only_for_affected_buckets() {
    let store = Arc::new(MemoryStore::new());
    store.put_circuit_breaker_rule(breaker("a", "default", "orders"));
    store.put_circuit_breaker_rule(breaker("b", "default", "users"));
    let registry = registry(&store).await;
    let breakers = registry.circuit_breakers().unwrap();

    let orders = ServiceKey::new("default", "orders");
    let users = ServiceKey::new("default", "users");
    let users_before = breakers.get_circuit_breaker_rules(&users).revision;
    assert_eq!(users_before, "b-rev");

    store.advance(Duration::from_secs(10));
    store.put_circuit_breaker_rule(breaker("a2", "default", "orders"));
    registry.update_all().await.unwrap();

    assert_ne!(breakers.get_circuit_breaker_rules(&orders).revision, "a-rev");
    assert_eq!(breakers.get_circuit_breaker_rules(&users).revision, users_before);
    registry.close();
}

// === Rate Limit Tests ===

#[tokio::test]
async fn rate_limits_grouped_per_service() {
    let store = Arc::new(MemoryStore::new());
    let mut owned = Vec::new();
    for i in 0..15 {
        let rule = if i < 3 {
            rate_limit(&format!("rl-{i}"), "default", "service-1")
        } else {
            rate_limit(&format!("rl-{i}"), "default", &format!("service-{}", i % 4 + 2))
        };
        if i < 3 {
            owned.push(rule.clone());
        }
        store.put_rate_limit(rule);
    }
    let registry = registry(&store).await;
    let limits = registry.rate_limits().unwrap();

    let key = ServiceKey::new("default", "service-1");
    let set = limits.get_rate_limit_rules(&key);
    assert_eq!(set.len(), 3);
    assert!(!set.revision.is_empty());

    let others: Vec<(ServiceKey, String)> = (2..6)
        .map(|i| {
            let k = ServiceKey::new("default", format!("service-{i}"));
            let rev = limits.get_rate_limit_rules(&k).revision;
            (k, rev)
        })
        .collect();

    store.advance(Duration::from_secs(10));
    let mut removed = owned.remove(0);
    removed.valid = false;
    store.put_rate_limit(removed);
    registry.update_all().await.unwrap();

    let after = limits.get_rate_limit_rules(&key);
    assert_eq!(after.len(), 2);
    assert_ne!(after.revision, set.revision);
    for (k, rev) in others {
        assert_eq!(limits.get_rate_limit_rules(&k).revision, rev);
    }
    assert_eq!(limits.rate_limits_count(), 14);
    registry.close();
}

#[tokio::test]
async fn rate_limit_without_service_name_is_fixed_from_service_cache() {
    let store = Arc::new(MemoryStore::new());
    store.put_service(Service::new("svc-1", "default", "orders"));
    let registry = registry(&store).await;

    store.advance(Duration::from_secs(10));
    let mut rule = rate_limit("rl-1", "", "");
    rule.service_id = "svc-1".into();
    store.put_rate_limit(rule);
    registry.update_all().await.unwrap();

    let limits = registry.rate_limits().unwrap();
    assert_eq!(limits.pending_count(), 0);
    let set = limits.get_rate_limit_rules(&ServiceKey::new("default", "orders"));
    assert_eq!(set.ids(), vec!["rl-1"]);
    registry.close();
}

#[tokio::test]
async fn failing_table_does_not_block_other_caches() {
    let store = Arc::new(MemoryStore::new());
    store.put_rate_limit(rate_limit("rl-1", "default", "orders"));
    store.put_circuit_breaker_rule(breaker("cb-1", "default", "orders"));
    store.fail_next(table::RATE_LIMITS, 1);

    let registry = CacheRegistry::builder()
        .store(Arc::clone(&store) as Arc<dyn Store>)
        .revision_workers(2)
        .build()
        .unwrap();
    registry.initialize().unwrap();

    assert!(registry.update_all().await.is_err());
    assert_eq!(registry.circuit_breakers().unwrap().circuit_breaker_rules_count(), 1);
    assert_eq!(registry.rate_limits().unwrap().rate_limits_count(), 0);

    registry.update_all().await.unwrap();
    assert_eq!(registry.rate_limits().unwrap().rate_limits_count(), 1);
    registry.close();
}

// === Lane, Contract and L5 Tests ===

#[tokio::test]
async fn lane_group_indexed_under_every_named_service() {
    let store = Arc::new(MemoryStore::new());
    store.put_lane_group(LaneGroup {
        id: "lane-1".into(),
        name: "gray".into(),
        rule: r#"{"entries":[{"service":"gateway","namespace":"default"}],
                  "destinations":[{"service":"orders","namespace":"default"}]}"#
            .into(),
        revision: "lane-1-rev".into(),
        valid: true,
        ..Default::default()
    });
    store.put_lane_group(LaneGroup {
        id: "lane-2".into(),
        name: "broken".into(),
        rule: "not json".into(),
        revision: "lane-2-rev".into(),
        valid: true,
        ..Default::default()
    });
    let registry = registry(&store).await;
    let lanes = registry.lanes().unwrap();

    assert_eq!(lanes.lane_groups_count(), 1);
    assert_eq!(lanes.core().stats().records_skipped(), 1);
    for svc in ["gateway", "orders"] {
        let set = lanes.get_lane_rules(&ServiceKey::new("default", svc));
        assert_eq!(set.ids(), vec!["lane-1"]);
    }
    assert!(lanes.get_lane_rules(&ServiceKey::new("default", "users")).is_empty());
    assert_eq!(lanes.get_lane_group("gray").unwrap().id, "lane-1");
    registry.close();
}

#[tokio::test]
async fn contracts_listed_per_service() {
    let store = Arc::new(MemoryStore::new());
    let contract = |id: &str, version: &str| ServiceContract {
        id: id.into(),
        namespace: "default".into(),
        service: "orders".into(),
        name: "orders-api".into(),
        protocol: "http".into(),
        version: version.into(),
        revision: format!("{id}-rev"),
        valid: true,
        ..Default::default()
    };
    store.put_service_contract(contract("c-1", "v1"));
    store.put_service_contract(contract("c-2", "v2"));
    let registry = registry(&store).await;
    let contracts = registry.contracts().unwrap();
    let key = ServiceKey::new("default", "orders");

    let (revision, list) = contracts.list_service_contracts(&key);
    assert_eq!(list.len(), 2);
    let found = contracts.get_service_contract(&key, "orders-api", "http", "v2").unwrap();
    assert_eq!(found.id, "c-2");

    store.advance(Duration::from_secs(10));
    let mut gone = contract("c-1", "v1");
    gone.valid = false;
    store.put_service_contract(gone);
    registry.update_all().await.unwrap();

    let (after, list) = contracts.list_service_contracts(&key);
    assert_eq!(list.len(), 1);
    assert_eq!(after, "c-2-rev");
    assert_ne!(after, revision);
    registry.close();
}

#[tokio::test]
async fn l5_routes_follow_flow() {
    let store = Arc::new(MemoryStore::new());
    let route = |ip: u32, cmd_id: u32, valid: bool| L5Route {
        ip,
        mod_id: 100,
        cmd_id,
        set_id: String::new(),
        valid,
        flow: 0,
    };
    store.put_l5_route(route(1, 1, true));
    store.put_l5_route(route(1, 2, true));
    let registry = registry(&store).await;
    let l5 = registry.l5().unwrap();

    assert!(l5.check_route_exists(1, 100, 1));
    assert_eq!(l5.get_routes_by_ip(1).len(), 2);
    assert_eq!(l5.route_flow(), 2);

    store.put_l5_route(route(1, 1, false));
    registry.update_all().await.unwrap();
    assert!(!l5.check_route_exists(1, 100, 1));
    assert!(l5.check_route_exists(1, 100, 2));
    assert_eq!(l5.route_flow(), 3);
    registry.close();
}
