//! Circuit-breaker rule cache.
//!
//! Rules are indexed by their destination service in a [`RuleContainer`].
//! Lookups are first-match: the exact service's bucket if one exists, else
//! the namespace bucket, else the global bucket.

use std::sync::Arc;

use async_trait::async_trait;
use naming_core::model::CircuitBreakerRule;
use naming_core::{max_modify_time, Result, ServiceKey, Store};
use tracing::debug;

use crate::base::{PullOutcome, UpdateCore, UpdateSummary};
use crate::config::CacheConfig;
use crate::container::{RuleContainer, RuleSet};
use crate::registry::{CacheIndex, ResourceCache};

const LABEL: &str = "circuit_breaker";

/// The circuit-breaker rule cache.
#[derive(Debug)]
pub struct CircuitBreakerCache {
    core: UpdateCore,
    rules: RuleContainer<CircuitBreakerRule>,
}

impl CircuitBreakerCache {
    /// Create an empty cache.
    pub fn new(store: Arc<dyn Store>, config: Arc<CacheConfig>) -> Self {
        Self {
            core: UpdateCore::new(CacheIndex::CircuitBreaker.name(), store, config),
            rules: RuleContainer::new(),
        }
    }

    async fn pull(&self) -> Result<PullOutcome> {
        let rules = self
            .core
            .store()
            .get_more_circuit_breaker_rules(self.core.last_fetch_time(), self.core.is_first_update())
            .await?;
        let outcome = PullOutcome::single(LABEL, max_modify_time(&rules), rules.len());

        for rule in rules {
            if rule.valid {
                let target = rule.target();
                self.rules.upsert(Arc::new(rule), vec![target]);
            } else if self.rules.remove(&rule.id).is_some() {
                debug!(cache = LABEL, rule = %rule.id, "rule removed");
            }
        }
        Ok(outcome)
    }

    /// Rules effective for `key`, with the revision of that set.
    pub fn get_circuit_breaker_rules(&self, key: &ServiceKey) -> RuleSet<CircuitBreakerRule> {
        self.rules.first_match(key)
    }

    /// Look up a rule by ID.
    pub fn get_circuit_breaker_rule(&self, id: &str) -> Option<Arc<CircuitBreakerRule>> {
        self.rules.get(id)
    }

    /// Number of cached rules.
    pub fn circuit_breaker_rules_count(&self) -> usize {
        self.rules.len()
    }
}

#[async_trait]
impl ResourceCache for CircuitBreakerCache {
    fn index(&self) -> CacheIndex {
        CacheIndex::CircuitBreaker
    }

    async fn update(&self) -> Result<UpdateSummary> {
        self.core.update(|| self.pull()).await.result
    }

    fn clear(&self) {
        self.rules.clear();
        self.core.clear();
    }

    fn core(&self) -> &UpdateCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use naming_core::MemoryStore;
    use std::time::Duration;

    fn rule(id: &str, ns: &str, svc: &str) -> CircuitBreakerRule {
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

    #[tokio::test]
    async fn global_rule_backfills_and_unwinds() {
        let store = Arc::new(MemoryStore::new());
        let mut global = rule("g", "*", "*");
        store.put_circuit_breaker_rule(global.clone());

        let cache = CircuitBreakerCache::new(Arc::clone(&store) as Arc<dyn Store>, Arc::new(CacheConfig::default()));
        cache.update().await.unwrap();

        store.advance(Duration::from_secs(10));
        store.put_circuit_breaker_rule(rule("e", "default", "orders"));
        cache.update().await.unwrap();

        let key = ServiceKey::new("default", "orders");
        assert_eq!(cache.get_circuit_breaker_rules(&key).ids(), vec!["e", "g"]);

        store.advance(Duration::from_secs(10));
        global.valid = false;
        store.put_circuit_breaker_rule(global);
        cache.update().await.unwrap();

        assert_eq!(cache.get_circuit_breaker_rules(&key).ids(), vec!["e"]);
        assert_eq!(cache.circuit_breaker_rules_count(), 1);
    }

    #[tokio::test]
    async fn first_match_prefers_most_specific_bucket() {
        let store = Arc::new(MemoryStore::new());
        store.put_circuit_breaker_rule(rule("e", "default", "orders"));
        store.put_circuit_breaker_rule(rule("n", "prod", "*"));

        let cache = CircuitBreakerCache::new(Arc::clone(&store) as Arc<dyn Store>, Arc::new(CacheConfig::default()));
        cache.update().await.unwrap();

        assert_eq!(cache.get_circuit_breaker_rules(&ServiceKey::new("default", "orders")).ids(), vec!["e"]);
        assert_eq!(cache.get_circuit_breaker_rules(&ServiceKey::new("prod", "api")).ids(), vec!["n"]);
        assert!(cache.get_circuit_breaker_rules(&ServiceKey::new("dev", "api")).is_empty());
    }
}
