//! Routing cache.
//!
//! Holds the legacy per-service routing configs (keyed by service ID) and
//! the rule-routing rules, whose JSON payload names the service they apply
//! to. Rules are indexed in a [`RuleContainer`] and searched with a union
//! read: rules bound to the exact service, then to its namespace, then
//! global rules.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use naming_core::model::{RouterRule, RoutingConfig, RoutingPayload};
use naming_core::{max_modify_time, Result, ServiceKey, Store};
use tracing::{debug, warn};

use crate::base::{PullOutcome, UpdateCore, UpdateSummary};
use crate::config::CacheConfig;
use crate::container::{RuleContainer, RuleSet};
use crate::registry::{CacheIndex, ResourceCache};

const CONFIG_LABEL: &str = "routing_config";
const RULE_LABEL: &str = "router_rule";

/// Criteria for [`RoutingConfigCache::query_router_rules`]. Unset fields
/// match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterRuleFilter {
    /// Substring of the rule name.
    pub name: Option<String>,
    /// Exact namespace of the rule.
    pub namespace: Option<String>,
    /// Enable flag.
    pub enable: Option<bool>,
    /// Number of matching rules to skip.
    pub offset: usize,
    /// Maximum number of rules returned; `0` means no limit.
    pub limit: usize,
}

/// The routing cache.
pub struct RoutingConfigCache {
    core: UpdateCore,
    configs: DashMap<String, Arc<RoutingConfig>>,
    rules: RuleContainer<RouterRule>,
    payloads: DashMap<String, Arc<RoutingPayload>>,
}

impl std::fmt::Debug for RoutingConfigCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingConfigCache")
            .field("configs", &self.configs.len())
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}

impl RoutingConfigCache {
    /// Create an empty cache.
    pub fn new(store: Arc<dyn Store>, config: Arc<CacheConfig>) -> Self {
        Self {
            core: UpdateCore::new(CacheIndex::RoutingConfig.name(), store, config),
            configs: DashMap::new(),
            rules: RuleContainer::new(),
            payloads: DashMap::new(),
        }
    }

    async fn pull(&self) -> Result<PullOutcome> {
        let store = self.core.store();
        let since = self.core.last_fetch_time();
        let first = self.core.is_first_update();
        let configs = store.get_more_routing_configs(since, first).await?;
        let rules = store.get_more_router_rules(since, first).await?;

        let mut outcome = PullOutcome {
            total: configs.len() + rules.len(),
            ..Default::default()
        };
        outcome.observe(CONFIG_LABEL, max_modify_time(&configs));
        outcome.observe(RULE_LABEL, max_modify_time(&rules));

        self.apply_configs(configs);
        self.apply_rules(rules);
        Ok(outcome)
    }

    fn apply_configs(&self, configs: Vec<RoutingConfig>) {
        for config in configs {
            if config.valid {
                self.configs.insert(config.id.clone(), Arc::new(config));
            } else {
                self.configs.remove(&config.id);
            }
        }
    }

    fn apply_rules(&self, rules: Vec<RouterRule>) {
        for rule in rules {
            if !rule.valid {
                self.rules.remove(&rule.id);
                self.payloads.remove(&rule.id);
                continue;
            }
            match rule.decode() {
                Ok(payload) => {
                    let target = payload.target();
                    debug!(rule = %rule.id, %target, "router rule indexed");
                    self.payloads.insert(rule.id.clone(), Arc::new(payload));
                    self.rules.upsert(Arc::new(rule), vec![target]);
                }
                Err(err) => {
                    warn!(cache = RULE_LABEL, rule = %rule.id, error = %err, "skipping router rule");
                    self.core.stats().record_skipped();
                }
            }
        }
    }

    /// Legacy routing config of a service.
    pub fn get_router_config_v1(&self, service_id: &str) -> Option<Arc<RoutingConfig>> {
        self.configs.get(service_id).map(|c| Arc::clone(c.value()))
    }

    /// Rules applying to `key`: exact rules, then namespace rules, then
    /// global rules.
    pub fn search_router_rules(&self, key: &ServiceKey) -> RuleSet<RouterRule> {
        self.rules.union(key)
    }

    /// Look up a router rule by ID.
    pub fn get_router_rule(&self, id: &str) -> Option<Arc<RouterRule>> {
        self.rules.get(id)
    }

    /// Decoded payload of a router rule.
    pub fn get_router_payload(&self, id: &str) -> Option<Arc<RoutingPayload>> {
        self.payloads.get(id).map(|p| Arc::clone(p.value()))
    }

    /// Visit every router rule. Return `false` from `f` to stop early.
    pub fn iterate_router_rules<F>(&self, f: F)
    where
        F: FnMut(&Arc<RouterRule>) -> bool,
    {
        self.rules.iterate(f);
    }

    /// Number of router rules.
    pub fn router_rules_count(&self) -> usize {
        self.rules.len()
    }

    /// Router rules matching `filter`, highest priority first (lowest
    /// value), then by ID. Returns the total match count and one page.
    pub fn query_router_rules(&self, filter: &RouterRuleFilter) -> (usize, Vec<Arc<RouterRule>>) {
        let mut matched: Vec<Arc<RouterRule>> = Vec::new();
        self.rules.iterate(|rule| {
            let keep = filter.name.as_ref().map_or(true, |n| rule.name.contains(n.as_str()))
                && filter.namespace.as_ref().map_or(true, |ns| &rule.namespace == ns)
                && filter.enable.map_or(true, |e| rule.enable == e);
            if keep {
                matched.push(Arc::clone(rule));
            }
            true
        });
        matched.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

        let total = matched.len();
        let limit = if filter.limit == 0 { usize::MAX } else { filter.limit };
        let page = matched.into_iter().skip(filter.offset).take(limit).collect();
        (total, page)
    }
}

#[async_trait]
impl ResourceCache for RoutingConfigCache {
    fn index(&self) -> CacheIndex {
        CacheIndex::RoutingConfig
    }

    async fn update(&self) -> Result<UpdateSummary> {
        self.core.update(|| self.pull()).await.result
    }

    fn clear(&self) {
        self.configs.clear();
        self.rules.clear();
        self.payloads.clear();
        self.core.clear();
    }

    fn core(&self) -> &UpdateCore {
        &self.core
    }
}
