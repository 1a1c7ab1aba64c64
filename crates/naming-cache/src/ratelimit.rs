//! Rate-limit rule cache.
//!
//! Rate limits have no wildcard tiers: every rule belongs to exactly one
//! service. The cache keeps all rules by ID and groups them by service key,
//! each group with its own revision.
//!
//! Some records only carry the owning service's ID. Their namespace and
//! name are filled in from the service cache, or from the store when the
//! service is not cached yet. A rule that still cannot be resolved waits in
//! a pending set and is retried after every batch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use naming_core::model::RateLimit;
use naming_core::revision::composite_revision;
use naming_core::{max_modify_time, Result, ServiceKey, Store};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::base::{PullOutcome, UpdateCore, UpdateSummary};
use crate::config::CacheConfig;
use crate::container::RuleSet;
use crate::link::{Link, ServiceAccessor};
use crate::registry::{CacheIndex, CacheRegistry, ResourceCache};

const LABEL: &str = "rate_limit";

#[derive(Debug, Default)]
struct ServiceRules {
    rules: BTreeMap<String, Arc<RateLimit>>,
    revision: String,
}

impl ServiceRules {
    fn refresh_revision(&mut self) {
        let revisions: Vec<&str> = self.rules.values().map(|r| r.revision.as_str()).collect();
        self.revision = composite_revision(&revisions);
    }
}

/// The rate-limit rule cache.
pub struct RateLimitCache {
    core: UpdateCore,
    rules: DashMap<String, Arc<RateLimit>>,
    by_service: RwLock<HashMap<ServiceKey, ServiceRules>>,
    pending: DashMap<String, Arc<RateLimit>>,
    services: Link<dyn ServiceAccessor>,
}

impl std::fmt::Debug for RateLimitCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitCache")
            .field("rules", &self.rules.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl RateLimitCache {
    /// Create an empty cache.
    pub fn new(store: Arc<dyn Store>, config: Arc<CacheConfig>) -> Self {
        let name = CacheIndex::RateLimit.name();
        Self {
            core: UpdateCore::new(name, store, config),
            rules: DashMap::new(),
            by_service: RwLock::new(HashMap::new()),
            pending: DashMap::new(),
            services: Link::new(name, CacheIndex::Service.name()),
        }
    }

    async fn pull(&self) -> Result<PullOutcome> {
        let rules = self
            .core
            .store()
            .get_more_rate_limits(self.core.last_fetch_time(), self.core.is_first_update())
            .await?;
        let outcome = PullOutcome::single(LABEL, max_modify_time(&rules), rules.len());

        for rule in rules {
            if !rule.valid {
                self.remove(&rule.id);
                continue;
            }
            let rule = if rule.needs_fix() {
                match self.fix(rule).await {
                    Ok(fixed) => fixed,
                    Err(unresolved) => {
                        debug!(cache = LABEL, rule = %unresolved.id, "owning service unknown, rule pending");
                        self.remove(&unresolved.id);
                        self.pending.insert(unresolved.id.clone(), Arc::new(unresolved));
                        continue;
                    }
                }
            } else {
                rule
            };
            self.insert(Arc::new(rule));
        }

        self.retry_pending();
        Ok(outcome)
    }

    /// Fill in namespace and service name from the owning service.
    async fn fix(&self, mut rule: RateLimit) -> std::result::Result<RateLimit, RateLimit> {
        let cached = self
            .services
            .get()
            .ok()
            .and_then(|s| s.get_service_by_id(&rule.service_id));
        let service = match cached {
            Some(service) => Some(service.as_ref().clone()),
            None => match self.core.store().get_service_by_id(&rule.service_id).await {
                Ok(service) => service,
                Err(err) => {
                    warn!(cache = LABEL, rule = %rule.id, error = %err, "service lookup failed");
                    None
                }
            },
        };
        match service {
            Some(service) => {
                rule.namespace = service.namespace;
                rule.service = service.name;
                Ok(rule)
            }
            None => Err(rule),
        }
    }

    fn retry_pending(&self) {
        let Ok(services) = self.services.get() else {
            return;
        };
        let waiting: Vec<Arc<RateLimit>> = self.pending.iter().map(|r| Arc::clone(r.value())).collect();
        for rule in waiting {
            let Some(service) = services.get_service_by_id(&rule.service_id) else {
                continue;
            };
            let mut fixed = rule.as_ref().clone();
            fixed.namespace = service.namespace.clone();
            fixed.service = service.name.clone();
            self.pending.remove(&fixed.id);
            self.insert(Arc::new(fixed));
        }
    }

    /// Insert or replace a resolved rule. The previous version leaves its
    /// group in the same write section that adds the new one.
    fn insert(&self, rule: Arc<RateLimit>) {
        self.pending.remove(&rule.id);
        let key = rule.target();
        let old = self.rules.insert(rule.id.clone(), Arc::clone(&rule));
        let mut groups = self.by_service.write();
        if let Some(old) = old.filter(|o| o.target() != key) {
            Self::ungroup(&mut groups, &old.target(), &old.id);
        }
        let group = groups.entry(key).or_default();
        group.rules.insert(rule.id.clone(), rule);
        group.refresh_revision();
    }

    fn remove(&self, id: &str) {
        self.pending.remove(id);
        let Some((_, old)) = self.rules.remove(id) else {
            return;
        };
        Self::ungroup(&mut self.by_service.write(), &old.target(), id);
    }

    fn ungroup(groups: &mut HashMap<ServiceKey, ServiceRules>, key: &ServiceKey, id: &str) {
        if let Some(group) = groups.get_mut(key) {
            group.rules.remove(id);
            if group.rules.is_empty() {
                groups.remove(key);
            } else {
                group.refresh_revision();
            }
        }
    }

    /// Rules of one service ordered by priority, with their revision.
    pub fn get_rate_limit_rules(&self, key: &ServiceKey) -> RuleSet<RateLimit> {
        let groups = self.by_service.read();
        let Some(group) = groups.get(key) else {
            return RuleSet::default();
        };
        let mut rules: Vec<Arc<RateLimit>> = group.rules.values().cloned().collect();
        rules.sort_by_key(|r| r.priority);
        RuleSet {
            rules,
            revision: group.revision.clone(),
        }
    }

    /// Look up a rule by ID. Pending rules are not returned.
    pub fn get_rate_limit(&self, id: &str) -> Option<Arc<RateLimit>> {
        self.rules.get(id).map(|r| Arc::clone(r.value()))
    }

    /// Visit every resolved rule. Return `false` from `f` to stop early.
    pub fn iterate_rate_limits<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<RateLimit>) -> bool,
    {
        for entry in self.rules.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    /// Number of resolved rules.
    pub fn rate_limits_count(&self) -> usize {
        self.rules.len()
    }

    /// Number of rules waiting for their owning service.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl ResourceCache for RateLimitCache {
    fn index(&self) -> CacheIndex {
        CacheIndex::RateLimit
    }

    fn initialize(&self, registry: &CacheRegistry) -> Result<()> {
        if let Some(services) = registry.service_accessor() {
            self.services.bind(&services);
        }
        Ok(())
    }

    async fn update(&self) -> Result<UpdateSummary> {
        self.core.update(|| self.pull()).await.result
    }

    fn clear(&self) {
        self.rules.clear();
        self.by_service.write().clear();
        self.pending.clear();
        self.core.clear();
    }

    fn core(&self) -> &UpdateCore {
        &self.core
    }
}
