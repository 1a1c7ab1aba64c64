//! Authorization strategy cache.
//!
//! Every principal named by a strategy gets two strategy-ID sets, one per
//! action, and a [`PrincipalResourceContainer`] answering membership
//! questions. When a strategy changes, principals it no longer names are
//! detached and every principal it still names is re-attached from the new
//! record, so membership never drifts from the stored strategy.
//!
//! Access checks resolve in this order:
//!
//! 1. direct membership by resource ID (including `*`), deny first;
//! 2. membership by resource label, deny first;
//! 3. otherwise deny.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use naming_core::model::{PolicyAction, Principal, PrincipalType, ResourceEntry, ResourceType, StrategyDetail};
use naming_core::{max_modify_time, Result, Store};
use tracing::{debug, trace};

use super::principal::PrincipalResourceContainer;
use crate::base::{PullOutcome, UpdateCore, UpdateSummary};
use crate::config::CacheConfig;
use crate::link::{Link, UserAccessor};
use crate::registry::{CacheIndex, CacheRegistry, ResourceCache};

const LABEL: &str = "strategy";

/// Extra condition injected into a [`StrategyQuery`].
pub type StrategyPredicate = Arc<dyn Fn(&StrategyDetail) -> bool + Send + Sync>;

/// Criteria for [`StrategyCache::query`]. Unset fields match everything.
#[derive(Clone, Default)]
pub struct StrategyQuery {
    /// Exact strategy ID.
    pub id: Option<String>,
    /// Substring of the strategy name.
    pub name: Option<String>,
    /// Exact owner ID.
    pub owner: Option<String>,
    /// Default-strategy flag.
    pub default: Option<bool>,
    /// Resource the strategy must name.
    pub resource: Option<(ResourceType, String)>,
    /// Principal the strategy must apply to.
    pub principal: Option<Principal>,
    /// Additional conditions, all of which must hold.
    pub predicates: Vec<StrategyPredicate>,
    /// Number of matching strategies to skip.
    pub offset: usize,
    /// Maximum number of strategies returned; `0` means no limit.
    pub limit: usize,
}

impl fmt::Debug for StrategyQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyQuery")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("default", &self.default)
            .field("resource", &self.resource)
            .field("principal", &self.principal)
            .field("predicates", &self.predicates.len())
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .finish()
    }
}

impl StrategyQuery {
    /// Add a predicate.
    #[must_use]
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StrategyDetail) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    fn matches(&self, strategy: &StrategyDetail) -> bool {
        self.id.as_ref().map_or(true, |id| &strategy.id == id)
            && self.name.as_ref().map_or(true, |n| strategy.name.contains(n.as_str()))
            && self.owner.as_ref().map_or(true, |o| &strategy.owner == o)
            && self.default.map_or(true, |d| strategy.default == d)
            && self.resource.as_ref().map_or(true, |(t, id)| {
                strategy
                    .resources
                    .iter()
                    .any(|r| r.res_type == *t && &r.res_id == id)
            })
            && self
                .principal
                .as_ref()
                .map_or(true, |p| strategy.principals.contains(p))
            && self.predicates.iter().all(|p| p(strategy))
    }
}

/// The authorization strategy cache.
pub struct StrategyCache {
    core: UpdateCore,
    strategies: DashMap<String, Arc<StrategyDetail>>,
    allow: DashMap<Principal, HashSet<String>>,
    deny: DashMap<Principal, HashSet<String>>,
    containers: DashMap<Principal, PrincipalResourceContainer>,
    resource_links: DashMap<(ResourceType, String), HashSet<String>>,
    users: Link<dyn UserAccessor>,
}

impl fmt::Debug for StrategyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyCache")
            .field("strategies", &self.strategies.len())
            .field("principals", &self.containers.len())
            .finish_non_exhaustive()
    }
}

impl StrategyCache {
    /// Create an empty cache.
    pub fn new(store: Arc<dyn Store>, config: Arc<CacheConfig>) -> Self {
        let name = CacheIndex::Strategy.name();
        Self {
            core: UpdateCore::new(name, store, config),
            strategies: DashMap::new(),
            allow: DashMap::new(),
            deny: DashMap::new(),
            containers: DashMap::new(),
            resource_links: DashMap::new(),
            users: Link::new(name, CacheIndex::User.name()),
        }
    }

    async fn pull(&self) -> Result<PullOutcome> {
        let strategies = self
            .core
            .store()
            .get_more_strategies(self.core.last_fetch_time(), self.core.is_first_update())
            .await?;
        let outcome = PullOutcome::single(LABEL, max_modify_time(&strategies), strategies.len());

        for strategy in strategies {
            self.apply(strategy);
        }
        self.allow.retain(|_, ids| !ids.is_empty());
        self.deny.retain(|_, ids| !ids.is_empty());
        self.containers.retain(|_, c| !c.is_empty());
        Ok(outcome)
    }

    fn apply(&self, strategy: StrategyDetail) {
        if !strategy.valid {
            if let Some((_, old)) = self.strategies.remove(&strategy.id) {
                self.unlink(&old, None);
                debug!(strategy = %strategy.id, "strategy removed");
            }
            return;
        }

        let strategy = Arc::new(strategy);
        let old = self.strategies.insert(strategy.id.clone(), Arc::clone(&strategy));
        for principal in &strategy.principals {
            self.id_set(strategy.action)
                .entry(principal.clone())
                .or_default()
                .insert(strategy.id.clone());
            self.containers
                .entry(principal.clone())
                .or_default()
                .attach(&strategy);
        }
        for res in &strategy.resources {
            self.resource_links
                .entry((res.res_type, res.res_id.clone()))
                .or_default()
                .insert(strategy.id.clone());
        }
        if let Some(old) = old {
            self.unlink(&old, Some(strategy.as_ref()));
        }
    }

    /// Drop the links `old` held that `current` no longer keeps.
    fn unlink(&self, old: &StrategyDetail, current: Option<&StrategyDetail>) {
        let principals: HashSet<&Principal> = current
            .map(|c| c.principals.iter().collect())
            .unwrap_or_default();
        let same_action = current.is_some_and(|c| c.action == old.action);
        for principal in &old.principals {
            let kept = principals.contains(principal);
            if !(kept && same_action) {
                if let Some(mut ids) = self.id_set(old.action).get_mut(principal) {
                    ids.remove(&old.id);
                }
            }
            if !kept {
                if let Some(mut container) = self.containers.get_mut(principal) {
                    container.detach(&old.id);
                }
                trace!(strategy = %old.id, %principal, "principal detached");
            }
        }

        let resources: HashSet<(ResourceType, &str)> = current
            .map(|c| c.resources.iter().map(|r| (r.res_type, r.res_id.as_str())).collect())
            .unwrap_or_default();
        for res in &old.resources {
            if resources.contains(&(res.res_type, res.res_id.as_str())) {
                continue;
            }
            if let Some(mut ids) = self.resource_links.get_mut(&(res.res_type, res.res_id.clone())) {
                ids.remove(&old.id);
            }
        }
        self.resource_links.retain(|_, ids| !ids.is_empty());
    }

    fn id_set(&self, action: PolicyAction) -> &DashMap<Principal, HashSet<String>> {
        match action {
            PolicyAction::Allow => &self.allow,
            PolicyAction::Deny => &self.deny,
        }
    }

    /// Decide access of a single principal to `entry`.
    pub fn hint(&self, principal: &Principal, entry: &ResourceEntry) -> PolicyAction {
        self.resolve(std::slice::from_ref(principal), entry)
    }

    /// Whether `principal` may edit `entry`. A user is also checked through
    /// the groups it belongs to.
    pub fn is_resource_editable(&self, principal: &Principal, entry: &ResourceEntry) -> bool {
        let mut principals = vec![principal.clone()];
        if principal.principal_type == PrincipalType::User {
            if let Ok(users) = self.users.get() {
                principals.extend(
                    users
                        .get_user_link_groups(&principal.id)
                        .iter()
                        .map(|g| Principal::group(g.id.clone())),
                );
            }
        }
        self.resolve(&principals, entry) == PolicyAction::Allow
    }

    fn resolve(&self, principals: &[Principal], entry: &ResourceEntry) -> PolicyAction {
        let direct: Vec<PolicyAction> = principals
            .iter()
            .filter_map(|p| self.containers.get(p).and_then(|c| c.id_membership(entry)))
            .collect();
        if let Some(action) = strongest(&direct) {
            return action;
        }
        let labelled: Vec<PolicyAction> = principals
            .iter()
            .filter_map(|p| self.containers.get(p).and_then(|c| c.label_membership(entry)))
            .collect();
        strongest(&labelled).unwrap_or(PolicyAction::Deny)
    }

    /// Whether any strategy names the resource by ID.
    pub fn is_resource_link_strategy(&self, res_type: ResourceType, res_id: &str) -> bool {
        self.resource_links
            .get(&(res_type, res_id.to_string()))
            .is_some_and(|ids| !ids.is_empty())
    }

    /// Strategies with `action` that apply to `principal`.
    pub fn get_principal_policies(&self, action: PolicyAction, principal: &Principal) -> Vec<Arc<StrategyDetail>> {
        let Some(ids) = self.id_set(action).get(principal).map(|ids| ids.value().clone()) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| self.get_policy_rule(id)).collect()
    }

    /// Look up a strategy by ID.
    pub fn get_policy_rule(&self, id: &str) -> Option<Arc<StrategyDetail>> {
        self.strategies.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Strategies matching `query`, most recently modified first. Returns
    /// the total match count and one page.
    pub fn query(&self, query: &StrategyQuery) -> (usize, Vec<Arc<StrategyDetail>>) {
        let mut matched: Vec<Arc<StrategyDetail>> = self
            .strategies
            .iter()
            .filter(|s| query.matches(s.value()))
            .map(|s| Arc::clone(s.value()))
            .collect();
        matched.sort_by(|a, b| b.modify_time.cmp(&a.modify_time).then_with(|| a.id.cmp(&b.id)));

        let total = matched.len();
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        (total, matched.into_iter().skip(query.offset).take(limit).collect())
    }

    /// Number of cached strategies.
    pub fn strategies_count(&self) -> usize {
        self.strategies.len()
    }

    /// Number of principals with at least one attached strategy.
    pub fn principals_count(&self) -> usize {
        self.containers.len()
    }
}

fn strongest(actions: &[PolicyAction]) -> Option<PolicyAction> {
    if actions.contains(&PolicyAction::Deny) {
        Some(PolicyAction::Deny)
    } else if actions.contains(&PolicyAction::Allow) {
        Some(PolicyAction::Allow)
    } else {
        None
    }
}

#[async_trait]
impl ResourceCache for StrategyCache {
    fn index(&self) -> CacheIndex {
        CacheIndex::Strategy
    }

    fn initialize(&self, registry: &CacheRegistry) -> Result<()> {
        if let Some(users) = registry.user_accessor() {
            self.users.bind(&users);
        }
        Ok(())
    }

    async fn update(&self) -> Result<UpdateSummary> {
        self.core.update(|| self.pull()).await.result
    }

    fn clear(&self) {
        self.strategies.clear();
        self.allow.clear();
        self.deny.clear();
        self.containers.clear();
        self.resource_links.clear();
        self.core.clear();
    }

    fn core(&self) -> &UpdateCore {
        &self.core
    }
}
