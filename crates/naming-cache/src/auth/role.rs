//! RBAC role cache.
//!
//! Besides the roles themselves, the cache keeps a principal to role-ID
//! index. Containers left empty by a batch are dropped once the batch has
//! been applied.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use naming_core::model::{Principal, Role};
use naming_core::{max_modify_time, Result, Store};

use crate::base::{PullOutcome, UpdateCore, UpdateSummary};
use crate::config::CacheConfig;
use crate::registry::{CacheIndex, ResourceCache};

const LABEL: &str = "role";

/// Criteria for [`RoleCache::query_roles`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleFilter {
    /// Exact role ID.
    pub id: Option<String>,
    /// Substring of the role name.
    pub name: Option<String>,
    /// Exact owner ID.
    pub owner: Option<String>,
    /// Principal that must hold the role.
    pub principal: Option<Principal>,
    /// Number of matching roles to skip.
    pub offset: usize,
    /// Maximum number of roles returned; `0` means no limit.
    pub limit: usize,
}

/// The role cache.
#[derive(Debug)]
pub struct RoleCache {
    core: UpdateCore,
    roles: DashMap<String, Arc<Role>>,
    principal_roles: DashMap<Principal, HashSet<String>>,
}

impl RoleCache {
    /// Create an empty cache.
    pub fn new(store: Arc<dyn Store>, config: Arc<CacheConfig>) -> Self {
        Self {
            core: UpdateCore::new(CacheIndex::Role.name(), store, config),
            roles: DashMap::new(),
            principal_roles: DashMap::new(),
        }
    }

    async fn pull(&self) -> Result<PullOutcome> {
        let roles = self
            .core
            .store()
            .get_more_roles(self.core.last_fetch_time(), self.core.is_first_update())
            .await?;
        let outcome = PullOutcome::single(LABEL, max_modify_time(&roles), roles.len());

        for role in roles {
            self.apply(role);
        }
        self.principal_roles.retain(|_, ids| !ids.is_empty());
        Ok(outcome)
    }

    fn apply(&self, role: Role) {
        let previous: Vec<Principal> = self
            .roles
            .remove(&role.id)
            .map(|(_, old)| old.principals.clone())
            .unwrap_or_default();
        for principal in previous {
            if let Some(mut ids) = self.principal_roles.get_mut(&principal) {
                ids.remove(&role.id);
            }
        }
        if !role.valid {
            return;
        }
        for principal in &role.principals {
            self.principal_roles
                .entry(principal.clone())
                .or_default()
                .insert(role.id.clone());
        }
        self.roles.insert(role.id.clone(), Arc::new(role));
    }

    /// Look up a role by ID.
    pub fn get_role(&self, id: &str) -> Option<Arc<Role>> {
        self.roles.get(id).map(|r| Arc::clone(r.value()))
    }

    /// Roles held by `principal`.
    pub fn get_principal_roles(&self, principal: &Principal) -> Vec<Arc<Role>> {
        let Some(ids) = self.principal_roles.get(principal).map(|ids| ids.value().clone()) else {
            return Vec::new();
        };
        ids.iter().filter_map(|id| self.get_role(id)).collect()
    }

    /// Roles matching `filter`, most recently modified first. Returns the
    /// total match count and one page.
    pub fn query_roles(&self, filter: &RoleFilter) -> (usize, Vec<Arc<Role>>) {
        let mut matched: Vec<Arc<Role>> = self
            .roles
            .iter()
            .filter(|r| {
                let role = r.value();
                filter.id.as_ref().map_or(true, |id| &role.id == id)
                    && filter.name.as_ref().map_or(true, |n| role.name.contains(n.as_str()))
                    && filter.owner.as_ref().map_or(true, |o| &role.owner == o)
                    && filter.principal.as_ref().map_or(true, |p| role.principals.contains(p))
            })
            .map(|r| Arc::clone(r.value()))
            .collect();
        matched.sort_by(|a, b| b.modify_time.cmp(&a.modify_time).then_with(|| a.id.cmp(&b.id)));

        let total = matched.len();
        let limit = if filter.limit == 0 { usize::MAX } else { filter.limit };
        (total, matched.into_iter().skip(filter.offset).take(limit).collect())
    }

    /// Number of cached roles.
    pub fn roles_count(&self) -> usize {
        self.roles.len()
    }

    /// Number of principals holding at least one role.
    pub fn principals_count(&self) -> usize {
        self.principal_roles.len()
    }
}

#[async_trait]
impl ResourceCache for RoleCache {
    fn index(&self) -> CacheIndex {
        CacheIndex::Role
    }

    async fn update(&self) -> Result<UpdateSummary> {
        self.core.update(|| self.pull()).await.result
    }

    fn clear(&self) {
        self.roles.clear();
        self.principal_roles.clear();
        self.core.clear();
    }

    fn core(&self) -> &UpdateCore {
        &self.core
    }
}
