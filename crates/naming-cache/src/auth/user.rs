//! User and group cache.
//!
//! Keeps users by ID and by `(owner, name)`, groups by ID, and the reverse
//! link from a user to the groups it belongs to. Group membership is
//! re-derived from the group record on every change.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use naming_core::model::{User, UserGroup, UserRoleType};
use naming_core::{max_modify_time, Result, Store};
use tracing::debug;

use crate::base::{PullOutcome, UpdateCore, UpdateSummary};
use crate::config::CacheConfig;
use crate::link::UserAccessor;
use crate::registry::{CacheIndex, ResourceCache};

const USER_LABEL: &str = "user";
const GROUP_LABEL: &str = "group";

/// The user and group cache.
#[derive(Debug)]
pub struct UserCache {
    core: UpdateCore,
    users: DashMap<String, Arc<User>>,
    names: DashMap<(String, String), Arc<User>>,
    groups: DashMap<String, Arc<UserGroup>>,
    user_groups: DashMap<String, HashSet<String>>,
}

impl UserCache {
    /// Create an empty cache.
    pub fn new(store: Arc<dyn Store>, config: Arc<CacheConfig>) -> Self {
        Self {
            core: UpdateCore::new(CacheIndex::User.name(), store, config),
            users: DashMap::new(),
            names: DashMap::new(),
            groups: DashMap::new(),
            user_groups: DashMap::new(),
        }
    }

    async fn pull(&self) -> Result<PullOutcome> {
        let store = self.core.store();
        let since = self.core.last_fetch_time();
        let first = self.core.is_first_update();
        let users = store.get_more_users(since, first).await?;
        let groups = store.get_more_groups(since, first).await?;

        let mut outcome = PullOutcome {
            total: users.len() + groups.len(),
            ..Default::default()
        };
        outcome.observe(USER_LABEL, max_modify_time(&users));
        outcome.observe(GROUP_LABEL, max_modify_time(&groups));

        for user in users {
            self.apply_user(user);
        }
        for group in groups {
            self.apply_group(group);
        }
        Ok(outcome)
    }

    /// Group membership links are derived from group records alone, so a
    /// deleted user keeps the links its groups still list.
    fn apply_user(&self, user: User) {
        if !user.valid {
            if let Some((_, old)) = self.users.remove(&user.id) {
                self.names
                    .remove_if(&(old.owner.clone(), old.name.clone()), |_, u| u.id == old.id);
            }
            debug!(user = %user.id, "user removed");
            return;
        }
        let user = Arc::new(user);
        let name = (user.owner.clone(), user.name.clone());
        self.names.insert(name.clone(), Arc::clone(&user));
        if let Some(old) = self.users.insert(user.id.clone(), user) {
            let old_name = (old.owner.clone(), old.name.clone());
            if old_name != name {
                self.names.remove_if(&old_name, |_, u| u.id == old.id);
            }
        }
    }

    fn apply_group(&self, group: UserGroup) {
        let current = if group.valid {
            group.user_ids.clone()
        } else {
            HashSet::new()
        };
        for user_id in &current {
            self.user_groups
                .entry(user_id.clone())
                .or_default()
                .insert(group.id.clone());
        }

        let group_id = group.id.clone();
        let old = if group.valid {
            self.groups.insert(group_id.clone(), Arc::new(group))
        } else {
            self.groups.remove(&group_id).map(|(_, old)| old)
        };
        let previous = old.map(|o| o.user_ids.clone()).unwrap_or_default();
        for user_id in previous.difference(&current) {
            if let Some(mut links) = self.user_groups.get_mut(user_id) {
                links.remove(&group_id);
            }
            self.user_groups.remove_if(user_id, |_, links| links.is_empty());
        }
    }

    /// Look up a user by ID.
    pub fn get_user(&self, id: &str) -> Option<Arc<User>> {
        self.users.get(id).map(|u| Arc::clone(u.value()))
    }

    /// Look up a user by owner ID and login name. Main accounts have an
    /// empty owner.
    pub fn get_user_by_name(&self, owner: &str, name: &str) -> Option<Arc<User>> {
        self.names
            .get(&(owner.to_string(), name.to_string()))
            .map(|u| Arc::clone(u.value()))
    }

    /// Look up a group by ID.
    pub fn get_group(&self, id: &str) -> Option<Arc<UserGroup>> {
        self.groups.get(id).map(|g| Arc::clone(g.value()))
    }

    /// Whether `user_id` is a member of `group_id`.
    pub fn is_user_in_group(&self, user_id: &str, group_id: &str) -> bool {
        self.user_groups
            .get(user_id)
            .is_some_and(|links| links.contains(group_id))
    }

    /// Whether `user_id` is a main account (owner or admin).
    pub fn is_owner(&self, user_id: &str) -> bool {
        self.get_user(user_id)
            .is_some_and(|u| matches!(u.user_type, UserRoleType::Owner | UserRoleType::Admin))
    }

    /// Number of cached users.
    pub fn users_count(&self) -> usize {
        self.users.len()
    }

    /// Number of cached groups.
    pub fn groups_count(&self) -> usize {
        self.groups.len()
    }
}

impl UserAccessor for UserCache {
    fn get_user_link_groups(&self, user_id: &str) -> Vec<Arc<UserGroup>> {
        let Some(links) = self.user_groups.get(user_id).map(|l| l.value().clone()) else {
            return Vec::new();
        };
        links.iter().filter_map(|id| self.get_group(id)).collect()
    }
}

#[async_trait]
impl ResourceCache for UserCache {
    fn index(&self) -> CacheIndex {
        CacheIndex::User
    }

    async fn update(&self) -> Result<UpdateSummary> {
        self.core.update(|| self.pull()).await.result
    }

    fn clear(&self) {
        self.users.clear();
        self.names.clear();
        self.groups.clear();
        self.user_groups.clear();
        self.core.clear();
    }

    fn core(&self) -> &UpdateCore {
        &self.core
    }
}
