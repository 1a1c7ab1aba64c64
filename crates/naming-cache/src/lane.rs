//! Lane group cache.
//!
//! A lane group binds a set of entry and destination services. Each group is
//! placed under every service it names, and lookups are first-match across
//! the exact, namespace and global tiers.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use naming_core::model::{LaneGroup, LaneGroupPayload};
use naming_core::{max_modify_time, Result, ServiceKey, Store};
use tracing::warn;

use crate::base::{PullOutcome, UpdateCore, UpdateSummary};
use crate::config::CacheConfig;
use crate::container::{RuleContainer, RuleSet};
use crate::registry::{CacheIndex, ResourceCache};

const LABEL: &str = "lane";

/// The lane group cache.
#[derive(Debug)]
pub struct LaneCache {
    core: UpdateCore,
    groups: RuleContainer<LaneGroup>,
    names: DashMap<String, Arc<LaneGroup>>,
    payloads: DashMap<String, Arc<LaneGroupPayload>>,
}

impl LaneCache {
    /// Create an empty cache.
    pub fn new(store: Arc<dyn Store>, config: Arc<CacheConfig>) -> Self {
        Self {
            core: UpdateCore::new(CacheIndex::Lane.name(), store, config),
            groups: RuleContainer::new(),
            names: DashMap::new(),
            payloads: DashMap::new(),
        }
    }

    async fn pull(&self) -> Result<PullOutcome> {
        let groups = self
            .core
            .store()
            .get_more_lane_groups(self.core.last_fetch_time(), self.core.is_first_update())
            .await?;
        let outcome = PullOutcome::single(LABEL, max_modify_time(&groups), groups.len());

        for group in groups {
            if !group.valid {
                self.remove(&group.id);
                continue;
            }
            // A group that fails to decode keeps its last good version.
            match group.decode() {
                Ok(payload) => self.replace(Arc::new(group), payload),
                Err(err) => {
                    warn!(cache = LABEL, group = %group.id, error = %err, "skipping lane group");
                    self.core.stats().record_skipped();
                }
            }
        }
        Ok(outcome)
    }

    fn replace(&self, group: Arc<LaneGroup>, payload: LaneGroupPayload) {
        let old = self.groups.get(&group.id);
        let targets = payload.targets();
        self.names.insert(group.name.clone(), Arc::clone(&group));
        self.payloads.insert(group.id.clone(), Arc::new(payload));
        self.groups.upsert(Arc::clone(&group), targets);
        if let Some(old) = old.filter(|o| o.name != group.name) {
            self.names.remove_if(&old.name, |_, g| g.id == old.id);
        }
    }

    fn remove(&self, id: &str) {
        if let Some(old) = self.groups.remove(id) {
            self.names.remove_if(&old.name, |_, g| g.id == old.id);
        }
        self.payloads.remove(id);
    }

    /// Lane groups effective for `key`, with the revision of that set.
    pub fn get_lane_rules(&self, key: &ServiceKey) -> RuleSet<LaneGroup> {
        self.groups.first_match(key)
    }

    /// Look up a lane group by name.
    pub fn get_lane_group(&self, name: &str) -> Option<Arc<LaneGroup>> {
        self.names.get(name).map(|g| Arc::clone(g.value()))
    }

    /// Decoded rules of a lane group.
    pub fn get_lane_payload(&self, id: &str) -> Option<Arc<LaneGroupPayload>> {
        self.payloads.get(id).map(|p| Arc::clone(p.value()))
    }

    /// Number of cached lane groups.
    pub fn lane_groups_count(&self) -> usize {
        self.groups.len()
    }
}

#[async_trait]
impl ResourceCache for LaneCache {
    fn index(&self) -> CacheIndex {
        CacheIndex::Lane
    }

    async fn update(&self) -> Result<UpdateSummary> {
        self.core.update(|| self.pull()).await.result
    }

    fn clear(&self) {
        self.groups.clear();
        self.names.clear();
        self.payloads.clear();
        self.core.clear();
    }

    fn core(&self) -> &UpdateCore {
        &self.core
    }
}
