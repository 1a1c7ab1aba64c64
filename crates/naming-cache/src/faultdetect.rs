//! Fault-detection rule cache.
//!
//! Indexed and read like the circuit-breaker cache: first-match across the
//! exact, namespace and global tiers of the destination service.

use std::sync::Arc;

use async_trait::async_trait;
use naming_core::model::FaultDetectRule;
use naming_core::{max_modify_time, Result, ServiceKey, Store};

use crate::base::{PullOutcome, UpdateCore, UpdateSummary};
use crate::config::CacheConfig;
use crate::container::{RuleContainer, RuleSet};
use crate::registry::{CacheIndex, ResourceCache};

const LABEL: &str = "fault_detect";

/// The fault-detection rule cache.
#[derive(Debug)]
pub struct FaultDetectCache {
    core: UpdateCore,
    rules: RuleContainer<FaultDetectRule>,
}

impl FaultDetectCache {
    /// Create an empty cache.
    pub fn new(store: Arc<dyn Store>, config: Arc<CacheConfig>) -> Self {
        Self {
            core: UpdateCore::new(CacheIndex::FaultDetect.name(), store, config),
            rules: RuleContainer::new(),
        }
    }

    async fn pull(&self) -> Result<PullOutcome> {
        let rules = self
            .core
            .store()
            .get_more_fault_detect_rules(self.core.last_fetch_time(), self.core.is_first_update())
            .await?;
        let outcome = PullOutcome::single(LABEL, max_modify_time(&rules), rules.len());

        for rule in rules {
            if rule.valid {
                let target = rule.target();
                self.rules.upsert(Arc::new(rule), vec![target]);
            } else {
                self.rules.remove(&rule.id);
            }
        }
        Ok(outcome)
    }

    /// Rules effective for `key`, with the revision of that set.
    pub fn get_fault_detect_rules(&self, key: &ServiceKey) -> RuleSet<FaultDetectRule> {
        self.rules.first_match(key)
    }

    /// Look up a rule by ID.
    pub fn get_fault_detect_rule(&self, id: &str) -> Option<Arc<FaultDetectRule>> {
        self.rules.get(id)
    }

    /// Number of cached rules.
    pub fn fault_detect_rules_count(&self) -> usize {
        self.rules.len()
    }
}

#[async_trait]
impl ResourceCache for FaultDetectCache {
    fn index(&self) -> CacheIndex {
        CacheIndex::FaultDetect
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
