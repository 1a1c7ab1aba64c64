//! Per-principal resource membership.
//!
//! A [`PrincipalResourceContainer`] records which resources the strategies
//! attached to one principal name, split by action. It answers membership
//! questions without walking the strategies.

use std::collections::{HashMap, HashSet};

use naming_core::model::{PolicyAction, ResourceEntry, ResourceLabel, ResourceType, StrategyDetail};
use naming_core::WILDCARD;

#[derive(Debug, Default, Clone)]
struct ActionIndex {
    /// `(type, resource id)` to the strategies naming it.
    resources: HashMap<(ResourceType, String), HashSet<String>>,
    /// Strategy ID to the labels it selects by.
    labels: HashMap<String, Vec<ResourceLabel>>,
}

impl ActionIndex {
    fn contains(&self, entry: &ResourceEntry) -> bool {
        let exact = (entry.res_type, entry.id.clone());
        let any = (entry.res_type, WILDCARD.to_string());
        self.resources.contains_key(&exact) || self.resources.contains_key(&any)
    }

    fn matches_label(&self, entry: &ResourceEntry) -> bool {
        self.labels.values().flatten().any(|label| {
            label.res_type == entry.res_type
                && entry.metadata.get(&label.key).is_some_and(|v| *v == label.value)
        })
    }

    fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.labels.is_empty()
    }
}

/// Resources reachable by one principal through its strategies.
#[derive(Debug, Default, Clone)]
pub struct PrincipalResourceContainer {
    allow: ActionIndex,
    deny: ActionIndex,
    /// Strategy ID to what it contributed, for detaching.
    owned: HashMap<String, (PolicyAction, Vec<(ResourceType, String)>)>,
}

impl PrincipalResourceContainer {
    /// Create an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    fn index_mut(&mut self, action: PolicyAction) -> &mut ActionIndex {
        match action {
            PolicyAction::Allow => &mut self.allow,
            PolicyAction::Deny => &mut self.deny,
        }
    }

    /// Record every resource and label of `strategy`, replacing anything
    /// it contributed before.
    pub fn attach(&mut self, strategy: &StrategyDetail) {
        self.detach(&strategy.id);

        let keys: Vec<(ResourceType, String)> = strategy
            .resources
            .iter()
            .map(|r| (r.res_type, r.res_id.clone()))
            .collect();
        let index = self.index_mut(strategy.action);
        for key in &keys {
            index
                .resources
                .entry(key.clone())
                .or_default()
                .insert(strategy.id.clone());
        }
        if !strategy.resource_labels.is_empty() {
            index
                .labels
                .insert(strategy.id.clone(), strategy.resource_labels.clone());
        }
        self.owned.insert(strategy.id.clone(), (strategy.action, keys));
    }

    /// Remove everything `strategy_id` contributed. Returns whether it was
    /// attached.
    pub fn detach(&mut self, strategy_id: &str) -> bool {
        let Some((action, keys)) = self.owned.remove(strategy_id) else {
            return false;
        };
        let index = self.index_mut(action);
        for key in keys {
            if let Some(ids) = index.resources.get_mut(&key) {
                ids.remove(strategy_id);
                if ids.is_empty() {
                    index.resources.remove(&key);
                }
            }
        }
        index.labels.remove(strategy_id);
        true
    }

    /// Membership by resource ID. A deny entry wins over an allow entry.
    pub fn id_membership(&self, entry: &ResourceEntry) -> Option<PolicyAction> {
        if self.deny.contains(entry) {
            Some(PolicyAction::Deny)
        } else if self.allow.contains(entry) {
            Some(PolicyAction::Allow)
        } else {
            None
        }
    }

    /// Membership by resource label. A deny label wins over an allow label.
    pub fn label_membership(&self, entry: &ResourceEntry) -> Option<PolicyAction> {
        if entry.metadata.is_empty() {
            return None;
        }
        if self.deny.matches_label(entry) {
            Some(PolicyAction::Deny)
        } else if self.allow.matches_label(entry) {
            Some(PolicyAction::Allow)
        } else {
            None
        }
    }

    /// Whether any attached strategy names `(res_type, res_id)` directly.
    pub fn links(&self, res_type: ResourceType, res_id: &str) -> bool {
        let key = (res_type, res_id.to_string());
        self.allow.resources.contains_key(&key) || self.deny.resources.contains_key(&key)
    }

    /// IDs of the attached strategies.
    pub fn strategy_ids(&self) -> impl Iterator<Item = &str> {
        self.owned.keys().map(String::as_str)
    }

    /// Whether no strategy is attached.
    pub fn is_empty(&self) -> bool {
        self.owned.is_empty() && self.allow.is_empty() && self.deny.is_empty()
    }
}
