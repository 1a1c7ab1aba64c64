//! Service contract cache.
//!
//! Contracts are indexed by ID and grouped under their owning service. A
//! service's contract list carries a revision computed over the revisions
//! of its contracts, so clients can poll for interface changes cheaply.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use naming_core::model::ServiceContract;
use naming_core::revision::composite_revision;
use naming_core::{max_modify_time, Result, ServiceKey, Store};
use parking_lot::RwLock;

use crate::base::{PullOutcome, UpdateCore, UpdateSummary};
use crate::config::CacheConfig;
use crate::registry::{CacheIndex, ResourceCache};

const LABEL: &str = "service_contract";

#[derive(Debug, Default)]
struct ServiceContracts {
    contracts: BTreeMap<String, Arc<ServiceContract>>,
    revision: String,
}

/// The service contract cache.
#[derive(Debug)]
pub struct ServiceContractCache {
    core: UpdateCore,
    ids: DashMap<String, Arc<ServiceContract>>,
    by_service: RwLock<HashMap<ServiceKey, ServiceContracts>>,
}

impl ServiceContractCache {
    /// Create an empty cache.
    pub fn new(store: Arc<dyn Store>, config: Arc<CacheConfig>) -> Self {
        Self {
            core: UpdateCore::new(CacheIndex::ServiceContract.name(), store, config),
            ids: DashMap::new(),
            by_service: RwLock::new(HashMap::new()),
        }
    }

    async fn pull(&self) -> Result<PullOutcome> {
        let contracts = self
            .core
            .store()
            .get_more_service_contracts(self.core.last_fetch_time(), self.core.is_first_update())
            .await?;
        let outcome = PullOutcome::single(LABEL, max_modify_time(&contracts), contracts.len());

        let mut groups = self.by_service.write();
        let mut touched = Vec::new();
        for contract in contracts {
            if let Some((_, old)) = self.ids.remove(&contract.id) {
                let key = old.key();
                if let Some(group) = groups.get_mut(&key) {
                    group.contracts.remove(&old.id);
                }
                touched.push(key);
            }
            if !contract.valid {
                continue;
            }
            let contract = Arc::new(contract);
            let key = contract.key();
            self.ids.insert(contract.id.clone(), Arc::clone(&contract));
            groups
                .entry(key.clone())
                .or_default()
                .contracts
                .insert(contract.id.clone(), contract);
            touched.push(key);
        }

        for key in touched {
            let empty = match groups.get_mut(&key) {
                Some(group) => {
                    let revisions: Vec<&str> = group.contracts.values().map(|c| c.revision.as_str()).collect();
                    group.revision = composite_revision(&revisions);
                    group.contracts.is_empty()
                }
                None => false,
            };
            if empty {
                groups.remove(&key);
            }
        }
        Ok(outcome)
    }

    /// Look up a service's contract by name, protocol and version.
    pub fn get_service_contract(
        &self,
        key: &ServiceKey,
        name: &str,
        protocol: &str,
        version: &str,
    ) -> Option<Arc<ServiceContract>> {
        let groups = self.by_service.read();
        groups.get(key)?.contracts.values().find_map(|c| {
            (c.name == name && c.protocol == protocol && c.version == version).then(|| Arc::clone(c))
        })
    }

    /// All contracts of a service, with the revision of that list.
    pub fn list_service_contracts(&self, key: &ServiceKey) -> (String, Vec<Arc<ServiceContract>>) {
        let groups = self.by_service.read();
        match groups.get(key) {
            Some(group) => (group.revision.clone(), group.contracts.values().cloned().collect()),
            None => (String::new(), Vec::new()),
        }
    }

    /// Look up a contract by ID.
    pub fn get_contract(&self, id: &str) -> Option<Arc<ServiceContract>> {
        self.ids.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Number of cached contracts.
    pub fn contracts_count(&self) -> usize {
        self.ids.len()
    }
}

#[async_trait]
impl ResourceCache for ServiceContractCache {
    fn index(&self) -> CacheIndex {
        CacheIndex::ServiceContract
    }

    async fn update(&self) -> Result<UpdateSummary> {
        self.core.update(|| self.pull()).await.result
    }

    fn clear(&self) {
        self.ids.clear();
        self.by_service.write().clear();
        self.core.clear();
    }

    fn core(&self) -> &UpdateCore {
        &self.core
    }
}
