//! Instance cache.
//!
//! Mirrors the instance table, indexed by ID and by owning service. After
//! each batch the per-service [`InstanceCount`] of every touched service is
//! rebuilt, a revision recompute is queued for it, and the namespace totals
//! of the affected namespaces are refreshed through the service cache.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use naming_core::model::{Instance, InstanceCount};
use naming_core::{max_modify_time, Result, Store};
use tracing::{debug, warn};

use crate::base::{PullOutcome, UpdateCore, UpdateSummary};
use crate::config::CacheConfig;
use crate::link::{InstanceAccessor, Link, RevisionNotifier, ServiceAccessor};
use crate::registry::{CacheIndex, CacheRegistry, ResourceCache};

const LABEL: &str = "instance";

/// The instance cache.
pub struct InstanceCache {
    core: UpdateCore,
    ids: DashMap<String, Arc<Instance>>,
    /// service ID -> instance ID -> instance
    by_service: DashMap<String, HashMap<String, Arc<Instance>>>,
    counts: DashMap<String, InstanceCount>,
    services: Link<dyn ServiceAccessor>,
    notifier: Link<dyn RevisionNotifier>,
}

impl std::fmt::Debug for InstanceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceCache")
            .field("instances", &self.ids.len())
            .field("services", &self.by_service.len())
            .finish_non_exhaustive()
    }
}

impl InstanceCache {
    /// Create an empty cache.
    pub fn new(store: Arc<dyn Store>, config: Arc<CacheConfig>) -> Self {
        let name = CacheIndex::Instance.name();
        Self {
            core: UpdateCore::new(name, store, config),
            ids: DashMap::new(),
            by_service: DashMap::new(),
            counts: DashMap::new(),
            services: Link::new(name, CacheIndex::Service.name()),
            notifier: Link::new(name, CacheIndex::Service.name()),
        }
    }

    /// Update, pulling again if this call joined a pull already in flight.
    pub async fn update_fresh(&self) -> Result<UpdateSummary> {
        let summary = self.core.update_fresh(|| self.pull()).await?;
        self.check_all().await;
        Ok(summary)
    }

    async fn pull(&self) -> Result<PullOutcome> {
        let notifier = self.notifier.get()?;
        let instances = self
            .core
            .store()
            .get_more_instances(self.core.last_fetch_time(), self.core.is_first_update())
            .await?;

        let last_mtime = max_modify_time(&instances);
        let total = instances.len();
        let touched = self.apply(instances);

        let mut namespaces = HashSet::new();
        for (service_id, namespace) in &touched {
            notifier.notify_service_revision(service_id, true).await?;
            if let Some(ns) = namespace {
                namespaces.insert(ns.clone());
            }
        }
        notifier.recompute_namespace_counts(&namespaces);

        Ok(PullOutcome::single(LABEL, last_mtime, total))
    }

    /// Apply a batch and return the touched services with their namespace.
    fn apply(&self, instances: Vec<Instance>) -> HashMap<String, Option<String>> {
        let mut touched: HashMap<String, Option<String>> = HashMap::new();
        let mut removed = 0usize;

        for instance in instances {
            let instance = Arc::new(instance);
            if !instance.valid {
                if let Some((_, old)) = self.ids.remove(&instance.id) {
                    self.detach(&old);
                    touched.insert(old.service_id.clone(), self.namespace_of(&old));
                    removed += 1;
                }
                continue;
            }

            // Overwrite in place; only a service move detaches the old entry.
            let old = self.ids.insert(instance.id.clone(), Arc::clone(&instance));
            self.by_service
                .entry(instance.service_id.clone())
                .or_default()
                .insert(instance.id.clone(), Arc::clone(&instance));
            if let Some(old) = old.filter(|o| o.service_id != instance.service_id) {
                self.detach(&old);
                touched.insert(old.service_id.clone(), self.namespace_of(&old));
            }
            touched.insert(instance.service_id.clone(), self.namespace_of(&instance));
        }

        for service_id in touched.keys() {
            self.recount(service_id);
        }
        if removed > 0 {
            debug!(cache = LABEL, removed, "instances removed");
        }
        touched
    }

    fn detach(&self, old: &Instance) {
        let emptied = match self.by_service.get_mut(&old.service_id) {
            Some(mut set) => {
                set.remove(&old.id);
                set.is_empty()
            }
            None => false,
        };
        if emptied {
            self.by_service.remove_if(&old.service_id, |_, set| set.is_empty());
        }
    }

    fn recount(&self, service_id: &str) {
        let count = self.by_service.get(service_id).map(|set| {
            let mut count = InstanceCount::default();
            for instance in set.values() {
                count.add(instance);
            }
            count
        });
        match count {
            Some(count) => {
                self.counts.insert(service_id.to_string(), count);
            }
            None => {
                self.counts.remove(service_id);
            }
        }
    }

    fn namespace_of(&self, instance: &Instance) -> Option<String> {
        if !instance.namespace.is_empty() {
            return Some(instance.namespace.clone());
        }
        self.services
            .get()
            .ok()
            .and_then(|s| s.get_service_by_id(&instance.service_id))
            .map(|s| s.namespace.clone())
    }

    async fn check_all(&self) {
        if !self.core.should_check_all() {
            return;
        }
        match self.core.store().get_instances_count().await {
            Ok(stored) => {
                self.core.reconcile(self.ids.len(), stored);
            }
            Err(err) => warn!(cache = LABEL, error = %err, "instance count check failed"),
        }
    }

    /// Look up an instance by ID.
    pub fn get_instance(&self, id: &str) -> Option<Arc<Instance>> {
        self.ids.get(id).map(|i| Arc::clone(i.value()))
    }

    /// Instances of a service, sorted by ID.
    pub fn get_instances_by_service_id(&self, service_id: &str) -> Vec<Arc<Instance>> {
        let mut instances: Vec<Arc<Instance>> = self
            .by_service
            .get(service_id)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        instances
    }

    /// Aggregated instance totals of a service.
    pub fn get_instance_count(&self, service_id: &str) -> Option<InstanceCount> {
        self.counts.get(service_id).map(|c| c.value().clone())
    }

    /// Number of cached instances.
    pub fn instances_count(&self) -> usize {
        self.ids.len()
    }

    /// Number of services with at least one cached instance.
    pub fn services_with_instances(&self) -> usize {
        self.by_service.len()
    }

    /// Visit every instance. Return `false` from `f` to stop early.
    pub fn iterate_instances<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Instance>) -> bool,
    {
        for entry in self.ids.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    /// Visit the instances of one service. Return `false` from `f` to stop
    /// early.
    pub fn iterate_instances_by_service<F>(&self, service_id: &str, mut f: F)
    where
        F: FnMut(&Arc<Instance>) -> bool,
    {
        if let Some(set) = self.by_service.get(service_id) {
            for instance in set.values() {
                if !f(instance) {
                    break;
                }
            }
        }
    }

    /// Distinct metadata values of a service's instances, by key.
    pub fn get_instance_labels(&self, service_id: &str) -> BTreeMap<String, BTreeSet<String>> {
        let mut labels: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        self.iterate_instances_by_service(service_id, |instance| {
            for (key, value) in &instance.metadata {
                labels.entry(key.clone()).or_default().insert(value.clone());
            }
            true
        });
        labels
    }

    /// Distinct `(port, protocol)` pairs exposed by a service's instances.
    pub fn get_service_ports(&self, service_id: &str) -> Vec<(u32, String)> {
        let mut ports: BTreeSet<(u32, String)> = BTreeSet::new();
        self.iterate_instances_by_service(service_id, |instance| {
            ports.insert((instance.port, instance.protocol.clone()));
            true
        });
        ports.into_iter().collect()
    }
}

impl InstanceAccessor for InstanceCache {
    fn instance_revisions(&self, service_id: &str) -> Vec<String> {
        self.by_service
            .get(service_id)
            .map(|set| set.values().map(|i| i.revision.clone()).collect())
            .unwrap_or_default()
    }

    fn instance_count(&self, service_id: &str) -> Option<InstanceCount> {
        self.get_instance_count(service_id)
    }
}

#[async_trait]
impl ResourceCache for InstanceCache {
    fn index(&self) -> CacheIndex {
        CacheIndex::Instance
    }

    fn initialize(&self, registry: &CacheRegistry) -> Result<()> {
        let services = registry
            .service_accessor()
            .ok_or_else(|| naming_core::CacheError::not_initialized(LABEL, "service"))?;
        let notifier = registry
            .revision_notifier()
            .ok_or_else(|| naming_core::CacheError::not_initialized(LABEL, "service"))?;
        self.services.bind(&services);
        self.notifier.bind(&notifier);
        Ok(())
    }

    async fn update(&self) -> Result<UpdateSummary> {
        let summary = self.core.update(|| self.pull()).await.result?;
        self.check_all().await;
        Ok(summary)
    }

    fn clear(&self) {
        self.ids.clear();
        self.by_service.clear();
        self.counts.clear();
        self.core.clear();
    }

    fn core(&self) -> &UpdateCore {
        &self.core
    }
}
