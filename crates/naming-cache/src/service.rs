//! Service cache.
//!
//! Mirrors the service table, indexed by ID, by `(namespace, name)`, by
//! namespace and by legacy cl5 name. Alias services are held as pending
//! until the service they point to is cached, then linked into the alias
//! index.
//!
//! The cache also owns the revision worker pool that fingerprints each
//! service from its own revision and the revisions of its instances, and the
//! per-namespace service and instance totals.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use naming_core::model::{NamespaceServiceCount, Service};
use naming_core::revision::{composite_revision, compute_service_revision};
use naming_core::{max_modify_time, Result, ServiceKey, Store};
use tracing::{debug, trace};

use crate::base::{PullOutcome, UpdateCore, UpdateSummary};
use crate::config::CacheConfig;
use crate::link::{InstanceAccessor, Link, RevisionNotifier, ServiceAccessor};
use crate::metrics::report_namespace_counts;
use crate::registry::{CacheIndex, CacheRegistry, ResourceCache};
use crate::worker::{RevisionFn, RevisionWorker};

const LABEL: &str = "service";

/// Criteria for [`ServiceCache::get_services_by_filter`]. Unset fields match
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceFilter {
    /// Exact namespace.
    pub namespace: Option<String>,
    /// Prefix of the service name.
    pub name_prefix: Option<String>,
    /// Exact business line.
    pub business: Option<String>,
    /// Metadata key and value that must be present.
    pub metadata: Option<(String, String)>,
}

impl ServiceFilter {
    fn matches(&self, service: &Service) -> bool {
        self.namespace.as_ref().map_or(true, |ns| &service.namespace == ns)
            && self
                .name_prefix
                .as_ref()
                .map_or(true, |p| service.name.starts_with(p.as_str()))
            && self.business.as_ref().map_or(true, |b| &service.business == b)
            && self
                .metadata
                .as_ref()
                .map_or(true, |(k, v)| service.meta.get(k) == Some(v))
    }
}

/// Services that changed in one batch.
#[derive(Debug, Default)]
struct BatchEffect {
    revisions: Vec<(String, bool)>,
    namespaces: HashSet<String>,
}

/// The service cache.
pub struct ServiceCache {
    core: UpdateCore,
    ids: Arc<DashMap<String, Arc<Service>>>,
    names: DashMap<ServiceKey, Arc<Service>>,
    namespaces: DashMap<String, HashSet<String>>,
    cl5_names: DashMap<String, Arc<Service>>,
    /// target service ID -> alias ID -> alias
    aliases: DashMap<String, HashMap<String, Arc<Service>>>,
    pending_aliases: DashMap<String, Arc<Service>>,
    namespace_counts: DashMap<String, NamespaceServiceCount>,
    list_revisions: DashMap<String, String>,
    instances: Arc<Link<dyn InstanceAccessor>>,
    worker: RevisionWorker,
}

impl std::fmt::Debug for ServiceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCache")
            .field("services", &self.ids.len())
            .field("namespaces", &self.namespaces.len())
            .field("pending_aliases", &self.pending_aliases.len())
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

impl ServiceCache {
    /// Create an empty cache.
    pub fn new(store: Arc<dyn Store>, config: Arc<CacheConfig>) -> Self {
        let worker = RevisionWorker::new(
            config.revision_workers,
            config.revision_queue_size,
            config.revision_compute_delay,
        );
        Self {
            core: UpdateCore::new(CacheIndex::Service.name(), store, config),
            ids: Arc::new(DashMap::new()),
            names: DashMap::new(),
            namespaces: DashMap::new(),
            cl5_names: DashMap::new(),
            aliases: DashMap::new(),
            pending_aliases: DashMap::new(),
            namespace_counts: DashMap::new(),
            list_revisions: DashMap::new(),
            instances: Arc::new(Link::new(CacheIndex::Service.name(), CacheIndex::Instance.name())),
            worker,
        }
    }

    /// Update, pulling again if this call joined a pull already in flight.
    pub async fn update_fresh(&self) -> Result<UpdateSummary> {
        let summary = self.core.update_fresh(|| self.pull()).await?;
        self.check_all().await;
        Ok(summary)
    }

    async fn pull(&self) -> Result<PullOutcome> {
        let services = self
            .core
            .store()
            .get_more_services(self.core.last_fetch_time(), self.core.is_first_update())
            .await?;

        let last_mtime = max_modify_time(&services);
        let total = services.len();
        let effect = self.apply(services);

        for (id, valid) in &effect.revisions {
            self.worker.notify(id, *valid).await?;
        }
        self.recompute_namespace_counts(&effect.namespaces);

        Ok(PullOutcome::single(LABEL, last_mtime, total))
    }

    fn apply(&self, services: Vec<Service>) -> BatchEffect {
        let mut effect = BatchEffect::default();
        let mut removed = 0usize;

        for service in services {
            let service = Arc::new(service);
            effect.namespaces.insert(service.namespace.clone());

            if !service.valid {
                if let Some(old) = self.remove_indices(&service.id) {
                    effect.namespaces.insert(old.namespace.clone());
                    removed += 1;
                }
                effect.revisions.push((service.id.clone(), false));
                continue;
            }

            if let Some(old) = self.replace_indices(&service) {
                effect.namespaces.insert(old.namespace.clone());
            }
            effect.revisions.push((service.id.clone(), true));
        }

        self.link_pending_aliases();
        if removed > 0 {
            debug!(cache = LABEL, removed, "services removed");
        }
        effect
    }

    /// Index `service`, overwriting any previous version in place. New keys
    /// are written before stale ones are dropped, so the service stays
    /// visible under every key it keeps.
    fn replace_indices(&self, service: &Arc<Service>) -> Option<Arc<Service>> {
        let old = self.ids.insert(service.id.clone(), Arc::clone(service));

        self.names.insert(service.key(), Arc::clone(service));
        self.namespaces
            .entry(service.namespace.clone())
            .or_default()
            .insert(service.id.clone());
        let cl5_name = service.cl5_identity().map(|(_, name)| name.to_string());
        if let Some(name) = &cl5_name {
            self.cl5_names.insert(name.clone(), Arc::clone(service));
        }

        if let Some(old) = &old {
            if old.key() != service.key() {
                self.names.remove_if(&old.key(), |_, s| s.id == old.id);
            }
            if old.namespace != service.namespace {
                self.drop_from_namespace(&old.namespace, &old.id);
            }
            if let Some((_, old_cl5)) = old.cl5_identity() {
                if cl5_name.as_deref() != Some(old_cl5) {
                    self.cl5_names.remove_if(old_cl5, |_, s| s.id == old.id);
                }
            }
        }

        self.relink_alias(old.as_ref(), service);
        old
    }

    /// Keep an alias linked across an update that leaves its target alone;
    /// anything else goes back through the pending set.
    fn relink_alias(&self, old: Option<&Arc<Service>>, service: &Arc<Service>) {
        let target = service.reference.as_deref().filter(|_| service.is_alias());
        let old_target = old.and_then(|o| o.reference.as_deref());

        if let (Some(target), Some(old_target)) = (target, old_target) {
            if target == old_target {
                if let Some(mut links) = self.aliases.get_mut(target) {
                    if links.contains_key(&service.id) {
                        links.insert(service.id.clone(), Arc::clone(service));
                        return;
                    }
                }
            }
        }
        if let Some(old_target) = old_target {
            self.unlink_alias(old_target, &service.id);
        }
        match target {
            Some(target) => {
                self.pending_aliases.insert(service.id.clone(), Arc::clone(service));
                trace!(alias = %service.id, target, "alias pending");
            }
            None => {
                self.pending_aliases.remove(&service.id);
            }
        }
    }

    fn unlink_alias(&self, target: &str, alias_id: &str) {
        let emptied = match self.aliases.get_mut(target) {
            Some(mut links) => {
                links.remove(alias_id);
                links.is_empty()
            }
            None => false,
        };
        if emptied {
            self.aliases.remove_if(target, |_, links| links.is_empty());
        }
    }

    fn drop_from_namespace(&self, namespace: &str, id: &str) {
        let emptied = match self.namespaces.get_mut(namespace) {
            Some(mut ids) => {
                ids.remove(id);
                ids.is_empty()
            }
            None => false,
        };
        if emptied {
            self.namespaces.remove_if(namespace, |_, ids| ids.is_empty());
        }
    }

    fn remove_indices(&self, id: &str) -> Option<Arc<Service>> {
        let (_, old) = self.ids.remove(id)?;

        self.names.remove_if(&old.key(), |_, s| s.id == old.id);
        self.drop_from_namespace(&old.namespace, &old.id);
        if let Some((_, cl5_name)) = old.cl5_identity() {
            self.cl5_names.remove_if(cl5_name, |_, s| s.id == old.id);
        }

        self.pending_aliases.remove(id);
        if let Some(target) = old.reference.as_deref() {
            self.unlink_alias(target, id);
        }
        // Aliases of a removed service wait for it to come back.
        if let Some((_, orphans)) = self.aliases.remove(id) {
            for (alias_id, alias) in orphans {
                self.pending_aliases.insert(alias_id, alias);
            }
        }
        Some(old)
    }

    fn link_pending_aliases(&self) {
        let ready: Vec<Arc<Service>> = self
            .pending_aliases
            .iter()
            .filter(|a| {
                a.reference
                    .as_deref()
                    .is_some_and(|target| self.ids.contains_key(target))
            })
            .map(|a| Arc::clone(a.value()))
            .collect();

        for alias in ready {
            let Some(target) = alias.reference.clone() else {
                continue;
            };
            self.pending_aliases.remove(&alias.id);
            self.aliases
                .entry(target)
                .or_default()
                .insert(alias.id.clone(), alias);
        }
    }

    async fn check_all(&self) {
        if !self.core.should_check_all() {
            return;
        }
        match self.core.store().get_services_count().await {
            Ok(stored) => {
                self.core.reconcile(self.ids.len(), stored);
            }
            Err(err) => debug!(cache = LABEL, error = %err, "service count check skipped"),
        }
    }

    /// Look up a service by `(namespace, name)`.
    pub fn get_service_by_name(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        self.names
            .get(&ServiceKey::new(namespace, name))
            .map(|s| Arc::clone(s.value()))
    }

    /// Look up a service by its legacy cl5 name.
    pub fn get_service_by_cl5_name(&self, cl5_name: &str) -> Option<Arc<Service>> {
        self.cl5_names.get(cl5_name).map(|s| Arc::clone(s.value()))
    }

    /// Aliases pointing at `service_id`, sorted by ID.
    pub fn get_alias_for(&self, service_id: &str) -> Vec<Arc<Service>> {
        let mut aliases: Vec<Arc<Service>> = self
            .aliases
            .get(service_id)
            .map(|links| links.values().cloned().collect())
            .unwrap_or_default();
        aliases.sort_by(|a, b| a.id.cmp(&b.id));
        aliases
    }

    /// The service an alias points at. `None` for services that are not
    /// linked aliases.
    pub fn resolve_alias(&self, alias_id: &str) -> Option<Arc<Service>> {
        let alias = self.ids.get(alias_id).map(|s| Arc::clone(s.value()))?;
        let target = alias.reference.as_deref().filter(|_| alias.is_alias())?;
        let linked = self
            .aliases
            .get(target)
            .is_some_and(|links| links.contains_key(alias_id));
        if linked {
            self.get_service_by_id(target)
        } else {
            None
        }
    }

    /// Number of aliases whose target is not cached.
    pub fn pending_alias_count(&self) -> usize {
        self.pending_aliases.len()
    }

    /// Services of `namespace`, sorted by name, with a revision over the
    /// list.
    pub fn list_services(&self, namespace: &str) -> (String, Vec<Arc<Service>>) {
        let mut services: Vec<Arc<Service>> = self
            .namespaces
            .get(namespace)
            .map(|ids| ids.iter().filter_map(|id| self.get_service_by_id(id)).collect())
            .unwrap_or_default();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        let revision = self
            .list_revisions
            .get(namespace)
            .map(|r| r.value().clone())
            .unwrap_or_default();
        (revision, services)
    }

    /// Namespaces with at least one service, sorted.
    pub fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self.namespaces.iter().map(|e| e.key().clone()).collect();
        namespaces.sort_unstable();
        namespaces
    }

    /// Service and instance totals of `namespace`.
    pub fn get_namespace_count(&self, namespace: &str) -> Option<NamespaceServiceCount> {
        self.namespace_counts.get(namespace).map(|c| c.value().clone())
    }

    /// Fingerprint of a service and its instances, once computed.
    pub fn get_service_revision(&self, service_id: &str) -> Option<String> {
        self.worker.get(service_id)
    }

    /// Number of cached services.
    pub fn services_count(&self) -> usize {
        self.ids.len()
    }

    /// Visit every service. Return `false` from `f` to stop early.
    pub fn iterate_services<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Service>) -> bool,
    {
        for entry in self.ids.iter() {
            if !f(entry.value()) {
                break;
            }
        }
    }

    /// Services matching `filter`, sorted by namespace then name.
    pub fn get_services_by_filter(&self, filter: &ServiceFilter) -> Vec<Arc<Service>> {
        let mut services: Vec<Arc<Service>> = self
            .ids
            .iter()
            .filter(|s| filter.matches(s.value()))
            .map(|s| Arc::clone(s.value()))
            .collect();
        services.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        services
    }

    /// The revision worker pool.
    pub fn revision_worker(&self) -> &RevisionWorker {
        &self.worker
    }

    fn revision_fn(&self) -> RevisionFn {
        let services = Arc::clone(&self.ids);
        let instances = Arc::clone(&self.instances);
        Arc::new(move |service_id: &str| {
            let service = services.get(service_id).map(|s| Arc::clone(s.value()))?;
            let revisions = instances
                .get()
                .map(|accessor| accessor.instance_revisions(service_id))
                .unwrap_or_default();
            Some(compute_service_revision(&service.revision, &revisions))
        })
    }
}

impl ServiceAccessor for ServiceCache {
    fn get_service_by_id(&self, id: &str) -> Option<Arc<Service>> {
        self.ids.get(id).map(|s| Arc::clone(s.value()))
    }
}

#[async_trait]
impl RevisionNotifier for ServiceCache {
    async fn notify_service_revision(&self, service_id: &str, valid: bool) -> Result<()> {
        self.worker.notify(service_id, valid).await
    }

    fn recompute_namespace_counts(&self, namespaces: &HashSet<String>) {
        let instances = self.instances.get().ok();
        for namespace in namespaces {
            let ids: Vec<String> = self
                .namespaces
                .get(namespace)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default();

            if ids.is_empty() {
                self.namespace_counts.remove(namespace);
                self.list_revisions.remove(namespace);
                report_namespace_counts(namespace, &NamespaceServiceCount::default());
                continue;
            }

            let mut count = NamespaceServiceCount {
                service_count: ids.len() as u32,
                ..Default::default()
            };
            let mut revisions = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(service) = self.get_service_by_id(id) {
                    revisions.push(service.revision.clone());
                }
                if let Some(instance_count) = instances.as_ref().and_then(|i| i.instance_count(id)) {
                    count.instance_count.merge(&instance_count);
                }
            }

            report_namespace_counts(namespace, &count);
            self.namespace_counts.insert(namespace.clone(), count);
            self.list_revisions
                .insert(namespace.clone(), composite_revision(&revisions));
        }
    }
}

#[async_trait]
impl ResourceCache for ServiceCache {
    fn index(&self) -> CacheIndex {
        CacheIndex::Service
    }

    fn initialize(&self, registry: &CacheRegistry) -> Result<()> {
        if let Some(instances) = registry.instance_accessor() {
            self.instances.bind(&instances);
        }
        self.worker.start(self.revision_fn())
    }

    async fn update(&self) -> Result<UpdateSummary> {
        let summary = self.core.update(|| self.pull()).await.result?;
        self.check_all().await;
        Ok(summary)
    }

    fn clear(&self) {
        self.ids.clear();
        self.names.clear();
        self.namespaces.clear();
        self.cl5_names.clear();
        self.aliases.clear();
        self.pending_aliases.clear();
        self.namespace_counts.clear();
        self.list_revisions.clear();
        self.worker.clear();
        self.core.clear();
    }

    fn close(&self) {
        self.worker.stop();
    }

    fn core(&self) -> &UpdateCore {
        &self.core
    }
}
