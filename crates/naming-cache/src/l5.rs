//! Legacy L5 routing tables.
//!
//! L5 records carry no modify time. Each table keeps its own flow cursor,
//! the highest write sequence number applied so far, and the next pull asks
//! the store for everything above it. Pulls still run through
//! [`UpdateCore`] so concurrent callers share one round trip.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use naming_core::model::{L5IpConfig, L5Policy, L5Record, L5Route, L5Section};
use naming_core::{Result, Store};
use tracing::trace;

use crate::base::{PullOutcome, UpdateCore, UpdateSummary};
use crate::config::CacheConfig;
use crate::registry::{CacheIndex, ResourceCache};

#[derive(Debug, Default)]
struct FlowCursors {
    routes: AtomicU32,
    policies: AtomicU32,
    sections: AtomicU32,
    ip_configs: AtomicU32,
}

impl FlowCursors {
    fn advance<T: L5Record>(cursor: &AtomicU32, records: &[T]) {
        if let Some(max) = records.iter().map(|r| r.flow()).max() {
            cursor.fetch_max(max, Ordering::AcqRel);
        }
    }

    fn reset(&self) {
        for cursor in [&self.routes, &self.policies, &self.sections, &self.ip_configs] {
            cursor.store(0, Ordering::Release);
        }
    }
}

/// The L5 cache.
#[derive(Debug)]
pub struct L5Cache {
    core: UpdateCore,
    flows: FlowCursors,
    routes: DashMap<u32, HashMap<(u32, u32), Arc<L5Route>>>,
    policies: DashMap<u32, Arc<L5Policy>>,
    sections: DashMap<u32, BTreeMap<(u32, u32), Arc<L5Section>>>,
    ip_configs: DashMap<u32, Arc<L5IpConfig>>,
}

impl L5Cache {
    /// Create an empty cache.
    pub fn new(store: Arc<dyn Store>, config: Arc<CacheConfig>) -> Self {
        Self {
            core: UpdateCore::new(CacheIndex::L5.name(), store, config),
            flows: FlowCursors::default(),
            routes: DashMap::new(),
            policies: DashMap::new(),
            sections: DashMap::new(),
            ip_configs: DashMap::new(),
        }
    }

    async fn pull(&self) -> Result<PullOutcome> {
        let store = self.core.store();

        let routes = store.get_more_l5_routes(self.flows.routes.load(Ordering::Acquire)).await?;
        FlowCursors::advance(&self.flows.routes, &routes);
        let mut total = routes.len();
        self.apply_routes(routes);

        let policies = store
            .get_more_l5_policies(self.flows.policies.load(Ordering::Acquire))
            .await?;
        FlowCursors::advance(&self.flows.policies, &policies);
        total += policies.len();
        self.apply_policies(policies);

        let sections = store
            .get_more_l5_sections(self.flows.sections.load(Ordering::Acquire))
            .await?;
        FlowCursors::advance(&self.flows.sections, &sections);
        total += sections.len();
        self.apply_sections(sections);

        let ip_configs = store
            .get_more_l5_ip_configs(self.flows.ip_configs.load(Ordering::Acquire))
            .await?;
        FlowCursors::advance(&self.flows.ip_configs, &ip_configs);
        total += ip_configs.len();
        self.apply_ip_configs(ip_configs);

        trace!(cache = "l5", total, "l5 tables applied");
        Ok(PullOutcome {
            total,
            ..Default::default()
        })
    }

    fn apply_routes(&self, routes: Vec<L5Route>) {
        for route in routes {
            let key = (route.mod_id, route.cmd_id);
            if route.valid {
                self.routes.entry(route.ip).or_default().insert(key, Arc::new(route));
            } else {
                let ip = route.ip;
                if let Some(mut by_ip) = self.routes.get_mut(&ip) {
                    by_ip.remove(&key);
                }
                self.routes.remove_if(&ip, |_, by_ip| by_ip.is_empty());
            }
        }
    }

    fn apply_policies(&self, policies: Vec<L5Policy>) {
        for policy in policies {
            if policy.valid {
                self.policies.insert(policy.mod_id, Arc::new(policy));
            } else {
                self.policies.remove(&policy.mod_id);
            }
        }
    }

    fn apply_sections(&self, sections: Vec<L5Section>) {
        for section in sections {
            let key = (section.from, section.to);
            if section.valid {
                self.sections
                    .entry(section.mod_id)
                    .or_default()
                    .insert(key, Arc::new(section));
            } else {
                let mod_id = section.mod_id;
                if let Some(mut by_mod) = self.sections.get_mut(&mod_id) {
                    by_mod.remove(&key);
                }
                self.sections.remove_if(&mod_id, |_, by_mod| by_mod.is_empty());
            }
        }
    }

    fn apply_ip_configs(&self, configs: Vec<L5IpConfig>) {
        for config in configs {
            if config.valid {
                self.ip_configs.insert(config.ip, Arc::new(config));
            } else {
                self.ip_configs.remove(&config.ip);
            }
        }
    }

    /// Whether a route exists for the caller IP and module/command pair.
    pub fn check_route_exists(&self, ip: u32, mod_id: u32, cmd_id: u32) -> bool {
        self.routes
            .get(&ip)
            .is_some_and(|by_ip| by_ip.contains_key(&(mod_id, cmd_id)))
    }

    /// All routes of a caller IP.
    pub fn get_routes_by_ip(&self, ip: u32) -> Vec<Arc<L5Route>> {
        self.routes
            .get(&ip)
            .map(|by_ip| by_ip.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Division policy of a module.
    pub fn get_policy(&self, mod_id: u32) -> Option<Arc<L5Policy>> {
        self.policies.get(&mod_id).map(|p| Arc::clone(p.value()))
    }

    /// Sections of a module, ordered by their lower bound.
    pub fn get_sections(&self, mod_id: u32) -> Vec<Arc<L5Section>> {
        self.sections
            .get(&mod_id)
            .map(|by_mod| by_mod.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Configuration flag of a caller IP.
    pub fn get_ip_config(&self, ip: u32) -> Option<Arc<L5IpConfig>> {
        self.ip_configs.get(&ip).map(|c| Arc::clone(c.value()))
    }

    /// Highest route flow applied so far.
    pub fn route_flow(&self) -> u32 {
        self.flows.routes.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ResourceCache for L5Cache {
    fn index(&self) -> CacheIndex {
        CacheIndex::L5
    }

    async fn update(&self) -> Result<UpdateSummary> {
        self.core.update(|| self.pull()).await.result
    }

    fn clear(&self) {
        self.routes.clear();
        self.policies.clear();
        self.sections.clear();
        self.ip_configs.clear();
        self.flows.reset();
        self.core.clear();
    }

    fn core(&self) -> &UpdateCore {
        &self.core
    }
}
