//! Composition root of the caches.
//!
//! [`CacheRegistry`] owns one instance of every enabled cache. It is built in
//! two phases: [`CacheRegistryBuilder::build`] constructs the caches with no
//! cross references, then [`CacheRegistry::initialize`] lets each cache
//! resolve the accessors it needs and starts the revision workers.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use naming_cache::{CacheIndex, CacheRegistry};
//! use naming_core::MemoryStore;
//!
//! let registry = Arc::new(
//!     CacheRegistry::builder()
//!         .store(Arc::new(MemoryStore::new()))
//!         .disable(CacheIndex::L5)
//!         .build()?,
//! );
//! registry.initialize()?;
//! registry.update_all().await?;
//! let handle = registry.spawn_update_loop();
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use naming_core::{CacheError, Result, Store};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::auth::{RoleCache, StrategyCache, UserCache};
use crate::base::{UpdateCore, UpdateSummary};
use crate::circuitbreaker::CircuitBreakerCache;
use crate::config::CacheConfig;
use crate::contract::ServiceContractCache;
use crate::faultdetect::FaultDetectCache;
use crate::instance::InstanceCache;
use crate::l5::L5Cache;
use crate::lane::LaneCache;
use crate::link::{InstanceAccessor, RevisionNotifier, ServiceAccessor, UserAccessor};
use crate::ratelimit::RateLimitCache;
use crate::routing::RoutingConfigCache;
use crate::service::ServiceCache;

/// Identifies a cache within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheIndex {
    /// Services.
    Service,
    /// Instances.
    Instance,
    /// Routing configs and router rules.
    RoutingConfig,
    /// Circuit-breaker rules.
    CircuitBreaker,
    /// Fault-detection rules.
    FaultDetect,
    /// Lane groups.
    Lane,
    /// Rate-limit rules.
    RateLimit,
    /// Legacy L5 tables.
    L5,
    /// Service contracts.
    ServiceContract,
    /// Users and groups.
    User,
    /// Roles.
    Role,
    /// Authorization strategies.
    Strategy,
}

impl CacheIndex {
    /// Every index, in update order.
    pub const ALL: [CacheIndex; 12] = [
        CacheIndex::Service,
        CacheIndex::Instance,
        CacheIndex::RoutingConfig,
        CacheIndex::CircuitBreaker,
        CacheIndex::FaultDetect,
        CacheIndex::Lane,
        CacheIndex::RateLimit,
        CacheIndex::L5,
        CacheIndex::ServiceContract,
        CacheIndex::User,
        CacheIndex::Role,
        CacheIndex::Strategy,
    ];

    /// Name used in logs, metrics and coalescing keys.
    pub const fn name(self) -> &'static str {
        match self {
            CacheIndex::Service => "service",
            CacheIndex::Instance => "instance",
            CacheIndex::RoutingConfig => "routing_config",
            CacheIndex::CircuitBreaker => "circuit_breaker",
            CacheIndex::FaultDetect => "fault_detect",
            CacheIndex::Lane => "lane",
            CacheIndex::RateLimit => "rate_limit",
            CacheIndex::L5 => "l5",
            CacheIndex::ServiceContract => "service_contract",
            CacheIndex::User => "user",
            CacheIndex::Role => "role",
            CacheIndex::Strategy => "strategy",
        }
    }
}

impl fmt::Display for CacheIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Behaviour shared by every resource cache.
#[async_trait]
pub trait ResourceCache: Send + Sync + 'static {
    /// Index of the cache.
    fn index(&self) -> CacheIndex;

    /// Resolve cross-cache links. Called once by
    /// [`CacheRegistry::initialize`], after every cache has been built.
    fn initialize(&self, registry: &CacheRegistry) -> Result<()> {
        let _ = registry;
        Ok(())
    }

    /// Pull every change since the last successful pull and apply it.
    async fn update(&self) -> Result<UpdateSummary>;

    /// Drop all cached state and rewind the cursor.
    fn clear(&self);

    /// Release background resources.
    fn close(&self) {}

    /// Cursor and dedup bookkeeping.
    fn core(&self) -> &UpdateCore;
}

/// All caches of one control plane.
pub struct CacheRegistry {
    store: Arc<dyn Store>,
    config: Arc<CacheConfig>,
    services: Option<Arc<ServiceCache>>,
    instances: Option<Arc<InstanceCache>>,
    routing: Option<Arc<RoutingConfigCache>>,
    circuit_breakers: Option<Arc<CircuitBreakerCache>>,
    fault_detects: Option<Arc<FaultDetectCache>>,
    lanes: Option<Arc<LaneCache>>,
    rate_limits: Option<Arc<RateLimitCache>>,
    l5: Option<Arc<L5Cache>>,
    contracts: Option<Arc<ServiceContractCache>>,
    users: Option<Arc<UserCache>>,
    roles: Option<Arc<RoleCache>>,
    strategies: Option<Arc<StrategyCache>>,
    caches: Vec<Arc<dyn ResourceCache>>,
    initialized: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let caches: Vec<CacheIndex> = self.caches.iter().map(|c| c.index()).collect();
        f.debug_struct("CacheRegistry")
            .field("caches", &caches)
            .field("initialized", &self.initialized.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

macro_rules! typed_getters {
    ($($(#[$doc:meta])* $method:ident => $field:ident : $ty:ty),* $(,)?) => {
        $(
            $(#[$doc])*
            pub fn $method(&self) -> Option<&Arc<$ty>> {
                self.$field.as_ref()
            }
        )*
    };
}

impl CacheRegistry {
    /// Start building a registry.
    pub fn builder() -> CacheRegistryBuilder {
        CacheRegistryBuilder::new()
    }

    typed_getters! {
        /// The service cache.
        services => services: ServiceCache,
        /// The instance cache.
        instances => instances: InstanceCache,
        /// The routing cache.
        routing => routing: RoutingConfigCache,
        /// The circuit-breaker cache.
        circuit_breakers => circuit_breakers: CircuitBreakerCache,
        /// The fault-detection cache.
        fault_detects => fault_detects: FaultDetectCache,
        /// The lane cache.
        lanes => lanes: LaneCache,
        /// The rate-limit cache.
        rate_limits => rate_limits: RateLimitCache,
        /// The legacy L5 cache.
        l5 => l5: L5Cache,
        /// The service contract cache.
        contracts => contracts: ServiceContractCache,
        /// The user cache.
        users => users: UserCache,
        /// The role cache.
        roles => roles: RoleCache,
        /// The strategy cache.
        strategies => strategies: StrategyCache,
    }

    /// The cache registered under `index`, if enabled.
    pub fn get_cacher(&self, index: CacheIndex) -> Option<Arc<dyn ResourceCache>> {
        self.caches.iter().find(|c| c.index() == index).cloned()
    }

    /// Every enabled cache, in update order.
    pub fn caches(&self) -> &[Arc<dyn ResourceCache>] {
        &self.caches
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Shared configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Interval of the update loop.
    pub fn update_interval(&self) -> Duration {
        self.config.update_interval
    }

    /// Minimum interval between two metric reports of one cache.
    pub fn report_interval(&self) -> Duration {
        self.config.report_interval
    }

    /// Service lookups, when the service cache is enabled.
    pub fn service_accessor(&self) -> Option<Arc<dyn ServiceAccessor>> {
        self.services
            .as_ref()
            .map(|s| Arc::clone(s) as Arc<dyn ServiceAccessor>)
    }

    /// Revision notifications, when the service cache is enabled.
    pub fn revision_notifier(&self) -> Option<Arc<dyn RevisionNotifier>> {
        self.services
            .as_ref()
            .map(|s| Arc::clone(s) as Arc<dyn RevisionNotifier>)
    }

    /// Instance lookups, when the instance cache is enabled.
    pub fn instance_accessor(&self) -> Option<Arc<dyn InstanceAccessor>> {
        self.instances
            .as_ref()
            .map(|s| Arc::clone(s) as Arc<dyn InstanceAccessor>)
    }

    /// User and group lookups, when the user cache is enabled.
    pub fn user_accessor(&self) -> Option<Arc<dyn UserAccessor>> {
        self.users
            .as_ref()
            .map(|s| Arc::clone(s) as Arc<dyn UserAccessor>)
    }

    /// Wire the caches together and start background workers.
    ///
    /// Must run inside a tokio runtime. Calling it again is harmless.
    pub fn initialize(&self) -> Result<()> {
        for cache in &self.caches {
            cache.initialize(self)?;
        }
        if !self.initialized.swap(true, Ordering::AcqRel) {
            info!(caches = self.caches.len(), "cache registry initialized");
        }
        Ok(())
    }

    /// Whether [`initialize`](Self::initialize) has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Run one update of every cache concurrently.
    ///
    /// Every cache is updated even if some fail; the first failure is
    /// returned.
    pub async fn update_all(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(CacheError::not_initialized("registry", "initialize"));
        }

        let results = join_all(self.caches.iter().map(|c| c.update())).await;

        let mut first_error = None;
        for (cache, result) in self.caches.iter().zip(results) {
            if let Err(err) = result {
                warn!(cache = %cache.index(), error = %err, "cache update failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drop the state of every cache.
    pub fn clear_all(&self) {
        for cache in &self.caches {
            cache.clear();
        }
        debug!("all caches cleared");
    }

    /// Stop the update loop and background workers.
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        for cache in &self.caches {
            cache.close();
        }
        info!("cache registry closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Drive [`update_all`](Self::update_all) every `update_interval` until
    /// [`close`](Self::close) is called.
    pub fn spawn_update_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.update_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = registry.update_all().await {
                            debug!(error = %err, "update round finished with errors");
                        }
                    }
                }
            }
            info!("cache update loop stopped");
        })
    }
}

/// Builder for a [`CacheRegistry`].
#[derive(Default)]
pub struct CacheRegistryBuilder {
    store: Option<Arc<dyn Store>>,
    config: CacheConfig,
}

impl fmt::Debug for CacheRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRegistryBuilder")
            .field("has_store", &self.store.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl CacheRegistryBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store the caches pull from.
    ///
    /// This is required.
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the update loop interval.
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.config.update_interval = interval;
        self
    }

    /// Set the number of revision workers.
    pub fn revision_workers(mut self, workers: usize) -> Self {
        self.config.revision_workers = workers;
        self
    }

    /// Skip building the cache at `index`.
    pub fn disable(mut self, index: CacheIndex) -> Self {
        self.config.disabled_caches.insert(index);
        self
    }

    /// Build the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No store was provided
    /// - The instance cache is enabled without the service cache
    pub fn build(self) -> Result<CacheRegistry> {
        let store = self
            .store
            .ok_or_else(|| CacheError::Configuration("store is required".into()))?;
        let config = Arc::new(self.config);

        if config.is_enabled(CacheIndex::Instance) && !config.is_enabled(CacheIndex::Service) {
            return Err(CacheError::Configuration(
                "the instance cache requires the service cache".into(),
            ));
        }

        let mut caches: Vec<Arc<dyn ResourceCache>> = Vec::new();
        macro_rules! build {
            ($index:expr, $ty:ty) => {
                if config.is_enabled($index) {
                    let cache = Arc::new(<$ty>::new(Arc::clone(&store), Arc::clone(&config)));
                    caches.push(Arc::clone(&cache) as Arc<dyn ResourceCache>);
                    Some(cache)
                } else {
                    None
                }
            };
        }

        let services = build!(CacheIndex::Service, ServiceCache);
        let instances = build!(CacheIndex::Instance, InstanceCache);
        let routing = build!(CacheIndex::RoutingConfig, RoutingConfigCache);
        let circuit_breakers = build!(CacheIndex::CircuitBreaker, CircuitBreakerCache);
        let fault_detects = build!(CacheIndex::FaultDetect, FaultDetectCache);
        let lanes = build!(CacheIndex::Lane, LaneCache);
        let rate_limits = build!(CacheIndex::RateLimit, RateLimitCache);
        let l5 = build!(CacheIndex::L5, L5Cache);
        let contracts = build!(CacheIndex::ServiceContract, ServiceContractCache);
        let users = build!(CacheIndex::User, UserCache);
        let roles = build!(CacheIndex::Role, RoleCache);
        let strategies = build!(CacheIndex::Strategy, StrategyCache);

        let (shutdown, _) = watch::channel(false);
        debug!(caches = caches.len(), "cache registry built");

        Ok(CacheRegistry {
            store,
            config,
            services,
            instances,
            routing,
            circuit_breakers,
            fault_detects,
            lanes,
            rate_limits,
            l5,
            contracts,
            users,
            roles,
            strategies,
            caches,
            initialized: AtomicBool::new(false),
            shutdown,
        })
    }
}
