//! In-memory [`Store`] implementation.
//!
//! `MemoryStore` keeps every table in a `DashMap` and stamps records with
//! its own clock on write, which makes incremental pulls reproducible in
//! tests, benchmarks and demos. It can also count pulls per table, delay
//! pulls, and inject failures or panics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::model::{
    CircuitBreakerRule, FaultDetectRule, Instance, L5IpConfig, L5Policy, L5Record, L5Route,
    L5Section, LaneGroup, RateLimit, Role, RouterRule, RoutingConfig, Service, ServiceContract,
    StrategyDetail, User, UserGroup,
};
use crate::{CacheEntity, CacheError, Result, Store};

/// Table names used for pull accounting and failure injection.
pub mod table {
    /// Services.
    pub const SERVICES: &str = "services";
    /// Instances.
    pub const INSTANCES: &str = "instances";
    /// Legacy routing configurations.
    pub const ROUTING_CONFIGS: &str = "routing_configs";
    /// Router rules.
    pub const ROUTER_RULES: &str = "router_rules";
    /// Circuit-breaker rules.
    pub const CIRCUIT_BREAKERS: &str = "circuit_breakers";
    /// Fault-detection rules.
    pub const FAULT_DETECTS: &str = "fault_detects";
    /// Lane groups.
    pub const LANE_GROUPS: &str = "lane_groups";
    /// Rate-limit rules.
    pub const RATE_LIMITS: &str = "rate_limits";
    /// Service contracts.
    pub const SERVICE_CONTRACTS: &str = "service_contracts";
    /// Users.
    pub const USERS: &str = "users";
    /// User groups.
    pub const GROUPS: &str = "groups";
    /// Roles.
    pub const ROLES: &str = "roles";
    /// Strategies.
    pub const STRATEGIES: &str = "strategies";
    /// L5 routes.
    pub const L5_ROUTES: &str = "l5_routes";
    /// L5 policies.
    pub const L5_POLICIES: &str = "l5_policies";
    /// L5 sections.
    pub const L5_SECTIONS: &str = "l5_sections";
    /// L5 ip configs.
    pub const L5_IP_CONFIGS: &str = "l5_ip_configs";
}

#[derive(Debug)]
struct Table<T> {
    rows: DashMap<String, T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self { rows: DashMap::new() }
    }
}

impl<T: CacheEntity> Table<T> {
    fn put(&self, mut record: T, now: DateTime<Utc>) {
        record.set_modify_time(now);
        self.rows.insert(record.id().to_string(), record);
    }

    fn more(&self, since: DateTime<Utc>, first_update: bool) -> Vec<T> {
        self.rows
            .iter()
            .filter(|r| first_update || r.modify_time() > since)
            .map(|r| r.value().clone())
            .collect()
    }

    fn valid_count(&self) -> usize {
        self.rows.iter().filter(|r| r.is_valid()).count()
    }
}

#[derive(Debug)]
struct FlowTable<T> {
    rows: Mutex<Vec<T>>,
}

impl<T> Default for FlowTable<T> {
    fn default() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
        }
    }
}

impl<T: L5Record> FlowTable<T> {
    fn put(&self, mut record: T, flow: u32) {
        record.set_flow(flow);
        self.rows.lock().push(record);
    }

    fn more(&self, flow: u32) -> Vec<T> {
        self.rows
            .lock()
            .iter()
            .filter(|r| r.flow() > flow)
            .cloned()
            .collect()
    }
}

/// An in-memory store with a manually driven clock.
#[derive(Debug)]
pub struct MemoryStore {
    clock: Mutex<DateTime<Utc>>,
    flow: AtomicU32,
    latency: Mutex<Option<Duration>>,
    failures: Mutex<HashMap<String, usize>>,
    panics: Mutex<HashMap<String, usize>>,
    pulls: DashMap<String, usize>,

    services: Table<Service>,
    instances: Table<Instance>,
    routing_configs: Table<RoutingConfig>,
    router_rules: Table<RouterRule>,
    circuit_breakers: Table<CircuitBreakerRule>,
    fault_detects: Table<FaultDetectRule>,
    lane_groups: Table<LaneGroup>,
    rate_limits: Table<RateLimit>,
    service_contracts: Table<ServiceContract>,
    users: Table<User>,
    groups: Table<UserGroup>,
    roles: Table<Role>,
    strategies: Table<StrategyDetail>,
    l5_routes: FlowTable<L5Route>,
    l5_policies: FlowTable<L5Policy>,
    l5_sections: FlowTable<L5Section>,
    l5_ip_configs: FlowTable<L5IpConfig>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! put_methods {
    ($($method:ident => $field:ident : $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Insert or replace a `", stringify!($ty), "`, stamping it with the store clock.")]
            pub fn $method(&self, record: $ty) {
                self.$field.put(record, self.now());
            }
        )*
    };
}

macro_rules! put_flow_methods {
    ($($method:ident => $field:ident : $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Append a `", stringify!($ty), "` with the next flow number.")]
            pub fn $method(&self, record: $ty) {
                let flow = self.flow.fetch_add(1, Ordering::SeqCst) + 1;
                self.$field.put(record, flow);
            }
        )*
    };
}

impl MemoryStore {
    /// Create an empty store whose clock starts at the current second.
    pub fn new() -> Self {
        let now = Utc::now().timestamp();
        Self::with_clock(Utc.timestamp_opt(now, 0).single().unwrap_or_default())
    }

    /// Create an empty store whose clock starts at `start`.
    pub fn with_clock(start: DateTime<Utc>) -> Self {
        Self {
            clock: Mutex::new(start),
            flow: AtomicU32::new(0),
            latency: Mutex::new(None),
            failures: Mutex::new(HashMap::new()),
            panics: Mutex::new(HashMap::new()),
            pulls: DashMap::new(),
            services: Table::default(),
            instances: Table::default(),
            routing_configs: Table::default(),
            router_rules: Table::default(),
            circuit_breakers: Table::default(),
            fault_detects: Table::default(),
            lane_groups: Table::default(),
            rate_limits: Table::default(),
            service_contracts: Table::default(),
            users: Table::default(),
            groups: Table::default(),
            roles: Table::default(),
            strategies: Table::default(),
            l5_routes: FlowTable::default(),
            l5_policies: FlowTable::default(),
            l5_sections: FlowTable::default(),
            l5_ip_configs: FlowTable::default(),
        }
    }

    /// Current store clock.
    pub fn now(&self) -> DateTime<Utc> {
        *self.clock.lock()
    }

    /// Move the store clock forward.
    pub fn advance(&self, by: Duration) {
        let mut clock = self.clock.lock();
        *clock += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Delay every pull by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Make the next `times` pulls of `table` fail.
    pub fn fail_next(&self, table: &str, times: usize) {
        self.failures.lock().insert(table.to_string(), times);
    }

    /// Make the next `times` pulls of `table` panic.
    pub fn panic_next(&self, table: &str, times: usize) {
        self.panics.lock().insert(table.to_string(), times);
    }

    /// Number of pulls served for `table`, failed ones included.
    pub fn pull_count(&self, table: &str) -> usize {
        self.pulls.get(table).map(|c| *c).unwrap_or(0)
    }

    put_methods! {
        put_service => services: Service,
        put_instance => instances: Instance,
        put_routing_config => routing_configs: RoutingConfig,
        put_router_rule => router_rules: RouterRule,
        put_circuit_breaker_rule => circuit_breakers: CircuitBreakerRule,
        put_fault_detect_rule => fault_detects: FaultDetectRule,
        put_lane_group => lane_groups: LaneGroup,
        put_rate_limit => rate_limits: RateLimit,
        put_service_contract => service_contracts: ServiceContract,
        put_user => users: User,
        put_group => groups: UserGroup,
        put_role => roles: Role,
        put_strategy => strategies: StrategyDetail,
    }

    put_flow_methods! {
        put_l5_route => l5_routes: L5Route,
        put_l5_policy => l5_policies: L5Policy,
        put_l5_section => l5_sections: L5Section,
        put_l5_ip_config => l5_ip_configs: L5IpConfig,
    }

    async fn before_pull(&self, table: &str) -> Result<()> {
        *self.pulls.entry(table.to_string()).or_insert(0) += 1;

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if take_one(&self.panics, table) {
            panic!("injected panic while reading {table}");
        }
        if take_one(&self.failures, table) {
            return Err(CacheError::store(table, "injected failure"));
        }

        trace!(table, "memory store pull");
        Ok(())
    }
}

fn take_one(slots: &Mutex<HashMap<String, usize>>, table: &str) -> bool {
    let mut slots = slots.lock();
    match slots.get_mut(table) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_unix_second(&self) -> Result<i64> {
        Ok(self.now().timestamp())
    }

    async fn get_more_services(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<Service>> {
        self.before_pull(table::SERVICES).await?;
        Ok(self.services.more(since, first_update))
    }

    async fn get_services_count(&self) -> Result<usize> {
        Ok(self.services.valid_count())
    }

    async fn get_service_by_id(&self, id: &str) -> Result<Option<Service>> {
        Ok(self
            .services
            .rows
            .get(id)
            .filter(|s| s.valid)
            .map(|s| s.value().clone()))
    }

    async fn get_more_instances(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<Instance>> {
        self.before_pull(table::INSTANCES).await?;
        Ok(self.instances.more(since, first_update))
    }

    async fn get_instances_count(&self) -> Result<usize> {
        Ok(self.instances.valid_count())
    }

    async fn get_more_routing_configs(
        &self,
        since: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<RoutingConfig>> {
        self.before_pull(table::ROUTING_CONFIGS).await?;
        Ok(self.routing_configs.more(since, first_update))
    }

    async fn get_more_router_rules(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<RouterRule>> {
        self.before_pull(table::ROUTER_RULES).await?;
        Ok(self.router_rules.more(since, first_update))
    }

    async fn get_more_circuit_breaker_rules(
        &self,
        since: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<CircuitBreakerRule>> {
        self.before_pull(table::CIRCUIT_BREAKERS).await?;
        Ok(self.circuit_breakers.more(since, first_update))
    }

    async fn get_more_fault_detect_rules(
        &self,
        since: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<FaultDetectRule>> {
        self.before_pull(table::FAULT_DETECTS).await?;
        Ok(self.fault_detects.more(since, first_update))
    }

    async fn get_more_lane_groups(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<LaneGroup>> {
        self.before_pull(table::LANE_GROUPS).await?;
        Ok(self.lane_groups.more(since, first_update))
    }

    async fn get_more_rate_limits(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<RateLimit>> {
        self.before_pull(table::RATE_LIMITS).await?;
        Ok(self.rate_limits.more(since, first_update))
    }

    async fn get_more_service_contracts(
        &self,
        since: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<ServiceContract>> {
        self.before_pull(table::SERVICE_CONTRACTS).await?;
        Ok(self.service_contracts.more(since, first_update))
    }

    async fn get_more_users(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<User>> {
        self.before_pull(table::USERS).await?;
        Ok(self.users.more(since, first_update))
    }

    async fn get_more_groups(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<UserGroup>> {
        self.before_pull(table::GROUPS).await?;
        Ok(self.groups.more(since, first_update))
    }

    async fn get_more_roles(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<Role>> {
        self.before_pull(table::ROLES).await?;
        Ok(self.roles.more(since, first_update))
    }

    async fn get_more_strategies(
        &self,
        since: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<StrategyDetail>> {
        self.before_pull(table::STRATEGIES).await?;
        Ok(self.strategies.more(since, first_update))
    }

    async fn get_more_l5_routes(&self, flow: u32) -> Result<Vec<L5Route>> {
        self.before_pull(table::L5_ROUTES).await?;
        Ok(self.l5_routes.more(flow))
    }

    async fn get_more_l5_policies(&self, flow: u32) -> Result<Vec<L5Policy>> {
        self.before_pull(table::L5_POLICIES).await?;
        Ok(self.l5_policies.more(flow))
    }

    async fn get_more_l5_sections(&self, flow: u32) -> Result<Vec<L5Section>> {
        self.before_pull(table::L5_SECTIONS).await?;
        Ok(self.l5_sections.more(flow))
    }

    async fn get_more_l5_ip_configs(&self, flow: u32) -> Result<Vec<L5IpConfig>> {
        self.before_pull(table::L5_IP_CONFIGS).await?;
        Ok(self.l5_ip_configs.more(flow))
    }
}
