//! The persistent store, as seen by the caches.
//!
//! The store is an external collaborator. Caches only need incremental
//! "everything modified since" queries, the store clock, and a few counts
//! used for reconciliation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    CircuitBreakerRule, FaultDetectRule, Instance, L5IpConfig, L5Policy, L5Route, L5Section,
    LaneGroup, RateLimit, Role, RouterRule, RoutingConfig, Service, ServiceContract,
    StrategyDetail, User, UserGroup,
};
use crate::Result;

/// Incremental read interface of the persistent store.
///
/// Every `get_more_*` method must return each record whose modify time is
/// strictly after `since`, tombstones (`valid == false`) included. When
/// `first_update` is set the store returns the whole table instead.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Current store clock, in unix seconds.
    async fn get_unix_second(&self) -> Result<i64>;

    /// Services modified after `since`.
    async fn get_more_services(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<Service>>;

    /// Number of valid services.
    async fn get_services_count(&self) -> Result<usize>;

    /// Direct lookup of one service, tombstones excluded.
    async fn get_service_by_id(&self, id: &str) -> Result<Option<Service>>;

    /// Instances modified after `since`, read from one consistent snapshot.
    async fn get_more_instances(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<Instance>>;

    /// Number of valid instances.
    async fn get_instances_count(&self) -> Result<usize>;

    /// Legacy routing configurations modified after `since`.
    async fn get_more_routing_configs(
        &self,
        since: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<RoutingConfig>>;

    /// Router rules modified after `since`.
    async fn get_more_router_rules(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<RouterRule>>;

    /// Circuit-breaker rules modified after `since`.
    async fn get_more_circuit_breaker_rules(
        &self,
        since: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<CircuitBreakerRule>>;

    /// Fault-detection rules modified after `since`.
    async fn get_more_fault_detect_rules(
        &self,
        since: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<FaultDetectRule>>;

    /// Lane groups modified after `since`.
    async fn get_more_lane_groups(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<LaneGroup>>;

    /// Rate-limit rules modified after `since`.
    async fn get_more_rate_limits(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<RateLimit>>;

    /// Service contracts modified after `since`.
    async fn get_more_service_contracts(
        &self,
        since: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<ServiceContract>>;

    /// Users modified after `since`.
    async fn get_more_users(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<User>>;

    /// User groups modified after `since`.
    async fn get_more_groups(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<UserGroup>>;

    /// Roles modified after `since`.
    async fn get_more_roles(&self, since: DateTime<Utc>, first_update: bool) -> Result<Vec<Role>>;

    /// Strategies modified after `since`.
    async fn get_more_strategies(
        &self,
        since: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<StrategyDetail>>;

    /// L5 routes with a flow number greater than `flow`.
    async fn get_more_l5_routes(&self, flow: u32) -> Result<Vec<L5Route>>;

    /// L5 policies with a flow number greater than `flow`.
    async fn get_more_l5_policies(&self, flow: u32) -> Result<Vec<L5Policy>>;

    /// L5 sections with a flow number greater than `flow`.
    async fn get_more_l5_sections(&self, flow: u32) -> Result<Vec<L5Section>>;

    /// L5 ip configs with a flow number greater than `flow`.
    async fn get_more_l5_ip_configs(&self, flow: u32) -> Result<Vec<L5IpConfig>>;
}
