//! Data model of the records mirrored by the caches.

mod auth;
mod l5;
mod rules;
mod service;

pub use auth::{
    PolicyAction, Principal, PrincipalType, ResourceEntry, ResourceLabel, ResourceType, Role,
    StrategyDetail, StrategyResource, User, UserGroup, UserRoleType,
};
pub use l5::{L5IpConfig, L5Policy, L5Record, L5Route, L5Section};
pub use rules::{
    BreakerLevel, CircuitBreakerRule, FaultDetectRule, InterfaceDescriptor, LaneGroup,
    LaneGroupPayload, LaneRule, LaneService, MetadataRoutingConfig, RateLimit, RouteDestination,
    RouteEntry, RouteSource, RouterRule, RoutingConfig, RoutingPayload, RoutingPolicy,
    RuleRoutingConfig, ServiceContract,
};
pub use service::{
    Instance, InstanceCount, Location, NamespaceServiceCount, Service, VersionCount, CL5_NAME_META,
    CL5_SID_META,
};
