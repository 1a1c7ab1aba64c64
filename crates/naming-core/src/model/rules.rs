//! Governance rules: routing, circuit breaking, fault detection, lanes,
//! rate limits and service contracts.
//!
//! Rules whose bodies are stored as JSON payloads expose a `decode`
//! method. A payload that fails to decode makes the record invalid for
//! caching; caches skip it and keep applying the rest of the batch.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{impl_cache_entity, CacheError, Result, ServiceKey};

/// Legacy (v1) routing configuration, one per service.
///
/// The ID is the ID of the service the configuration belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// ID of the owning service.
    pub id: String,
    /// Inbound routes, as stored.
    pub in_bounds: String,
    /// Outbound routes, as stored.
    pub out_bounds: String,
    /// Store assigned revision.
    pub revision: String,
    /// `false` marks a deleted configuration.
    pub valid: bool,
    /// Last modification time.
    pub modify_time: DateTime<Utc>,
}

impl_cache_entity!(RoutingConfig, revision);

/// Routing policy of a v2 rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutingPolicy {
    /// Routes selected by request/label rules.
    #[default]
    RulePolicy,
    /// Routes selected by instance metadata.
    MetadataPolicy,
}

/// A v2 router rule with a JSON payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterRule {
    /// Unique rule ID.
    pub id: String,
    /// Rule name.
    pub name: String,
    /// Namespace the rule was created in.
    pub namespace: String,
    /// Whether the rule is enabled.
    pub enable: bool,
    /// Routing policy, selects how `config` is decoded.
    pub policy: RoutingPolicy,
    /// JSON payload.
    pub config: String,
    /// Lower values are evaluated first.
    pub priority: u32,
    /// Free-form description.
    pub description: String,
    /// Store assigned revision.
    pub revision: String,
    /// `false` marks a deleted rule.
    pub valid: bool,
    /// Last modification time.
    pub modify_time: DateTime<Utc>,
}

impl_cache_entity!(RouterRule, revision);

/// Source service matched by a rule-routing entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSource {
    /// Caller service name, may be `*`.
    pub service: String,
    /// Caller namespace, may be `*`.
    pub namespace: String,
    /// Request arguments that must match.
    #[serde(default)]
    pub arguments: HashMap<String, String>,
}

/// Destination group selected by a rule-routing entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDestination {
    /// Callee service name.
    pub service: String,
    /// Callee namespace.
    pub namespace: String,
    /// Instance labels selecting the group.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Relative weight of the group.
    #[serde(default)]
    pub weight: u32,
    /// Group priority.
    #[serde(default)]
    pub priority: u32,
    /// Whether traffic to the group is isolated.
    #[serde(default)]
    pub isolate: bool,
}

/// One entry of a rule-routing payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Entry name.
    #[serde(default)]
    pub name: String,
    /// Callers the entry applies to.
    #[serde(default)]
    pub sources: Vec<RouteSource>,
    /// Destination groups.
    #[serde(default)]
    pub destinations: Vec<RouteDestination>,
}

/// Decoded rule-routing payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRoutingConfig {
    /// Routing entries, evaluated in order.
    pub rules: Vec<RouteEntry>,
}

/// Decoded metadata-routing payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRoutingConfig {
    /// Service whose instances are selected.
    pub service: String,
    /// Namespace of that service.
    pub namespace: String,
    /// Failover behaviour when no instance matches.
    #[serde(default)]
    pub failover: String,
}

/// A decoded router rule payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingPayload {
    /// Payload of a [`RoutingPolicy::RulePolicy`] rule.
    Rule(RuleRoutingConfig),
    /// Payload of a [`RoutingPolicy::MetadataPolicy`] rule.
    Metadata(MetadataRoutingConfig),
}

impl RouterRule {
    /// Decode the JSON payload according to the rule's policy.
    pub fn decode(&self) -> Result<RoutingPayload> {
        let invalid = |reason: String| CacheError::invalid_record("router_rule", &self.id, reason);
        match self.policy {
            RoutingPolicy::RulePolicy => {
                let config: RuleRoutingConfig =
                    serde_json::from_str(&self.config).map_err(|e| invalid(e.to_string()))?;
                Ok(RoutingPayload::Rule(config))
            }
            RoutingPolicy::MetadataPolicy => {
                let config: MetadataRoutingConfig =
                    serde_json::from_str(&self.config).map_err(|e| invalid(e.to_string()))?;
                Ok(RoutingPayload::Metadata(config))
            }
        }
    }
}

impl RoutingPayload {
    /// The service the rule is looked up by.
    ///
    /// Rule routing is keyed by the first declared caller; metadata routing
    /// by the service whose instances it selects. A rule-routing payload
    /// without any caller applies to every service.
    #[must_use]
    pub fn target(&self) -> ServiceKey {
        match self {
            RoutingPayload::Rule(config) => config
                .rules
                .iter()
                .flat_map(|r| r.sources.first())
                .next()
                .map(|s| ServiceKey::new(s.namespace.clone(), s.service.clone()))
                .unwrap_or_else(ServiceKey::wildcard),
            RoutingPayload::Metadata(config) => {
                ServiceKey::new(config.namespace.clone(), config.service.clone())
            }
        }
    }
}

/// Granularity a circuit breaker trips at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreakerLevel {
    /// Whole service.
    #[default]
    Service,
    /// Single method.
    Method,
    /// Instance group.
    Group,
    /// Single instance.
    Instance,
}

/// A circuit-breaker rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerRule {
    /// Unique rule ID.
    pub id: String,
    /// Rule name.
    pub name: String,
    /// Namespace the rule was created in.
    pub namespace: String,
    /// Free-form description.
    pub description: String,
    /// Trip granularity.
    pub level: BreakerLevel,
    /// Whether the rule is enabled.
    pub enable: bool,
    /// Caller service, may be `*`.
    pub src_service: String,
    /// Caller namespace, may be `*`.
    pub src_namespace: String,
    /// Protected service, may be `*`.
    pub dst_service: String,
    /// Protected namespace, may be `*`.
    pub dst_namespace: String,
    /// Protected method, may be empty.
    pub dst_method: String,
    /// Rule body, as stored.
    pub rule: String,
    /// Store assigned revision.
    pub revision: String,
    /// `false` marks a deleted rule.
    pub valid: bool,
    /// Last modification time.
    pub modify_time: DateTime<Utc>,
}

impl_cache_entity!(CircuitBreakerRule, revision);

impl CircuitBreakerRule {
    /// The protected service.
    #[must_use]
    pub fn target(&self) -> ServiceKey {
        ServiceKey::new(self.dst_namespace.clone(), self.dst_service.clone())
    }
}

/// A fault-detection (outlier probing) rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaultDetectRule {
    /// Unique rule ID.
    pub id: String,
    /// Rule name.
    pub name: String,
    /// Namespace the rule was created in.
    pub namespace: String,
    /// Free-form description.
    pub description: String,
    /// Probed service, may be `*`.
    pub dst_service: String,
    /// Probed namespace, may be `*`.
    pub dst_namespace: String,
    /// Probed method, may be empty.
    pub dst_method: String,
    /// Rule body, as stored.
    pub rule: String,
    /// Store assigned revision.
    pub revision: String,
    /// `false` marks a deleted rule.
    pub valid: bool,
    /// Last modification time.
    pub modify_time: DateTime<Utc>,
}

impl_cache_entity!(FaultDetectRule, revision);

impl FaultDetectRule {
    /// The probed service.
    #[must_use]
    pub fn target(&self) -> ServiceKey {
        ServiceKey::new(self.dst_namespace.clone(), self.dst_service.clone())
    }
}

/// A lane group: a set of lanes spanning several services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneGroup {
    /// Unique group ID.
    pub id: String,
    /// Group name, unique across groups.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// JSON payload, see [`LaneGroupPayload`].
    pub rule: String,
    /// Store assigned revision.
    pub revision: String,
    /// `false` marks a deleted group.
    pub valid: bool,
    /// Last modification time.
    pub modify_time: DateTime<Utc>,
}

impl_cache_entity!(LaneGroup, revision);

/// A service referenced by a lane group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneService {
    /// Service name, may be `*`.
    pub service: String,
    /// Namespace, may be `*`.
    pub namespace: String,
}

/// One lane inside a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneRule {
    /// Lane ID.
    pub id: String,
    /// Lane name.
    pub name: String,
    /// Whether the lane is enabled.
    #[serde(default)]
    pub enable: bool,
    /// Label value that selects this lane.
    #[serde(default)]
    pub default_label_value: String,
    /// Lower values win.
    #[serde(default)]
    pub priority: u32,
}

/// Decoded body of a lane group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneGroupPayload {
    /// Services where traffic enters the lanes.
    #[serde(default)]
    pub entries: Vec<LaneService>,
    /// Services that take part in the lanes.
    #[serde(default)]
    pub destinations: Vec<LaneService>,
    /// Lanes of the group.
    #[serde(default)]
    pub rules: Vec<LaneRule>,
}

impl LaneGroup {
    /// Decode the JSON payload.
    pub fn decode(&self) -> Result<LaneGroupPayload> {
        serde_json::from_str(&self.rule)
            .map_err(|e| CacheError::invalid_record("lane_group", &self.id, e.to_string()))
    }
}

impl LaneGroupPayload {
    /// Every distinct service the group is bound to, entries first.
    #[must_use]
    pub fn targets(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = Vec::new();
        for svc in self.entries.iter().chain(self.destinations.iter()) {
            let key = ServiceKey::new(svc.namespace.clone(), svc.service.clone());
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

/// A rate-limit rule.
///
/// Rules may arrive with only `service_id` set; the cache fills in
/// `namespace` and `service` once the owning service is known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Unique rule ID.
    pub id: String,
    /// ID of the owning service.
    pub service_id: String,
    /// Rule name.
    pub name: String,
    /// Namespace of the owning service.
    pub namespace: String,
    /// Name of the owning service.
    pub service: String,
    /// Limited method.
    pub method: String,
    /// Labels matched against requests, as stored.
    pub labels: String,
    /// Lower values are evaluated first.
    pub priority: u32,
    /// Rule body, as stored.
    pub rule: String,
    /// Disabled rules are cached but not enforced.
    pub disable: bool,
    /// Store assigned revision.
    pub revision: String,
    /// `false` marks a deleted rule.
    pub valid: bool,
    /// Last modification time.
    pub modify_time: DateTime<Utc>,
}

impl_cache_entity!(RateLimit, revision);

impl RateLimit {
    /// The owning service, empty until resolved.
    #[must_use]
    pub fn target(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.service.clone())
    }

    /// Whether the owning service name still needs to be resolved.
    #[must_use]
    pub fn needs_fix(&self) -> bool {
        (self.namespace.is_empty() || self.service.is_empty()) && !self.service_id.is_empty()
    }
}

/// One interface declared by a service contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// Interface ID.
    pub id: String,
    /// Method (for HTTP) or RPC name.
    pub method: String,
    /// Path of the interface.
    pub path: String,
    /// Interface name.
    pub name: String,
    /// Interface body, as stored.
    pub content: String,
    /// Interface revision.
    pub revision: String,
}

/// A service contract: the published interfaces of a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceContract {
    /// Unique contract ID.
    pub id: String,
    /// Namespace of the service.
    pub namespace: String,
    /// Service name.
    pub service: String,
    /// Contract name.
    pub name: String,
    /// Contract protocol.
    pub protocol: String,
    /// Contract version.
    pub version: String,
    /// Contract body, as stored.
    pub content: String,
    /// Declared interfaces.
    pub interfaces: Vec<InterfaceDescriptor>,
    /// Store assigned revision.
    pub revision: String,
    /// `false` marks a deleted contract.
    pub valid: bool,
    /// Last modification time.
    pub modify_time: DateTime<Utc>,
}

impl_cache_entity!(ServiceContract, revision);

impl ServiceContract {
    /// The owning service.
    #[must_use]
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.service.clone())
    }
}
