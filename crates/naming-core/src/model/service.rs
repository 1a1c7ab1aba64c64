//! Services, instances and their aggregate counts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{impl_cache_entity, ServiceKey};

/// Metadata key carrying the legacy cl5 sid of a service.
pub const CL5_SID_META: &str = "internal-cl5-sid";
/// Metadata key carrying the legacy cl5 name of a service.
pub const CL5_NAME_META: &str = "internal-cl5-name";

/// A registered service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Unique service ID.
    pub id: String,
    /// Service name.
    pub name: String,
    /// Owning namespace.
    pub namespace: String,
    /// Business line the service belongs to.
    pub business: String,
    /// Declared ports, comma separated.
    pub ports: String,
    /// Comma separated owner list.
    pub owner: String,
    /// Free-form comment.
    pub comment: String,
    /// For alias services, the ID of the service they point to.
    pub reference: Option<String>,
    /// Service metadata.
    pub meta: HashMap<String, String>,
    /// Store assigned revision.
    pub revision: String,
    /// `false` marks a deleted service.
    pub valid: bool,
    /// Creation time.
    pub create_time: DateTime<Utc>,
    /// Last modification time.
    pub modify_time: DateTime<Utc>,
}

impl_cache_entity!(Service, revision);

impl Service {
    /// Create a valid service with the given identity.
    pub fn new(id: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            revision: format!("{id}-rev"),
            id,
            name: name.into(),
            namespace: namespace.into(),
            valid: true,
            ..Default::default()
        }
    }

    /// The service's `(namespace, name)` key.
    #[must_use]
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Whether the service is an alias of another service.
    #[must_use]
    pub fn is_alias(&self) -> bool {
        self.reference.as_deref().is_some_and(|r| !r.is_empty())
    }

    /// Legacy cl5 `(sid, name)` pair, when both metadata keys are present.
    #[must_use]
    pub fn cl5_identity(&self) -> Option<(&str, &str)> {
        let sid = self.meta.get(CL5_SID_META)?;
        let name = self.meta.get(CL5_NAME_META)?;
        Some((sid.as_str(), name.as_str()))
    }
}

/// Physical location of an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Region.
    pub region: String,
    /// Zone.
    pub zone: String,
    /// Campus.
    pub campus: String,
}

/// A registered service instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Unique instance ID.
    pub id: String,
    /// ID of the owning service.
    pub service_id: String,
    /// Name of the owning service, denormalized by the store.
    pub service: String,
    /// Namespace of the owning service, denormalized by the store.
    pub namespace: String,
    /// VPC the instance lives in.
    pub vpc_id: String,
    /// Host address.
    pub host: String,
    /// Port.
    pub port: u32,
    /// Protocol spoken on the port.
    pub protocol: String,
    /// Version label.
    pub version: String,
    /// Load-balancing weight.
    pub weight: u32,
    /// Current health state.
    pub healthy: bool,
    /// Isolated instances receive no traffic.
    pub isolate: bool,
    /// Whether health checking is enabled.
    pub enable_health_check: bool,
    /// Logic set label.
    pub logic_set: String,
    /// Instance metadata.
    pub metadata: HashMap<String, String>,
    /// Physical location.
    pub location: Location,
    /// Store assigned revision.
    pub revision: String,
    /// `false` marks a deregistered instance.
    pub valid: bool,
    /// Creation time.
    pub create_time: DateTime<Utc>,
    /// Last modification time.
    pub modify_time: DateTime<Utc>,
}

impl_cache_entity!(Instance, revision);

impl Instance {
    /// Create a valid, healthy instance bound to `service_id`.
    pub fn new(id: impl Into<String>, service_id: impl Into<String>, host: impl Into<String>, port: u32) -> Self {
        let id = id.into();
        Self {
            revision: format!("{id}-rev"),
            id,
            service_id: service_id.into(),
            host: host.into(),
            port,
            weight: 100,
            healthy: true,
            valid: true,
            ..Default::default()
        }
    }
}

/// Instance totals for one version label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionCount {
    /// All instances.
    pub total: u32,
    /// Healthy instances.
    pub healthy: u32,
    /// Isolated instances.
    pub isolated: u32,
}

/// Pre-aggregated instance totals for a service or namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceCount {
    /// All instances.
    pub total: u32,
    /// Healthy instances.
    pub healthy: u32,
    /// Isolated instances.
    pub isolated: u32,
    /// The same totals broken out by version label.
    pub versions: HashMap<String, VersionCount>,
}

impl InstanceCount {
    /// Count one instance.
    pub fn add(&mut self, instance: &Instance) {
        let version = self.versions.entry(instance.version.clone()).or_default();
        self.total += 1;
        version.total += 1;
        if instance.healthy {
            self.healthy += 1;
            version.healthy += 1;
        }
        if instance.isolate {
            self.isolated += 1;
            version.isolated += 1;
        }
    }

    /// Fold another count into this one.
    pub fn merge(&mut self, other: &InstanceCount) {
        self.total += other.total;
        self.healthy += other.healthy;
        self.isolated += other.isolated;
        for (version, count) in &other.versions {
            let entry = self.versions.entry(version.clone()).or_default();
            entry.total += count.total;
            entry.healthy += count.healthy;
            entry.isolated += count.isolated;
        }
    }
}

/// Per-namespace service and instance totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceServiceCount {
    /// Number of services in the namespace.
    pub service_count: u32,
    /// Instance totals across the namespace.
    pub instance_count: InstanceCount,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_count_by_version() {
        let mut count = InstanceCount::default();
        let mut a = Instance::new("a", "svc", "10.0.0.1", 80);
        a.version = "v1".into();
        let mut b = Instance::new("b", "svc", "10.0.0.2", 80);
        b.version = "v2".into();
        b.healthy = false;
        b.isolate = true;

        count.add(&a);
        count.add(&b);

        assert_eq!(count.total, 2);
        assert_eq!(count.healthy, 1);
        assert_eq!(count.isolated, 1);
        assert_eq!(count.versions["v2"].isolated, 1);
        assert_eq!(count.versions["v1"].healthy, 1);
    }

    #[test]
    fn test_alias_detection() {
        let mut svc = Service::new("s1", "default", "orders");
        assert!(!svc.is_alias());
        svc.reference = Some("s0".into());
        assert!(svc.is_alias());
        svc.reference = Some(String::new());
        assert!(!svc.is_alias());
    }

    #[test]
    fn test_cl5_identity() {
        let mut svc = Service::new("s1", "Production", "cl5-svc");
        assert!(svc.cl5_identity().is_none());
        svc.meta.insert(CL5_SID_META.into(), "1:2".into());
        svc.meta.insert(CL5_NAME_META.into(), "legacy-name".into());
        assert_eq!(svc.cl5_identity(), Some(("1:2", "legacy-name")));
    }
}
