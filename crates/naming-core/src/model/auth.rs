//! Users, groups, roles and authorization strategies.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::impl_cache_entity;

/// Kind of identity a principal represents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrincipalType {
    /// A single user.
    #[default]
    User,
    /// A user group.
    Group,
}

/// Subject of an authorization policy or role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal {
    /// User or group ID.
    pub id: String,
    /// Kind of principal.
    pub principal_type: PrincipalType,
}

impl Principal {
    /// A user principal.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            principal_type: PrincipalType::User,
        }
    }

    /// A group principal.
    pub fn group(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            principal_type: PrincipalType::Group,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.principal_type {
            PrincipalType::User => write!(f, "user/{}", self.id),
            PrincipalType::Group => write!(f, "group/{}", self.id),
        }
    }
}

/// Kinds of resources a strategy can grant access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    /// Namespaces.
    Namespaces,
    /// Services.
    Services,
    /// Configuration groups.
    ConfigGroups,
    /// Router rules.
    RouteRules,
    /// Rate-limit rules.
    RateLimitRules,
    /// Circuit-breaker rules.
    CircuitBreakerRules,
    /// Fault-detection rules.
    FaultDetectRules,
    /// Lane rules.
    LaneRules,
    /// Users.
    Users,
    /// User groups.
    UserGroups,
    /// Roles.
    Roles,
    /// Authorization policies.
    PolicyRules,
}

/// Effect of a matching strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyAction {
    /// Grant access.
    #[default]
    Allow,
    /// Refuse access.
    Deny,
}

/// Role of a user account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UserRoleType {
    /// Platform administrator.
    Admin,
    /// Main account owning sub-accounts.
    Owner,
    /// Sub-account.
    #[default]
    Sub,
}

/// A user account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID.
    pub id: String,
    /// Login name, unique per owner.
    pub name: String,
    /// ID of the owning main account; empty for owners and admins.
    pub owner: String,
    /// Account origin.
    pub source: String,
    /// Account role.
    pub user_type: UserRoleType,
    /// Access token.
    pub token: String,
    /// Whether the token may be used.
    pub token_enable: bool,
    /// Free-form comment.
    pub comment: String,
    /// Contact phone.
    pub mobile: String,
    /// Contact email.
    pub email: String,
    /// `false` marks a deleted user.
    pub valid: bool,
    /// Creation time.
    pub create_time: DateTime<Utc>,
    /// Last modification time.
    pub modify_time: DateTime<Utc>,
}

impl_cache_entity!(User);

/// A user group and its members.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserGroup {
    /// Unique group ID.
    pub id: String,
    /// Group name.
    pub name: String,
    /// ID of the owning main account.
    pub owner: String,
    /// Access token.
    pub token: String,
    /// Whether the token may be used.
    pub token_enable: bool,
    /// Free-form comment.
    pub comment: String,
    /// IDs of member users.
    pub user_ids: HashSet<String>,
    /// `false` marks a deleted group.
    pub valid: bool,
    /// Creation time.
    pub create_time: DateTime<Utc>,
    /// Last modification time.
    pub modify_time: DateTime<Utc>,
}

impl_cache_entity!(UserGroup);

/// An RBAC role bound to a set of principals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Role {
    /// Unique role ID.
    pub id: String,
    /// Role name.
    pub name: String,
    /// ID of the owning main account.
    pub owner: String,
    /// Whether the role was created by the system.
    pub default_role: bool,
    /// Free-form comment.
    pub comment: String,
    /// Role metadata.
    pub metadata: HashMap<String, String>,
    /// Users and groups holding the role.
    pub principals: Vec<Principal>,
    /// `false` marks a deleted role.
    pub valid: bool,
    /// Creation time.
    pub create_time: DateTime<Utc>,
    /// Last modification time.
    pub modify_time: DateTime<Utc>,
}

impl_cache_entity!(Role);

/// A resource named by ID in a strategy. `*` names every resource of the type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyResource {
    /// Resource kind.
    pub res_type: ResourceType,
    /// Resource ID or `*`.
    pub res_id: String,
}

impl StrategyResource {
    /// Create a resource reference.
    pub fn new(res_type: ResourceType, res_id: impl Into<String>) -> Self {
        Self {
            res_type,
            res_id: res_id.into(),
        }
    }
}

/// A resource selected by metadata label instead of by ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceLabel {
    /// Resource kind.
    pub res_type: ResourceType,
    /// Metadata key.
    pub key: String,
    /// Metadata value.
    pub value: String,
}

/// An authorization strategy (policy).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyDetail {
    /// Unique strategy ID.
    pub id: String,
    /// Strategy name.
    pub name: String,
    /// Effect of the strategy.
    pub action: PolicyAction,
    /// Free-form comment.
    pub comment: String,
    /// Users and groups the strategy applies to.
    pub principals: Vec<Principal>,
    /// Whether this is the default strategy of a principal.
    pub default: bool,
    /// ID of the owning main account.
    pub owner: String,
    /// Resources named by ID.
    pub resources: Vec<StrategyResource>,
    /// Resources selected by label.
    pub resource_labels: Vec<ResourceLabel>,
    /// API methods the strategy covers; empty covers all.
    pub callee_methods: Vec<String>,
    /// Store assigned revision.
    pub revision: String,
    /// `false` marks a deleted strategy.
    pub valid: bool,
    /// Creation time.
    pub create_time: DateTime<Utc>,
    /// Last modification time.
    pub modify_time: DateTime<Utc>,
}

impl_cache_entity!(StrategyDetail, revision);

/// A concrete resource whose access is being checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    /// Resource kind.
    pub res_type: ResourceType,
    /// Resource ID.
    pub id: String,
    /// Resource metadata, matched against strategy labels.
    pub metadata: HashMap<String, String>,
}

impl ResourceEntry {
    /// A resource without metadata.
    pub fn new(res_type: ResourceType, id: impl Into<String>) -> Self {
        Self {
            res_type,
            id: id.into(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
