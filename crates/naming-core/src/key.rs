//! Service identity keys.
//!
//! This module provides [`ServiceKey`], the `(namespace, name)` pair used to
//! join instances, rules and service records, and [`MatchLevel`], the
//! wildcard tier a key belongs to.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The wildcard token accepted in either half of a [`ServiceKey`].
pub const WILDCARD: &str = "*";

/// Identity of a service: namespace plus name.
///
/// Either field may be the wildcard token `*`. A key with a concrete
/// namespace and a wildcard name addresses every service in the namespace;
/// a key with both fields wildcarded addresses every service.
///
/// # Example
///
/// ```rust
/// use naming_core::{MatchLevel, ServiceKey};
///
/// let exact = ServiceKey::new("default", "orders");
/// let ns = ServiceKey::new("default", "*");
/// let all = ServiceKey::wildcard();
///
/// assert_eq!(exact.match_level(), MatchLevel::Exact);
/// assert_eq!(ns.match_level(), MatchLevel::Namespace);
/// assert_eq!(all.match_level(), MatchLevel::Global);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    /// Namespace of the service.
    pub namespace: String,
    /// Name of the service.
    pub name: String,
}

/// Granularity at which a rule addresses its target service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MatchLevel {
    /// Concrete namespace and name.
    Exact,
    /// Concrete namespace, wildcard name.
    Namespace,
    /// Wildcard namespace (the name is ignored).
    Global,
}

impl ServiceKey {
    /// Create a key from a namespace and a name.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The key addressing every service in every namespace.
    #[must_use]
    pub fn wildcard() -> Self {
        Self::new(WILDCARD, WILDCARD)
    }

    /// Classify the key into its wildcard tier.
    ///
    /// An empty namespace is treated like the wildcard, so rules saved
    /// without a namespace apply globally.
    #[must_use]
    pub fn match_level(&self) -> MatchLevel {
        if is_wildcard(&self.namespace) {
            MatchLevel::Global
        } else if is_wildcard(&self.name) {
            MatchLevel::Namespace
        } else {
            MatchLevel::Exact
        }
    }

    /// Whether neither half is a wildcard.
    #[must_use]
    pub fn is_exact(&self) -> bool {
        self.match_level() == MatchLevel::Exact
    }

    /// Whether both halves are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.namespace.is_empty() && self.name.is_empty()
    }
}

/// Whether a single key component matches everything.
#[must_use]
pub fn is_wildcard(value: &str) -> bool {
    value.is_empty() || value == WILDCARD
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
