//! Narrow interfaces through which caches reach each other.
//!
//! Caches are built with no cross references. During
//! [`CacheRegistry::initialize`](crate::CacheRegistry::initialize) each
//! cache resolves the accessors it needs and stores them in a [`Link`].
//! Links hold weak references, so the service and instance caches can point
//! at each other without keeping each other alive.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use naming_core::model::{InstanceCount, Service, UserGroup};
use naming_core::{CacheError, Result};
use parking_lot::RwLock;

/// Read access to cached services.
pub trait ServiceAccessor: Send + Sync {
    /// Look up a cached service by ID.
    fn get_service_by_id(&self, id: &str) -> Option<Arc<Service>>;
}

/// Sink for changes to a service's instance set.
#[async_trait]
pub trait RevisionNotifier: Send + Sync {
    /// Queue a revision recompute for `service_id`. `valid == false` drops
    /// the cached revision instead. Waits while the queue is full.
    async fn notify_service_revision(&self, service_id: &str, valid: bool) -> Result<()>;

    /// Recompute the service and instance totals of `namespaces`.
    fn recompute_namespace_counts(&self, namespaces: &HashSet<String>);
}

/// Read access to cached instances.
pub trait InstanceAccessor: Send + Sync {
    /// Revisions of every instance of `service_id`.
    fn instance_revisions(&self, service_id: &str) -> Vec<String>;

    /// Aggregated instance count of `service_id`.
    fn instance_count(&self, service_id: &str) -> Option<InstanceCount>;
}

/// Read access to cached users and groups.
pub trait UserAccessor: Send + Sync {
    /// Groups `user_id` belongs to.
    fn get_user_link_groups(&self, user_id: &str) -> Vec<Arc<UserGroup>>;
}

/// A late-bound, weak reference to another cache.
pub struct Link<T: ?Sized> {
    owner: &'static str,
    dependency: &'static str,
    target: RwLock<Option<Weak<T>>>,
}

impl<T: ?Sized> std::fmt::Debug for Link<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("owner", &self.owner)
            .field("dependency", &self.dependency)
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl<T: ?Sized> Link<T> {
    /// An unbound link from `owner` to `dependency`.
    pub fn new(owner: &'static str, dependency: &'static str) -> Self {
        Self {
            owner,
            dependency,
            target: RwLock::new(None),
        }
    }

    /// Bind the link.
    pub fn bind(&self, target: &Arc<T>) {
        *self.target.write() = Some(Arc::downgrade(target));
    }

    /// Whether the link has been bound.
    pub fn is_bound(&self) -> bool {
        self.target.read().is_some()
    }

    /// Resolve the link.
    ///
    /// Fails with [`CacheError::NotInitialized`] before `bind`, or once the
    /// target has been dropped.
    pub fn get(&self) -> Result<Arc<T>> {
        self.target
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| CacheError::not_initialized(self.owner, self.dependency))
    }
}
