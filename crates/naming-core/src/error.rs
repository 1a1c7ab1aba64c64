//! Error types for cache operations.
//!
//! This module provides [`CacheError`], the single error type shared by the
//! store collaborator and every resource cache.

/// Error type for cache synchronization and lookups.
///
/// Lookup misses are not errors in this layer: accessors return `None` or
/// an empty collection instead. `CacheError` covers the failure modes of
/// pulling from the store and applying what was pulled.
///
/// The type is `Clone` because one coalesced pull hands the same result to
/// every caller that joined it.
///
/// # Example
///
/// ```rust
/// use naming_core::CacheError;
///
/// fn decode(id: &str, payload: &str) -> Result<(), CacheError> {
///     if payload.is_empty() {
///         return Err(CacheError::InvalidRecord {
///             resource: "router_rule".to_string(),
///             id: id.to_string(),
///             reason: "empty payload".to_string(),
///         });
///     }
///     Ok(())
/// }
///
/// assert!(decode("rule-1", "").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The persistent store failed to answer a query.
    #[error("store error during {operation}: {message}")]
    Store {
        /// The store operation that failed.
        operation: String,
        /// Error message reported by the store.
        message: String,
    },

    /// A record could not be decoded and was skipped.
    #[error("invalid {resource} record {id}: {reason}")]
    InvalidRecord {
        /// Resource kind of the record.
        resource: String,
        /// ID of the record.
        id: String,
        /// Reason the record was rejected.
        reason: String,
    },

    /// The pull executor panicked; the cursor was not advanced.
    #[error("update of cache {cache} panicked: {message}")]
    UpdatePanicked {
        /// Name of the cache whose executor panicked.
        cache: String,
        /// Panic payload rendered as text.
        message: String,
    },

    /// A cross-cache accessor was used before the registry wired it.
    #[error("cache {cache} is not initialized: missing {dependency}")]
    NotInitialized {
        /// The cache that was used.
        cache: String,
        /// The missing dependency.
        dependency: String,
    },

    /// The revision pipeline or registry has been closed.
    #[error("{component} is closed")]
    Closed {
        /// The closed component.
        component: String,
    },

    /// The update leader was dropped before publishing a result.
    #[error("in-flight update of cache {cache} was abandoned")]
    Abandoned {
        /// Name of the cache.
        cache: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    /// Create a store error for the given operation.
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an invalid record error.
    pub fn invalid_record(
        resource: impl Into<String>,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidRecord {
            resource: resource.into(),
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-initialized error.
    pub fn not_initialized(cache: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::NotInitialized {
            cache: cache.into(),
            dependency: dependency.into(),
        }
    }

    /// Whether this error came from the store collaborator.
    #[must_use]
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store { .. })
    }
}
