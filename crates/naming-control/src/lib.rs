//! # naming-control
//!
//! In-memory caching layer of a service-discovery and governance control
//! plane.
//!
//! The caches mirror a persistent store incrementally: every update pulls
//! only the records modified since the last successful pull, applies them
//! to purpose-built indices, and leaves reads lock-light and allocation
//! free where possible. It covers:
//!
//! - Services, instances and their aggregated counts
//! - Routing, circuit-breaker, fault-detection, lane and rate-limit rules
//! - Service contracts and the legacy L5 tables
//! - Users, groups, roles and authorization strategies
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use naming_control::prelude::*;
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let registry = Arc::new(CacheRegistry::builder().store(store).build()?);
//! registry.initialize()?;
//! registry.update_all().await?;
//!
//! let services = registry.services().expect("service cache enabled");
//! let orders = services.get_service_by_name("default", "orders");
//!
//! // Keep the caches fresh in the background
//! let handle = registry.spawn_update_loop();
//! ```
//!
//! ## Architecture
//!
//! This library is organized into several crates:
//!
//! - `naming-core` - Data model, errors, revisions and the store interface
//! - `naming-cache` - Update core, resource caches and the registry
//!
//! This crate (`naming-control`) re-exports all public APIs for convenience.
//!
//! ## Design Principles
//!
//! 1. **No panics in library code** - All errors are returned as `Result`,
//!    and a panic while applying a pull is contained and reported
//! 2. **No locks held across await points** - Uses DashMap and careful design
//! 3. **Explicit wiring** - Caches reach each other through narrow accessor
//!    traits bound once by the registry
//! 4. **Observable** - Built-in metrics and tracing support

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

// Re-export all sub-crates
pub use naming_cache as cache;
pub use naming_core as core;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use naming_control::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use naming_core::{
        CacheEntity, CacheError, CacheResult, MatchLevel, MemoryStore, ServiceKey, Store,
    };

    // Cache types
    pub use naming_cache::{
        CacheConfig, CacheIndex, CacheRegistry, CacheRegistryBuilder, CacheStats, ResourceCache,
        RuleSet, StrategyQuery, UpdateSummary,
    };
}

/// Version information for this crate.
pub mod version {
    /// Crate version.
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    /// Minimum supported Rust version.
    pub const MSRV: &str = "1.75";

    /// Get version info as a string.
    pub fn version_string() -> String {
        format!("naming-control {} (MSRV {})", VERSION, MSRV)
    }
}
