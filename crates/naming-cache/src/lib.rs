//! # naming-cache
//!
//! Incremental in-memory caches for a service-naming control plane.
//!
//! Every cache mirrors one family of store tables and is refreshed by
//! pulling only the records modified since its last successful pull:
//!
//! - [`UpdateCore`] - Fetch cursor, call coalescing, panic containment
//! - [`RuleContainer`] - Exact / namespace / global rule tiers with backfill
//! - [`RevisionWorker`] - Bounded pool recomputing service revisions
//! - [`ServiceCache`], [`InstanceCache`] - Naming data and aggregated counts
//! - [`RoutingConfigCache`], [`CircuitBreakerCache`], [`FaultDetectCache`],
//!   [`LaneCache`], [`RateLimitCache`] - Governance rules
//! - [`UserCache`], [`RoleCache`], [`StrategyCache`] - Authorization
//! - [`CacheRegistry`] - Builds, wires and drives every cache
//!
//! ## Key Design Decisions
//!
//! - Caches are built without cross references and wired in a second pass
//!   through narrow accessor traits
//! - No lock or `DashMap` reference is held across an `.await`
//! - Concurrent `update` calls on one cache share a single store round trip
//! - A failed or panicking pull never advances the fetch cursor
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use naming_cache::CacheRegistry;
//! use naming_core::{MemoryStore, ServiceKey};
//!
//! let registry = Arc::new(
//!     CacheRegistry::builder()
//!         .store(Arc::new(MemoryStore::new()))
//!         .build()?,
//! );
//! registry.initialize()?;
//! registry.update_all().await?;
//!
//! let rules = registry
//!     .circuit_breakers()
//!     .map(|c| c.get_circuit_breaker_rules(&ServiceKey::new("default", "orders")));
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
mod base;
mod circuitbreaker;
mod config;
mod container;
mod contract;
mod faultdetect;
mod flight;
mod instance;
mod l5;
mod lane;
mod link;
mod metrics;
mod ratelimit;
mod registry;
mod routing;
mod service;
mod stats;
mod worker;

pub use auth::{
    PrincipalResourceContainer, RoleCache, RoleFilter, StrategyCache, StrategyPredicate,
    StrategyQuery, UserCache,
};
pub use base::{PullOutcome, UpdateCore, UpdateResult, UpdateSummary};
pub use circuitbreaker::CircuitBreakerCache;
pub use config::CacheConfig;
pub use container::{RuleContainer, RuleSet};
pub use contract::ServiceContractCache;
pub use faultdetect::FaultDetectCache;
pub use flight::{Flight, SingleFlight};
pub use instance::InstanceCache;
pub use l5::L5Cache;
pub use lane::LaneCache;
pub use link::{InstanceAccessor, Link, RevisionNotifier, ServiceAccessor, UserAccessor};
pub use self::metrics::CacheMetrics;
pub use ratelimit::RateLimitCache;
pub use registry::{CacheIndex, CacheRegistry, CacheRegistryBuilder, ResourceCache};
pub use routing::{RouterRuleFilter, RoutingConfigCache};
pub use service::{ServiceCache, ServiceFilter};
pub use stats::CacheStats;
pub use worker::{RevisionFn, RevisionWorker};
