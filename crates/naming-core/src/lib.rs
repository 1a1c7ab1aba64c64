//! # naming-core
//!
//! Core types, traits and error handling for the naming control-plane cache.
//!
//! This crate provides the foundational types used by the caches:
//!
//! - [`CacheError`] - Error type shared by the store and every cache
//! - [`ServiceKey`] - `(namespace, name)` identity with wildcard tiers
//! - [`CacheEntity`] - Contract of every record mirrored by a cache
//! - [`revision`] - Order-independent SHA-1 fingerprints
//! - [`Store`] - Incremental read interface of the persistent store
//! - [`MemoryStore`] - In-memory store for tests, benchmarks and demos
//!
//! ## Example
//!
//! ```rust
//! use naming_core::revision::composite_revision;
//! use naming_core::{MatchLevel, ServiceKey};
//!
//! let key = ServiceKey::new("default", "*");
//! assert_eq!(key.match_level(), MatchLevel::Namespace);
//!
//! let a = composite_revision(&["r1", "r2"]);
//! let b = composite_revision(&["r2", "r1"]);
//! assert_eq!(a, b);
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod error;
mod key;
pub mod memory;
pub mod model;
pub mod revision;
mod store;

pub use entity::{max_modify_time, CacheEntity};
pub use error::CacheError;
pub use key::{is_wildcard, MatchLevel, ServiceKey, WILDCARD};
pub use memory::MemoryStore;
pub use store::Store;

/// Result type alias using [`CacheError`].
pub type Result<T> = std::result::Result<T, CacheError>;

/// Alias for [`Result`], for call sites that import several result types.
pub type CacheResult<T> = Result<T>;
