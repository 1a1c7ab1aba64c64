//! The record contract shared by every cached resource.
//!
//! Every persisted record that flows through a cache implements
//! [`CacheEntity`]: it has a string key, a validity flag (false marks a
//! tombstone), a modify time that drives incremental pulls, and an opaque
//! revision assigned by the store.

use chrono::{DateTime, Utc};

/// A persisted record mirrored by a cache.
pub trait CacheEntity: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Unique key of the record.
    fn id(&self) -> &str;

    /// `false` marks a tombstone that must be removed from every index.
    fn is_valid(&self) -> bool;

    /// Last modification time, as recorded by the store.
    fn modify_time(&self) -> DateTime<Utc>;

    /// Set the modification time. Stores call this when they persist a write.
    fn set_modify_time(&mut self, mtime: DateTime<Utc>);

    /// Opaque revision assigned when the record was written.
    fn revision(&self) -> &str {
        ""
    }
}

/// Implement [`CacheEntity`] for a struct with `id`, `valid` and
/// `modify_time` fields, and optionally a `revision` field.
#[macro_export]
macro_rules! impl_cache_entity {
    ($ty:ty) => {
        impl $crate::CacheEntity for $ty {
            fn id(&self) -> &str {
                &self.id
            }

            fn is_valid(&self) -> bool {
                self.valid
            }

            fn modify_time(&self) -> ::chrono::DateTime<::chrono::Utc> {
                self.modify_time
            }

            fn set_modify_time(&mut self, mtime: ::chrono::DateTime<::chrono::Utc>) {
                self.modify_time = mtime;
            }
        }
    };
    ($ty:ty, revision) => {
        impl $crate::CacheEntity for $ty {
            fn id(&self) -> &str {
                &self.id
            }

            fn is_valid(&self) -> bool {
                self.valid
            }

            fn modify_time(&self) -> ::chrono::DateTime<::chrono::Utc> {
                self.modify_time
            }

            fn set_modify_time(&mut self, mtime: ::chrono::DateTime<::chrono::Utc>) {
                self.modify_time = mtime;
            }

            fn revision(&self) -> &str {
                &self.revision
            }
        }
    };
}

/// Highest modify time among `records`, if any.
///
/// Caches fold this into their per-label high-watermark after each pull.
pub fn max_modify_time<'a, T, I>(records: I) -> Option<DateTime<Utc>>
where
    T: CacheEntity,
    I: IntoIterator<Item = &'a T>,
{
    records.into_iter().map(CacheEntity::modify_time).max()
}
