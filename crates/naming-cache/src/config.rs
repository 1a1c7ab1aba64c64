//! Cache configuration.

use std::collections::HashSet;
use std::time::Duration;

use crate::registry::CacheIndex;

/// Configuration shared by every cache in a registry.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Interval between two update rounds of the update loop.
    pub update_interval: Duration,
    /// Minimum interval between two metric reports of one cache.
    pub report_interval: Duration,
    /// Minimum interval between two count reconciliations.
    pub check_all_interval: Duration,
    /// Subtracted from the fetch cursor when it is read back, to absorb
    /// clock drift between the cache host and the store.
    pub time_skew: Duration,
    /// Number of revision worker tasks.
    pub revision_workers: usize,
    /// Capacity of the revision notification queue.
    pub revision_queue_size: usize,
    /// Pause between two revision computations of one worker.
    pub revision_compute_delay: Duration,
    /// Advance the fetch cursor even when a pull fails.
    ///
    /// Off by default: a failed pull leaves the cursor where it was so the
    /// next run re-reads the same window.
    pub advance_cursor_on_error: bool,
    /// Caches the registry must not build.
    pub disabled_caches: HashSet<CacheIndex>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(1),
            report_interval: Duration::from_secs(60),
            check_all_interval: Duration::from_secs(60),
            time_skew: Duration::from_secs(5),
            revision_workers: 64,
            revision_queue_size: 102_400,
            revision_compute_delay: Duration::from_millis(2),
            advance_cursor_on_error: false,
            disabled_caches: HashSet::new(),
        }
    }
}

impl CacheConfig {
    /// Whether the cache at `index` is enabled.
    #[must_use]
    pub fn is_enabled(&self, index: CacheIndex) -> bool {
        !self.disabled_caches.contains(&index)
    }
}
