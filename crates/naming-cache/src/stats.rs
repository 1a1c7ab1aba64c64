//! Cache update statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for the update path of one cache.
///
/// All counters are atomic and can be safely accessed from multiple threads.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of pulls executed against the store.
    updates_run: AtomicU64,
    /// Number of update calls that joined an in-flight pull.
    updates_coalesced: AtomicU64,
    /// Number of records applied to indices.
    records_applied: AtomicU64,
    /// Number of pulls that returned an error.
    update_failures: AtomicU64,
    /// Number of executor panics recovered.
    panics_recovered: AtomicU64,
    /// Number of records skipped because they could not be decoded.
    records_skipped: AtomicU64,
}

impl CacheStats {
    /// Create new cache statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pull executed against the store.
    #[inline]
    pub fn record_update(&self, records: u64) {
        self.updates_run.fetch_add(1, Ordering::Relaxed);
        self.records_applied.fetch_add(records, Ordering::Relaxed);
    }

    /// Record an update call that joined an in-flight pull.
    #[inline]
    pub fn record_coalesced(&self) {
        self.updates_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed pull.
    #[inline]
    pub fn record_failure(&self) {
        self.update_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a recovered executor panic.
    #[inline]
    pub fn record_panic(&self) {
        self.panics_recovered.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a skipped record.
    #[inline]
    pub fn record_skipped(&self) {
        self.records_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total pulls executed.
    #[inline]
    pub fn updates_run(&self) -> u64 {
        self.updates_run.load(Ordering::Relaxed)
    }

    /// Get total coalesced update calls.
    #[inline]
    pub fn updates_coalesced(&self) -> u64 {
        self.updates_coalesced.load(Ordering::Relaxed)
    }

    /// Get total records applied.
    #[inline]
    pub fn records_applied(&self) -> u64 {
        self.records_applied.load(Ordering::Relaxed)
    }

    /// Get total failed pulls.
    #[inline]
    pub fn update_failures(&self) -> u64 {
        self.update_failures.load(Ordering::Relaxed)
    }

    /// Get total recovered panics.
    #[inline]
    pub fn panics_recovered(&self) -> u64 {
        self.panics_recovered.load(Ordering::Relaxed)
    }

    /// Get total skipped records.
    #[inline]
    pub fn records_skipped(&self) -> u64 {
        self.records_skipped.load(Ordering::Relaxed)
    }

    /// Fraction of update calls served by joining an in-flight pull.
    pub fn coalesce_rate(&self) -> f64 {
        let joined = self.updates_coalesced() as f64;
        let total = joined + self.updates_run() as f64;
        if total == 0.0 {
            0.0
        } else {
            joined / total
        }
    }

    /// Reset all statistics.
    pub fn reset(&self) {
        self.updates_run.store(0, Ordering::Relaxed);
        self.updates_coalesced.store(0, Ordering::Relaxed);
        self.records_applied.store(0, Ordering::Relaxed);
        self.update_failures.store(0, Ordering::Relaxed);
        self.panics_recovered.store(0, Ordering::Relaxed);
        self.records_skipped.store(0, Ordering::Relaxed);
    }
}
