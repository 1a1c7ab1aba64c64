//! Metrics emitted by the caches.
//!
//! Cache updates report their cost and record count, throttled per cache to
//! the configured report interval. The service cache additionally publishes
//! per-namespace service and instance totals.

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use naming_core::model::NamespaceServiceCount;
use parking_lot::Mutex;

/// Throttled metric reporter for one cache.
#[derive(Debug)]
pub struct CacheMetrics {
    cache: &'static str,
    interval: Duration,
    last_report: Mutex<Option<Instant>>,
}

impl CacheMetrics {
    /// Create a reporter for `cache`, reporting at most once per `interval`.
    pub fn new(cache: &'static str, interval: Duration) -> Self {
        Self {
            cache,
            interval,
            last_report: Mutex::new(None),
        }
    }

    /// Record the outcome of one update run.
    ///
    /// Returns `true` when the report was emitted, `false` when it was
    /// throttled.
    pub fn record_update(&self, cost: Duration, records: usize) -> bool {
        counter!("naming_cache_update_records_total", "cache" => self.cache).increment(records as u64);

        {
            let mut last = self.last_report.lock();
            match *last {
                Some(at) if at.elapsed() < self.interval => return false,
                _ => *last = Some(Instant::now()),
            }
        }

        histogram!("naming_cache_update_cost_ms", "cache" => self.cache).record(cost.as_secs_f64() * 1000.0);
        gauge!("naming_cache_update_last_records", "cache" => self.cache).set(records as f64);
        true
    }

    /// Record a failed update run.
    pub fn record_failure(&self) {
        counter!("naming_cache_update_failures_total", "cache" => self.cache).increment(1);
    }
}

/// Publish the service and instance totals of one namespace.
pub fn report_namespace_counts(namespace: &str, counts: &NamespaceServiceCount) {
    let ns = namespace.to_string();
    gauge!("naming_namespace_services", "namespace" => ns.clone()).set(counts.service_count as f64);
    gauge!("naming_namespace_instances_total", "namespace" => ns.clone())
        .set(counts.instance_count.total as f64);
    gauge!("naming_namespace_instances_healthy", "namespace" => ns.clone())
        .set(counts.instance_count.healthy as f64);
    gauge!("naming_namespace_instances_isolated", "namespace" => ns).set(counts.instance_count.isolated as f64);
}
