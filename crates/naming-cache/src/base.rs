//! Incremental-update bookkeeping shared by every resource cache.
//!
//! [`UpdateCore`] owns the fetch cursor of one cache: the store clock read
//! before the last successful pull, and a per-label high-watermark of the
//! modify times seen so far. It also coalesces concurrent `update` calls
//! into one pull, contains panics raised while applying a pull, and
//! throttles metric reports.
//!
//! ## Cursor policy
//!
//! The pre-pull store clock becomes the new fetch cursor once the executor
//! returns successfully. A failed executor leaves the cursor untouched
//! unless [`CacheConfig::advance_cursor_on_error`] is set; a panicking
//! executor never advances it. The cursor is read back with
//! [`CacheConfig::time_skew`] subtracted so that clock drift between the
//! cache host and the store cannot hide a write.

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use futures::FutureExt;
use naming_core::{CacheError, Result, Store};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::CacheConfig;
use crate::flight::SingleFlight;
use crate::metrics::CacheMetrics;
use crate::stats::CacheStats;

/// What a pull executor reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullOutcome {
    /// Highest modify time seen per label in this pull.
    pub last_mtimes: HashMap<&'static str, DateTime<Utc>>,
    /// Number of records pulled.
    pub total: usize,
}

impl PullOutcome {
    /// An outcome for a single-label cache.
    pub fn single(label: &'static str, last_mtime: Option<DateTime<Utc>>, total: usize) -> Self {
        let mut outcome = Self {
            total,
            ..Default::default()
        };
        outcome.observe(label, last_mtime);
        outcome
    }

    /// Fold a label's high-watermark into the outcome.
    pub fn observe(&mut self, label: &'static str, mtime: Option<DateTime<Utc>>) {
        if let Some(mtime) = mtime {
            let entry = self.last_mtimes.entry(label).or_insert(mtime);
            if mtime > *entry {
                *entry = mtime;
            }
        }
    }
}

/// Summary of a completed update, shared by every coalesced caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Number of records pulled.
    pub total: usize,
    /// Wall time spent in the executor.
    pub cost: Duration,
}

/// Result of an update together with how it was obtained.
#[derive(Debug, Clone)]
pub struct UpdateResult {
    /// Outcome of the pull.
    pub result: Result<UpdateSummary>,
    /// `true` if this caller joined a pull started by another caller, and
    /// may therefore have observed a slightly older state of the store.
    pub joined: bool,
}

/// Cursor, dedup and panic containment for one cache.
pub struct UpdateCore {
    name: &'static str,
    store: Arc<dyn Store>,
    config: Arc<CacheConfig>,
    last_fetch_time: AtomicI64,
    last_mtimes: RwLock<HashMap<String, DateTime<Utc>>>,
    first_update: AtomicBool,
    last_check_all: Mutex<Option<Instant>>,
    flight: SingleFlight<&'static str, Result<UpdateSummary>>,
    stats: CacheStats,
    metrics: CacheMetrics,
}

impl std::fmt::Debug for UpdateCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateCore")
            .field("name", &self.name)
            .field("last_fetch_time", &self.last_fetch_time.load(Ordering::Acquire))
            .field("first_update", &self.is_first_update())
            .finish_non_exhaustive()
    }
}

impl UpdateCore {
    /// Create the bookkeeping for the cache called `name`.
    pub fn new(name: &'static str, store: Arc<dyn Store>, config: Arc<CacheConfig>) -> Self {
        Self {
            name,
            metrics: CacheMetrics::new(name, config.report_interval),
            store,
            config,
            last_fetch_time: AtomicI64::new(0),
            last_mtimes: RwLock::new(HashMap::new()),
            first_update: AtomicBool::new(true),
            last_check_all: Mutex::new(None),
            flight: SingleFlight::new(),
            stats: CacheStats::new(),
        }
    }

    /// Name of the cache.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The store this cache pulls from.
    #[inline]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Shared configuration.
    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Update statistics.
    #[inline]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Whether no pull has succeeded since creation or the last clear.
    pub fn is_first_update(&self) -> bool {
        self.first_update.load(Ordering::Acquire)
    }

    /// Lower bound for the next pull: the fetch cursor minus the time skew,
    /// never before the unix epoch.
    pub fn last_fetch_time(&self) -> DateTime<Utc> {
        let skew = i64::try_from(self.config.time_skew.as_secs()).unwrap_or(i64::MAX);
        let secs = self.origin_last_fetch_time().saturating_sub(skew).max(0);
        unix_seconds(secs)
    }

    /// The raw fetch cursor, in unix seconds.
    pub fn origin_last_fetch_time(&self) -> i64 {
        self.last_fetch_time.load(Ordering::Acquire)
    }

    /// Highest modify time seen for `label`, or the unix epoch.
    pub fn last_mtime(&self, label: &str) -> DateTime<Utc> {
        self.last_mtimes
            .read()
            .get(label)
            .copied()
            .unwrap_or_else(|| unix_seconds(0))
    }

    /// Forget the high-watermark of `label`.
    pub fn reset_last_mtime(&self, label: &str) {
        self.last_mtimes.write().remove(label);
    }

    /// Rewind the fetch cursor so the next pull re-reads everything.
    pub fn reset_last_fetch_time(&self) {
        self.last_fetch_time.store(0, Ordering::Release);
    }

    /// Reset the whole cursor, as if the cache had just been created.
    pub fn clear(&self) {
        self.reset_last_fetch_time();
        self.last_mtimes.write().clear();
        self.first_update.store(true, Ordering::Release);
    }

    /// Whether a count reconciliation is due, and if so mark it as done.
    pub fn should_check_all(&self) -> bool {
        let mut last = self.last_check_all.lock();
        match *last {
            Some(at) if at.elapsed() < self.config.check_all_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    /// Compare the cached entity count with the store's count, and force a
    /// full resync on mismatch. Returns `true` when a resync was forced.
    pub fn reconcile(&self, cached: usize, stored: usize) -> bool {
        if cached == stored {
            return false;
        }
        warn!(
            cache = self.name,
            cached,
            stored,
            "cached count differs from store, forcing full resync"
        );
        self.reset_last_fetch_time();
        self.last_mtimes.write().clear();
        true
    }

    /// Run `executor` at most once concurrently for this cache.
    ///
    /// Concurrent callers share the result of the pull already in flight.
    pub async fn update<F, Fut>(&self, executor: F) -> UpdateResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PullOutcome>>,
    {
        let flight = self
            .flight
            .work(self.name, || self.do_cache_update(executor))
            .await;
        if flight.joined {
            self.stats.record_coalesced();
        }
        UpdateResult {
            result: flight.value,
            joined: flight.joined,
        }
    }

    /// Like [`update`](Self::update), but a caller that joined a pull
    /// already in flight issues one more pull of its own, so the result
    /// reflects the store as of this call.
    pub async fn update_fresh<F, Fut>(&self, executor: F) -> Result<UpdateSummary>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<PullOutcome>>,
    {
        let first = self.update(&executor).await;
        if !first.joined {
            return first.result;
        }
        debug!(cache = self.name, "joined an in-flight pull, pulling again");
        self.update(&executor).await.result
    }

    async fn do_cache_update<F, Fut>(&self, executor: F) -> Result<UpdateSummary>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PullOutcome>>,
    {
        if self.is_first_update() {
            info!(cache = self.name, "begin first load");
        }

        let store_now = match self.store.get_unix_second().await {
            Ok(now) => now,
            Err(err) => {
                warn!(cache = self.name, error = %err, "cannot read store clock, keeping cursor");
                self.origin_last_fetch_time()
            }
        };

        let start = Instant::now();
        let outcome = AssertUnwindSafe(executor()).catch_unwind().await;
        let cost = start.elapsed();

        match outcome {
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    cache = self.name,
                    panic = %message,
                    backtrace = %Backtrace::force_capture(),
                    "cache update panicked, cursor not advanced"
                );
                self.stats.record_panic();
                self.metrics.record_failure();
                Err(CacheError::UpdatePanicked {
                    cache: self.name.to_string(),
                    message,
                })
            }
            Ok(Err(err)) => {
                warn!(cache = self.name, error = %err, "cache update failed");
                if self.config.advance_cursor_on_error {
                    self.last_fetch_time.store(store_now, Ordering::Release);
                }
                self.stats.record_failure();
                self.metrics.record_failure();
                Err(err)
            }
            Ok(Ok(outcome)) => {
                self.last_fetch_time.store(store_now, Ordering::Release);
                {
                    let mut mtimes = self.last_mtimes.write();
                    for (label, mtime) in &outcome.last_mtimes {
                        let entry = mtimes.entry((*label).to_string()).or_insert(*mtime);
                        if *mtime > *entry {
                            *entry = *mtime;
                        }
                    }
                }
                if self.first_update.swap(false, Ordering::AcqRel) {
                    info!(cache = self.name, total = outcome.total, ?cost, "first load done");
                } else if outcome.total > 0 {
                    debug!(cache = self.name, total = outcome.total, ?cost, "cache updated");
                }
                self.stats.record_update(outcome.total as u64);
                self.metrics.record_update(cost, outcome.total);
                Ok(UpdateSummary {
                    total: outcome.total,
                    cost,
                })
            }
        }
    }
}

fn unix_seconds(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
