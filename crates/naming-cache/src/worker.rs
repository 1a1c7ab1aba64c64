//! Background pool that recomputes service revisions.
//!
//! Instance changes are reported as `(service_id, valid)` notifications on a
//! bounded queue. A fixed set of tokio tasks drains the queue: a valid
//! notification recomputes the service's revision from its current state, an
//! invalid one drops the cached revision. Recomputation is a pure function of
//! current state, so duplicated or reordered notifications are harmless, and
//! a notification for a service that is not cached yet is dropped.
//!
//! Producers wait when the queue is full. The pool stops when the shutdown
//! signal fires.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use naming_core::{CacheError, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Computes the current revision of a service, or `None` if it is unknown.
pub type RevisionFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct RevisionTask {
    service_id: String,
    valid: bool,
}

type SharedReceiver = Arc<AsyncMutex<mpsc::Receiver<RevisionTask>>>;

/// The revision worker pool of the service cache.
pub struct RevisionWorker {
    workers: usize,
    delay: Duration,
    tx: mpsc::Sender<RevisionTask>,
    rx: Mutex<Option<mpsc::Receiver<RevisionTask>>>,
    revisions: Arc<DashMap<String, String>>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RevisionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionWorker")
            .field("workers", &self.workers)
            .field("revisions", &self.revisions.len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl RevisionWorker {
    /// Create a stopped pool of `workers` tasks over a queue of
    /// `queue_size` notifications.
    pub fn new(workers: usize, queue_size: usize, delay: Duration) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            workers: workers.max(1),
            delay,
            tx,
            rx: Mutex::new(Some(rx)),
            revisions: Arc::new(DashMap::new()),
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker tasks on the current tokio runtime.
    ///
    /// Starting twice is a no-op.
    pub fn start(&self, compute: RevisionFn) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            CacheError::Configuration("revision workers need a tokio runtime".to_string())
        })?;
        let Some(rx) = self.rx.lock().take() else {
            return Ok(());
        };
        let rx: SharedReceiver = Arc::new(AsyncMutex::new(rx));

        let mut handles = self.handles.lock();
        for worker in 0..self.workers {
            handles.push(runtime.spawn(run_worker(
                worker,
                Arc::clone(&rx),
                Arc::clone(&compute),
                Arc::clone(&self.revisions),
                self.shutdown.subscribe(),
                self.delay,
            )));
        }
        info!(workers = self.workers, "revision workers started");
        Ok(())
    }

    /// Whether the workers have been started and not stopped.
    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty() && !*self.shutdown.borrow()
    }

    /// Queue a notification, waiting while the queue is full.
    pub async fn notify(&self, service_id: &str, valid: bool) -> Result<()> {
        let task = RevisionTask {
            service_id: service_id.to_string(),
            valid,
        };
        self.tx.send(task).await.map_err(|_| CacheError::Closed {
            component: "revision worker".to_string(),
        })
    }

    /// Cached revision of `service_id`.
    pub fn get(&self, service_id: &str) -> Option<String> {
        self.revisions.get(service_id).map(|r| r.value().clone())
    }

    /// Number of notifications waiting in the queue.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Drop every cached revision.
    pub fn clear(&self) {
        self.revisions.clear();
    }

    /// Signal the workers to stop after their current computation.
    pub fn stop(&self) {
        if !self.shutdown.send_replace(true) {
            debug!("revision workers stopping");
        }
        self.handles.lock().clear();
    }
}

impl Drop for RevisionWorker {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn run_worker(
    worker: usize,
    rx: SharedReceiver,
    compute: RevisionFn,
    revisions: Arc<DashMap<String, String>>,
    mut shutdown: watch::Receiver<bool>,
    delay: Duration,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let task = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                task = rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            }
        };

        if task.valid {
            match compute(&task.service_id) {
                Some(revision) => {
                    trace!(worker, service_id = %task.service_id, %revision, "service revision updated");
                    revisions.insert(task.service_id, revision);
                }
                None => trace!(worker, service_id = %task.service_id, "service not cached, revision dropped"),
            }
        } else {
            revisions.remove(&task.service_id);
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    trace!(worker, "revision worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn wait_for(worker: &RevisionWorker, id: &str, expected: Option<&str>) {
        for _ in 0..200 {
            if worker.get(id).as_deref() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("revision of {id} never became {expected:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn valid_notification_computes_revision() {
        let worker = RevisionWorker::new(4, 16, Duration::ZERO);
        worker
            .start(Arc::new(|id: &str| Some(format!("rev-of-{id}"))))
            .unwrap();

        worker.notify("svc-1", true).await.unwrap();
        wait_for(&worker, "svc-1", Some("rev-of-svc-1")).await;

        worker.notify("svc-1", false).await.unwrap();
        wait_for(&worker, "svc-1", None).await;
        worker.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_service_is_dropped() {
        let worker = RevisionWorker::new(2, 16, Duration::ZERO);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        worker
            .start(Arc::new(move |_: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }))
            .unwrap();

        worker.notify("ghost", true).await.unwrap();
        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(worker.get("ghost").is_none());
    }

    #[tokio::test]
    async fn full_queue_blocks_producer() {
        let worker = RevisionWorker::new(1, 1, Duration::ZERO);
        worker.notify("a", true).await.unwrap();
        assert_eq!(worker.pending(), 1);

        let blocked = tokio::time::timeout(Duration::from_millis(50), worker.notify("b", true)).await;
        assert!(blocked.is_err(), "send on a full queue must wait");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stopped_pool_rejects_notifications() {
        let worker = RevisionWorker::new(2, 4, Duration::ZERO);
        worker.start(Arc::new(|_: &str| None)).unwrap();
        worker.stop();
        assert!(!worker.is_running());

        let mut closed = false;
        for _ in 0..200 {
            if worker.notify("svc", true).await.is_err() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(closed);
    }

    #[test]
    fn start_without_runtime_fails() {
        let worker = RevisionWorker::new(1, 1, Duration::ZERO);
        let err = worker.start(Arc::new(|_: &str| None)).unwrap_err();
        assert!(matches!(err, CacheError::Configuration(_)));
    }
}
