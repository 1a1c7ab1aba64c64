//! Coalesces concurrent identical work into a single execution.
//!
//! When several tasks ask for the same key at once, the first one (the
//! leader) runs the work while the others (followers) wait and receive a
//! clone of the leader's result. The entry is removed as soon as the leader
//! finishes, so the next call after completion starts fresh work.
//!
//! If the leader is dropped before publishing, its followers retry and one
//! of them becomes the new leader.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Result of [`SingleFlight::work`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flight<T> {
    /// The shared result.
    pub value: T,
    /// `true` if the caller joined work started by another caller.
    pub joined: bool,
}

/// A space in which units of work run with duplicate suppression.
#[derive(Debug)]
pub struct SingleFlight<K, T> {
    calls: Mutex<HashMap<K, watch::Receiver<Option<T>>>>,
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

/// Removes the leader's entry when the leader finishes or is dropped.
struct LeaderGuard<'a, K: Hash + Eq, T> {
    calls: &'a Mutex<HashMap<K, watch::Receiver<Option<T>>>>,
    key: Option<K>,
}

impl<K: Hash + Eq, T> Drop for LeaderGuard<'_, K, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.calls.lock().remove(&key);
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Hash + Eq + Clone,
    T: Clone,
{
    /// Create an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with work in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    /// Run `func` unless work for `key` is already in flight, in which case
    /// wait for that work and share its result.
    pub async fn work<F, Fut>(&self, key: K, func: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let sender = loop {
            let mut waiter = {
                let mut calls = self.calls.lock();
                if let Some(rx) = calls.get(&key) {
                    rx.clone()
                } else {
                    let (tx, rx) = watch::channel(None);
                    calls.insert(key.clone(), rx);
                    break tx;
                }
            };

            // An error means the leader was dropped without a result; its
            // entry is already gone, so retrying elects a new leader.
            if let Ok(value) = waiter.wait_for(Option::is_some).await {
                if let Some(value) = value.as_ref() {
                    return Flight {
                        value: value.clone(),
                        joined: true,
                    };
                }
            };
        };

        // Declared after `sender` so the entry is removed before the sender
        // is dropped.
        let guard = LeaderGuard {
            calls: &self.calls,
            key: Some(key),
        };

        let value = func().await;
        // Unregister before publishing: a caller arriving after this point
        // must start new work rather than read a finished result.
        drop(guard);
        sender.send_replace(Some(value.clone()));
        Flight { value, joined: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn single_caller_leads() {
        let group: SingleFlight<&str, u32> = SingleFlight::new();
        let flight = group.work("key", || async { 7 }).await;
        assert_eq!(flight.value, 7);
        assert!(!flight.joined);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_execution() {
        let group: Arc<SingleFlight<&'static str, usize>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let group = Arc::clone(&group);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                group
                    .work("key", || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        runs.fetch_add(1, Ordering::SeqCst) + 1
                    })
                    .await
            }));
        }

        let mut joined = 0;
        for handle in handles {
            let flight = handle.await.unwrap();
            assert_eq!(flight.value, 1);
            if flight.joined {
                joined += 1;
            }
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(joined, 15);
    }

    #[tokio::test]
    async fn sequential_calls_run_again() {
        let group: SingleFlight<&str, usize> = SingleFlight::new();
        let runs = AtomicUsize::new(0);

        for expected in 1..=3 {
            let flight = group
                .work("key", || async { runs.fetch_add(1, Ordering::SeqCst) + 1 })
                .await;
            assert_eq!(flight.value, expected);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_leader_hands_over() {
        let group: Arc<SingleFlight<&'static str, u32>> = Arc::new(SingleFlight::new());

        let leader = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .work("key", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let follower = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.work("key", || async { 2 }).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        leader.abort();
        let flight = follower.await.unwrap();
        assert_eq!(flight.value, 2);
        assert!(!flight.joined);
    }
}
