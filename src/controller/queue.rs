//! # Reconcile Queue
//!
//! Deduplicating, rate-limited work queue of resource keys.
//!
//! A key is in at most one of two places at a time: pending in the queue or
//! in flight with a worker. Adding a pending key is a no-op; adding an
//! in-flight key marks it dirty so it is queued again exactly once when the
//! worker calls [`WorkQueue::done`]. This gives per-key mutual exclusion and
//! coalesces bursts of events into a single follow-up reconciliation.
//!
//! Delayed adds run on tokio timers. When a key has several delays pending,
//! the earliest deadline wins.

use crate::controller::backoff::exponential_backoff;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need processing: pending in `queue` or re-added while in flight
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: HashMap<K, Instant>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    available: Notify,
    drained: Notify,
    backoff_base: Duration,
    backoff_max: Duration,
}

/// Cloneable handle to a shared work queue
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("backoff_base", &self.inner.backoff_base)
            .field("backoff_max", &self.inner.backoff_max)
            .finish_non_exhaustive()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Create a queue whose rate limiter backs off from `backoff_base` up to `backoff_max`
    #[must_use]
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    waiting: HashMap::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                drained: Notify::new(),
                backoff_base,
                backoff_max,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a key for processing
    pub fn add(&self, key: K) {
        {
            let mut state = self.state();
            if state.shutting_down || state.dirty.contains(&key) {
                return;
            }
            state.dirty.insert(key.clone());
            if state.processing.contains(&key) {
                // requeued by `done`
                return;
            }
            state.queue.push_back(key);
        }
        self.inner.available.notify_one();
    }

    /// Wait for the next key
    ///
    /// Returns `None` once shutdown has started and the queue is empty.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Queue a key once `delay` has passed
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let deadline = Instant::now() + delay;
        {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            if state.waiting.get(&key).is_some_and(|d| *d <= deadline) {
                return;
            }
            state.waiting.insert(key.clone(), deadline);
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let due = {
                let mut state = queue.state();
                if state.waiting.get(&key) == Some(&deadline) {
                    state.waiting.remove(&key);
                    true
                } else {
                    false
                }
            };
            if due {
                queue.add(key);
            }
        });
    }

    /// Queue a key after its per-key exponential backoff, returning the delay used
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let failures = {
            let mut state = self.state();
            let count = state.failures.entry(key.clone()).or_insert(0);
            let failures = *count;
            *count = count.saturating_add(1);
            failures
        };
        let delay = exponential_backoff(failures, self.inner.backoff_base, self.inner.backoff_max);
        self.add_after(key, delay);
        delay
    }

    /// Reset the rate limiter for a key
    pub fn forget(&self, key: &K) {
        self.state().failures.remove(key);
    }

    /// Rate-limited requeues since the last [`Self::forget`]
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Release an in-flight key, queueing it again if it was re-added meanwhile
    pub fn done(&self, key: &K) {
        let (requeued, drained) = {
            let mut state = self.state();
            state.processing.remove(key);
            let requeued = state.dirty.contains(key);
            if requeued {
                state.queue.push_back(key.clone());
            }
            (requeued, state.processing.is_empty())
        };
        if requeued {
            self.inner.available.notify_one();
        }
        if drained {
            self.inner.drained.notify_waiters();
        }
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently held by workers
    pub fn in_flight(&self) -> usize {
        self.state().processing.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Stop accepting new keys; waiting workers are released once the queue is empty
    pub fn shutdown(&self) {
        self.state().shutting_down = true;
        self.inner.available.notify_waiters();
    }

    /// Shut down and wait until every in-flight key has been released
    pub async fn shutdown_with_drain(&self) {
        self.shutdown();
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.state().processing.is_empty() {
                return;
            }
            drained.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_add_coalesces_pending_keys() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
    }

    #[tokio::test]
    async fn test_in_flight_key_requeued_once_on_done() {
        let q = queue();
        q.add("a");
        let key = q.get().await.unwrap();

        q.add("a");
        q.add("a");
        assert_eq!(q.len(), 0, "in-flight key must not be handed out twice");

        q.done(&key);
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        q.done(&again);
        assert_eq!(q.len(), 0);
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_earliest_deadline_wins() {
        let q = queue();
        q.add_after("a", Duration::from_secs(10));
        q.add_after("a", Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(q.len(), 1);
        let key = q.get().await.unwrap();
        q.done(&key);

        // the superseded 10s timer does not fire a second time
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(q.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_zero_is_immediate() {
        let q = queue();
        q.add_after("a", Duration::ZERO);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_and_forget() {
        let q = queue();
        assert_eq!(q.add_rate_limited("a"), Duration::from_secs(1));
        assert_eq!(q.add_rate_limited("a"), Duration::from_secs(2));
        assert_eq!(q.add_rate_limited("a"), Duration::from_secs(4));
        assert_eq!(q.num_requeues(&"a"), 3);

        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
        assert_eq!(q.add_rate_limited("a"), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_then_stops() {
        let q = queue();
        q.add("a");
        q.shutdown();
        q.add("b");

        assert!(q.is_shutting_down());
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiting_worker() {
        let q = queue();
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.get().await }
        });
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_shutdown_with_drain_waits_for_in_flight() {
        let q = queue();
        q.add("a");
        let key = q.get().await.unwrap();

        let drain = tokio::spawn({
            let q = q.clone();
            async move { q.shutdown_with_drain().await }
        });
        tokio::task::yield_now().await;
        assert!(!drain.is_finished());

        q.done(&key);
        drain.await.unwrap();
        assert_eq!(q.in_flight(), 0);
    }
}
