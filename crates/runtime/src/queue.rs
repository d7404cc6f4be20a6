//! Rate-limited, deduplicating work queue.
//!
//! An item is handed to at most one worker at a time. Adding an item that is
//! already queued is a no-op; adding one that is being processed marks it
//! dirty and it is queued again once the worker calls `done`.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Per-item exponential backoff for `add_rate_limited`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self { base: Duration::from_millis(5), max: Duration::from_secs(1000) }
    }
}

impl RateLimit {
    /// Delay before retry number `failures` (0-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: FxHashSet<T>,
    processing: FxHashSet<T>,
    waiting: FxHashMap<T, Instant>,
    failures: FxHashMap<T, u32>,
    shutting_down: bool,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    limit: RateLimit,
}

/// Cheap to clone; clones share one queue.
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> std::fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue").field("name", &self.inner.name).finish_non_exhaustive()
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limit(name, RateLimit::default())
    }

    pub fn with_rate_limit(name: impl Into<String>, limit: RateLimit) -> Self {
        let state = State {
            queue: VecDeque::new(),
            dirty: FxHashSet::default(),
            processing: FxHashSet::default(),
            waiting: FxHashMap::default(),
            failures: FxHashMap::default(),
            shutting_down: false,
        };
        Self { inner: Arc::new(Inner { name: name.into(), state: Mutex::new(state), notify: Notify::new(), limit }) }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report_depth(&self, st: &State<T>) {
        gauge!("workqueue_depth", st.queue.len() as f64, "queue" => self.inner.name.clone());
    }

    pub fn add(&self, item: T) {
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(&item) {
            return;
        }
        st.dirty.insert(item.clone());
        if st.processing.contains(&item) {
            return;
        }
        st.queue.push_back(item);
        self.report_depth(&st);
        drop(st);
        self.inner.notify.notify_one();
    }

    /// Add once `delay` has passed. Pending delayed adds of the same item
    /// coalesce to the earliest deadline.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let ready = Instant::now() + delay;
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            match st.waiting.get(&item) {
                Some(at) if *at <= ready => return,
                _ => {
                    st.waiting.insert(item.clone(), ready);
                }
            }
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(ready).await;
            let fire = {
                let mut st = queue.lock();
                if st.waiting.get(&item) == Some(&ready) {
                    st.waiting.remove(&item);
                    true
                } else {
                    false
                }
            };
            if fire {
                queue.add(item);
            }
        });
    }

    /// Re-add after the item's current backoff, and count the failure.
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut st = self.lock();
            let n = st.failures.entry(item.clone()).or_insert(0);
            let delay = self.inner.limit.delay(*n);
            *n = n.saturating_add(1);
            delay
        };
        counter!("workqueue_retries_total", 1u64, "queue" => self.inner.name.clone());
        debug!(queue = %self.inner.name, item = ?item, delay_ms = delay.as_millis() as u64, "requeue rate limited");
        self.add_after(item, delay);
    }

    /// Reset the item's failure count.
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Wait for the next item. `None` once shut down and drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            {
                let mut st = self.lock();
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    let more = !st.queue.is_empty();
                    self.report_depth(&st);
                    drop(st);
                    if more {
                        // Pass the wakeup on so idle workers see the rest.
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
                if st.shutting_down {
                    drop(st);
                    self.inner.notify.notify_one();
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Finish processing; a dirty item goes back on the queue.
    pub fn done(&self, item: &T) {
        let mut st = self.lock();
        st.processing.remove(item);
        if st.dirty.contains(item) {
            st.queue.push_back(item.clone());
            self.report_depth(&st);
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    /// Stop accepting items. Workers drain what is queued, then `get` returns `None`.
    pub fn shutdown(&self) {
        {
            let mut st = self.lock();
            st.shutting_down = true;
            st.waiting.clear();
        }
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, item: &T) -> bool {
        self.lock().processing.contains(item)
    }
}
