//! Work queues
//!
//! [`WorkQueue`] is a deduplicating FIFO with the usual controller
//! semantics:
//!
//! - an item added while already queued is coalesced into the queued copy
//! - an item added while being processed is queued again once `done` is
//!   called, so one item is never handled by two workers at once
//! - `add_rate_limited` delays redelivery with per-item exponential backoff
//! - after `shutdown`, adds are refused and `get` returns `None`
//!
//! [`ShardedQueue`] fans a key space out over several work queues with one
//! drain loop each.

mod sharded;

pub use sharded::{ShardedQueue, Shardable, WorkHandler};

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Bounds required of anything placed on a work queue
pub trait QueueItem: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> QueueItem for T where T: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`
struct ItemBackoff<T> {
    base: Duration,
    max: Duration,
    failures: HashMap<T, u32>,
}

impl<T: Eq + Hash> ItemBackoff<T> {
    fn when(&mut self, item: T) -> Duration {
        let failures = self.failures.entry(item).or_insert(0);
        let exp = *failures;
        *failures = failures.saturating_add(1);

        self.base.saturating_mul(1u32 << exp.min(31)).min(self.max)
    }
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    backoff: Mutex<ItemBackoff<T>>,
    notify: Notify,
    stopped: CancellationToken,
}

/// Deduplicating, rate-limited FIFO work queue
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: QueueItem> WorkQueue<T> {
    /// Create a queue whose rate-limited redeliveries back off between
    /// `base` and `max`
    pub fn new(name: impl Into<String>, base: Duration, max: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                backoff: Mutex::new(ItemBackoff {
                    base,
                    max,
                    failures: HashMap::new(),
                }),
                notify: Notify::new(),
                stopped: CancellationToken::new(),
            }),
        }
    }

    /// Queue name used in logs and metrics
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add an item. Returns `false` if the queue is shutting down.
    pub fn add(&self, item: T) -> bool {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            trace!(queue = %self.inner.name, item = %item, "queue shutting down, dropping item");
            return false;
        }
        if state.dirty.contains(&item) {
            trace!(queue = %self.inner.name, item = %item, "coalesced with queued item");
            return true;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            // Re-queued by done()
            return true;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
        true
    }

    /// Add an item once `delay` has elapsed
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        let stopped = self.inner.stopped.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stopped.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    queue.add(item);
                }
            }
        });
    }

    /// Add an item after its per-item backoff delay
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.backoff.lock().when(item.clone());
        debug!(
            queue = %self.inner.name,
            item = %item,
            delay_ms = delay.as_millis() as u64,
            "requeueing with backoff"
        );
        self.add_after(item, delay);
    }

    /// Reset the backoff for an item
    pub fn forget(&self, item: &T) {
        self.inner.backoff.lock().failures.remove(item);
    }

    /// Number of rate-limited requeues since the last `forget`
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner
            .backoff
            .lock()
            .failures
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    /// Wait for the next item.
    ///
    /// Returns `None` once the queue is shutting down; items still queued at
    /// that point are discarded. The caller must call [`WorkQueue::done`]
    /// after handling the returned item.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Mark an item as processed, re-queueing it if it was added meanwhile
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Number of items waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no items are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `shutdown` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Refuse new items and wake every waiting `get`
    pub fn shutdown(&self) {
        let discarded = {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            let discarded = state.queue.len();
            state.queue.clear();
            state.dirty.clear();
            discarded
        };
        self.inner.stopped.cancel();
        self.inner.notify.notify_waiters();
        debug!(queue = %self.inner.name, discarded, "queue shut down");
    }
}
