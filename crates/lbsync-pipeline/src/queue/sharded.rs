//! Sharded work queue with one drain loop per bucket
//!
//! Items are routed to `shard_index(item.shard_key(), N)`. Because each
//! bucket has exactly one worker, items sharing a shard key are handled one
//! at a time in submission order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use lbsync_common::{metrics, shard_index, ChangeKey, Error, Result};

use super::{QueueItem, WorkQueue};

/// Items that know which shard they belong to
pub trait Shardable {
    /// Value hashed to pick the bucket
    fn shard_key(&self) -> &str;
}

impl Shardable for ChangeKey {
    fn shard_key(&self) -> &str {
        ChangeKey::shard_key(self)
    }
}

/// Consumer invoked by every drain loop
#[async_trait]
pub trait WorkHandler<T>: Send + Sync + 'static {
    /// Handle one item. Retryable errors requeue the item with backoff.
    async fn handle(&self, item: T) -> Result<()>;
}

/// N work queues, each drained by a dedicated task
pub struct ShardedQueue<T> {
    name: String,
    buckets: Vec<WorkQueue<T>>,
}

impl<T: QueueItem + Shardable> ShardedQueue<T> {
    /// Create a queue with `shards` buckets (at least one)
    pub fn new(name: impl Into<String>, shards: usize, backoff: (Duration, Duration)) -> Self {
        let name = name.into();
        let buckets = (0..shards.max(1))
            .map(|i| WorkQueue::new(format!("{name}-{i}"), backoff.0, backoff.1))
            .collect();
        Self { name, buckets }
    }

    /// Queue name used in logs and metrics
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of buckets
    pub fn shards(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket an item is routed to
    pub fn bucket_for(&self, item: &T) -> usize {
        shard_index(item.shard_key(), self.buckets.len())
    }

    /// Add an item to its bucket, coalescing with a queued copy
    pub fn enqueue(&self, item: T) -> Result<()> {
        let bucket = self.bucket_for(&item);
        if self.buckets[bucket].add(item) {
            Ok(())
        } else {
            Err(Error::shutdown(format!("{} queue is stopped", self.name)))
        }
    }

    /// Add an item to its bucket after its backoff delay
    pub fn enqueue_rate_limited(&self, item: T) {
        let bucket = self.bucket_for(&item);
        self.buckets[bucket].add_rate_limited(item);
    }

    /// Reset the backoff for an item
    pub fn forget(&self, item: &T) {
        let bucket = self.bucket_for(item);
        self.buckets[bucket].forget(item);
    }

    /// Total number of queued items across buckets
    pub fn len(&self) -> usize {
        self.buckets.iter().map(WorkQueue::len).sum()
    }

    /// Whether every bucket is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn one drain loop per bucket.
    ///
    /// Each loop runs the handler in its own task so that a panic is
    /// contained to the item that caused it.
    pub fn run<H>(&self, handler: Arc<H>) -> Vec<JoinHandle<()>>
    where
        H: WorkHandler<T>,
    {
        self.buckets
            .iter()
            .enumerate()
            .map(|(index, bucket)| {
                let bucket = bucket.clone();
                let handler = Arc::clone(&handler);
                let name = self.name.clone();
                tokio::spawn(drain(name, index, bucket, handler))
            })
            .collect()
    }

    /// Stop accepting items; every drain loop exits after its current item
    pub fn stop_workers(&self) {
        for bucket in &self.buckets {
            bucket.shutdown();
        }
    }
}

async fn drain<T, H>(name: String, index: usize, bucket: WorkQueue<T>, handler: Arc<H>)
where
    T: QueueItem,
    H: WorkHandler<T>,
{
    debug!(queue = %name, bucket = index, "drain loop started");

    while let Some(item) = bucket.get().await {
        let task_handler = Arc::clone(&handler);
        let task_item = item.clone();
        let outcome = tokio::spawn(async move { task_handler.handle(task_item).await }).await;

        match outcome {
            Ok(Ok(())) => bucket.forget(&item),
            Ok(Err(e)) if e.is_retryable() => {
                warn!(queue = %name, item = %item, error = %e, "handler failed, requeueing");
                metrics::record_queue_failure(&name, "error");
                bucket.add_rate_limited(item.clone());
            }
            Ok(Err(e)) => {
                error!(queue = %name, item = %item, error = %e, "handler failed permanently, dropping item");
                metrics::record_queue_failure(&name, "error");
                bucket.forget(&item);
            }
            Err(join_err) => {
                error!(queue = %name, item = %item, error = %join_err, "handler panicked, requeueing");
                metrics::record_queue_failure(&name, "panic");
                bucket.add_rate_limited(item.clone());
            }
        }

        bucket.done(&item);
    }

    debug!(queue = %name, bucket = index, "drain loop stopped");
}
