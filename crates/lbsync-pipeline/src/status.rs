//! Status feedback queue
//!
//! Synchronization outcomes are reported back to the resources that
//! contributed to a model. Delivery is at-least-once: failed writes are
//! requeued with backoff. Only the latest condition per key is kept, and a
//! condition identical to the last one applied is never written again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use lbsync_common::{metrics, ChangeKey, Result};

use crate::queue::WorkQueue;

/// Condition type written on origin resources
pub const CONDITION_PROGRAMMED: &str = "Programmed";
/// Every object of the model exists remotely with the desired content
pub const REASON_SYNCED: &str = "Synced";
/// The last synchronization failed without automatic retry
pub const REASON_SYNC_FAILED: &str = "SyncFailed";
/// The retry budget was exhausted
pub const REASON_RETRY_EXHAUSTED: &str = "RetryExhausted";
/// A retry or resync is scheduled
pub const REASON_PENDING: &str = "Pending";

/// Condition status value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not yet determined
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// One status condition applied to an origin resource
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,
    /// True/False/Unknown
    pub status: ConditionStatus,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable detail
    pub message: String,
    /// Generation of the resource the outcome refers to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl StatusCondition {
    fn programmed(
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        observed_generation: Option<i64>,
    ) -> Self {
        Self {
            type_: CONDITION_PROGRAMMED.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            observed_generation,
        }
    }

    /// Model synchronized successfully
    pub fn synced(observed_generation: Option<i64>) -> Self {
        Self::programmed(
            ConditionStatus::True,
            REASON_SYNCED,
            "Configuration synchronized to the load balancer",
            observed_generation,
        )
    }

    /// Synchronization failed and will not be retried automatically
    pub fn sync_failed(message: impl Into<String>, observed_generation: Option<i64>) -> Self {
        Self::programmed(
            ConditionStatus::False,
            REASON_SYNC_FAILED,
            message,
            observed_generation,
        )
    }

    /// Retry budget exhausted
    pub fn retry_exhausted(message: impl Into<String>, observed_generation: Option<i64>) -> Self {
        Self::programmed(
            ConditionStatus::False,
            REASON_RETRY_EXHAUSTED,
            message,
            observed_generation,
        )
    }

    /// Waiting for a retry or resync
    pub fn pending(message: impl Into<String>, observed_generation: Option<i64>) -> Self {
        Self::programmed(
            ConditionStatus::False,
            REASON_PENDING,
            message,
            observed_generation,
        )
    }
}

/// Condition addressed to one origin resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Origin resource
    pub key: ChangeKey,
    /// Condition to apply
    pub condition: StatusCondition,
}

/// Applies conditions to origin resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Apply `condition` to the resource behind `key`.
    ///
    /// Implementations treat a missing resource as success.
    async fn write(&self, key: &ChangeKey, condition: &StatusCondition) -> Result<()>;
}

/// Single-worker queue of status updates
pub struct StatusQueue {
    queue: WorkQueue<ChangeKey>,
    pending: DashMap<ChangeKey, StatusCondition>,
    applied: DashMap<ChangeKey, StatusCondition>,
}

impl StatusQueue {
    /// Create a queue whose failed writes back off between `base` and `max`
    pub fn new(backoff: (Duration, Duration)) -> Self {
        Self {
            queue: WorkQueue::new("status", backoff.0, backoff.1),
            pending: DashMap::new(),
            applied: DashMap::new(),
        }
    }

    /// Queue a condition for delivery.
    ///
    /// Returns `false` when the condition is already applied and nothing was
    /// queued.
    pub fn publish(&self, update: StatusUpdate) -> bool {
        let StatusUpdate { key, condition } = update;
        let unchanged = self
            .applied
            .get(&key)
            .map(|applied| *applied == condition)
            .unwrap_or(false);
        if unchanged && !self.pending.contains_key(&key) {
            debug!(key = %key, reason = %condition.reason, "status unchanged, skipping");
            metrics::record_status_write("unchanged");
            return false;
        }

        self.pending.insert(key.clone(), condition);
        self.queue.add(key)
    }

    /// Forget everything known about a deleted resource
    pub fn forget(&self, key: &ChangeKey) {
        self.pending.remove(key);
        self.applied.remove(key);
        self.queue.forget(key);
    }

    /// Condition last applied to a resource
    pub fn applied(&self, key: &ChangeKey) -> Option<StatusCondition> {
        self.applied.get(key).map(|c| c.clone())
    }

    /// Condition queued for a resource but not yet written
    pub fn pending(&self, key: &ChangeKey) -> Option<StatusCondition> {
        self.pending.get(key).map(|c| c.clone())
    }

    /// Number of keys waiting for delivery
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is waiting for delivery
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Spawn the delivery worker
    pub fn run(self: &Arc<Self>, writer: Arc<dyn StatusWriter>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(key) = this.queue.get().await {
                this.deliver(&key, writer.as_ref()).await;
                this.queue.done(&key);
            }
            debug!("status worker stopped");
        })
    }

    /// Stop the worker after its current write
    pub fn stop(&self) {
        self.queue.shutdown();
    }

    async fn deliver(&self, key: &ChangeKey, writer: &dyn StatusWriter) {
        let Some((_, condition)) = self.pending.remove(key) else {
            return;
        };
        let unchanged = self
            .applied
            .get(key)
            .map(|applied| *applied == condition)
            .unwrap_or(false);
        if unchanged {
            metrics::record_status_write("unchanged");
            return;
        }

        match writer.write(key, &condition).await {
            Ok(()) => {
                debug!(key = %key, status = %condition.status, reason = %condition.reason, "status written");
                metrics::record_status_write("written");
                self.applied.insert(key.clone(), condition);
                self.queue.forget(key);
            }
            Err(e) => {
                warn!(key = %key, error = %e, "status write failed, requeueing");
                metrics::record_status_write("error");
                self.pending.entry(key.clone()).or_insert(condition);
                self.queue.add_rate_limited(key.clone());
            }
        }
    }
}
