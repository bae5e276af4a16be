//! Fast and slow retry queues
//!
//! Failed synchronizations are routed by class: the fast queue handles
//! transient failures with a short bounded backoff, the slow queue handles
//! failures that need the controller to come back (long backoff). Each queue
//! has one worker that re-injects the model name into the sync queue once
//! its delay has elapsed.
//!
//! Every scheduled retry counts against the model's budget in the registry.
//! A model that fails more often than the cap is abandoned: logged at error
//! level and not retried until a new change or a full sync resets it.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use lbsync_common::{metrics, SyncConfig};

use crate::graph::{ModelName, ModelPublisher, ModelRegistry};
use crate::queue::WorkQueue;

/// Which retry path a failure takes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    /// Short backoff for transient failures
    Fast,
    /// Long backoff for failures that need external remediation
    Slow,
}

impl RetryClass {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryClass::Fast => "fast",
            RetryClass::Slow => "slow",
        }
    }
}

/// Outcome of [`RetryQueues::schedule`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// The model will be re-synced; `attempt` counts from 1
    Scheduled {
        /// Retry number
        attempt: u32,
    },
    /// The budget is exhausted; the model will not be retried
    Abandoned {
        /// Failures counted
        attempts: u32,
    },
}

/// Pair of rate-limited redelivery queues
pub struct RetryQueues {
    fast: WorkQueue<ModelName>,
    slow: WorkQueue<ModelName>,
    registry: Arc<ModelRegistry>,
    publisher: Arc<dyn ModelPublisher>,
    cap: u32,
}

impl RetryQueues {
    /// Create both queues with the backoff bounds and cap from `config`
    pub fn new(
        config: &SyncConfig,
        registry: Arc<ModelRegistry>,
        publisher: Arc<dyn ModelPublisher>,
    ) -> Self {
        let (fast_base, fast_max) = config.fast_retry_backoff();
        let (slow_base, slow_max) = config.slow_retry_backoff();
        Self {
            fast: WorkQueue::new("fast-retry", fast_base, fast_max),
            slow: WorkQueue::new("slow-retry", slow_base, slow_max),
            registry,
            publisher,
            cap: config.retry_cap,
        }
    }

    /// Count a failure for `model` and schedule a retry unless the cap is
    /// exceeded
    pub fn schedule(&self, model: &ModelName, class: RetryClass) -> RetryDecision {
        let attempts = self.registry.record_retry_attempt(model);
        if attempts > self.cap {
            error!(
                model = %model,
                attempts,
                cap = self.cap,
                "retry budget exhausted, abandoning model until the next change or full sync"
            );
            metrics::record_abandoned();
            return RetryDecision::Abandoned { attempts };
        }

        debug!(model = %model, queue = class.as_str(), attempt = attempts, "scheduling retry");
        metrics::record_retry(class.as_str());
        self.queue(class).add_rate_limited(model.clone());
        RetryDecision::Scheduled { attempt: attempts }
    }

    /// Reset the backoff of a model that synchronized successfully
    pub fn forget(&self, model: &ModelName) {
        self.fast.forget(model);
        self.slow.forget(model);
    }

    /// Redeliveries of `model` queued so far on one queue
    pub fn num_requeues(&self, model: &ModelName, class: RetryClass) -> u32 {
        self.queue(class).num_requeues(model)
    }

    /// Spawn one worker per queue
    pub fn run(&self) -> Vec<JoinHandle<()>> {
        [RetryClass::Fast, RetryClass::Slow]
            .into_iter()
            .map(|class| {
                let queue = self.queue(class).clone();
                let publisher = Arc::clone(&self.publisher);
                tokio::spawn(async move {
                    while let Some(model) = queue.get().await {
                        if let Err(e) = publisher.publish(&model) {
                            warn!(model = %model, queue = class.as_str(), error = %e, "failed to re-inject model");
                        }
                        queue.done(&model);
                    }
                    debug!(queue = class.as_str(), "retry worker stopped");
                })
            })
            .collect()
    }

    /// Stop both workers after their current item
    pub fn stop_workers(&self) {
        self.fast.shutdown();
        self.slow.shutdown();
    }

    fn queue(&self, class: RetryClass) -> &WorkQueue<ModelName> {
        match class {
            RetryClass::Fast => &self.fast,
            RetryClass::Slow => &self.slow,
        }
    }
}
