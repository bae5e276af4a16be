//! Reconciliation pipeline for lbsync
//!
//! Change events flow through a fixed sequence of stages:
//!
//! ```text
//! event source -> ingestion queue (sharded by namespace)
//!              -> graph builder (mutates desired-state models)
//!              -> sync queue (sharded by model name)
//!              -> REST synchronizer (diffs model against remote cache)
//!              -> remote controller -> cache refresh -> status queue
//! ```
//!
//! Failed synchronizations are routed to the fast or slow retry queue, which
//! re-inject the model name into the sync queue. The scheduler runs periodic
//! and on-demand full syncs.

#![deny(missing_docs)]

pub mod cache;
pub mod graph;
pub mod pipeline;
pub mod queue;
pub mod rest;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheEntry, RemoteCache};
pub use graph::{
    Contribution, DesiredNode, GraphBuilder, GraphTranslator, ModelName, ModelPublisher,
    ModelRegistry, NodeId, ObjectGraph, Translation,
};
pub use pipeline::{EventSource, Pipeline, PipelineBuilder};
pub use queue::{ShardedQueue, Shardable, WorkHandler, WorkQueue};
pub use rest::{
    classify, ErrorClass, HttpRemoteClient, RemoteClient, RemoteError, RemoteErrorCode,
    RestMethod, RestOp, RestSynchronizer, SyncContext, SyncOutcome,
};
pub use retry::{RetryClass, RetryDecision, RetryQueues};
pub use scheduler::{FullSync, FullSyncer, QuickSyncHandle, SyncScheduler};
pub use shutdown::ShutdownSignal;
pub use status::{StatusCondition, StatusQueue, StatusUpdate, StatusWriter};
