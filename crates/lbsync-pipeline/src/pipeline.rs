//! Pipeline wiring and lifecycle
//!
//! [`PipelineBuilder`] constructs every stage once and hands each one the
//! collaborators it needs. [`Pipeline::run`] populates the cache, starts all
//! workers, feeds events from an [`EventSource`] into the ingestion queue,
//! and tears everything down when the shutdown signal fires.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lbsync_common::retry::{retry_with_backoff, RetryConfig};
use lbsync_common::{metrics, ChangeEvent, ChangeKey, Error, EventOp, Result, SyncConfig};

use crate::cache::RemoteCache;
use crate::graph::{GraphBuilder, GraphTranslator, ModelName, ModelPublisher, ModelRegistry};
use crate::queue::ShardedQueue;
use crate::rest::{RemoteClient, RestSynchronizer, SyncContext};
use crate::retry::RetryQueues;
use crate::scheduler::{FullSyncer, QuickSyncHandle, SyncScheduler};
use crate::shutdown::ShutdownSignal;
use crate::status::{StatusQueue, StatusWriter};

/// Buffered events between the source and the ingestion queue
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Attempts at the initial cache population before giving up
const BOOTSTRAP_ATTEMPTS: u32 = 10;

/// Producer of change events (e.g. Kubernetes watches)
#[async_trait]
pub trait EventSource: Send {
    /// Send events on `tx` until `shutdown` fires or the source is exhausted
    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<ChangeEvent>,
        shutdown: CancellationToken,
    ) -> Result<()>;
}

/// Builder for [`Pipeline`]
pub struct PipelineBuilder {
    config: SyncConfig,
    client: Option<Arc<dyn RemoteClient>>,
    translator: Option<Arc<dyn GraphTranslator>>,
    status_writer: Option<Arc<dyn StatusWriter>>,
    shutdown: Option<ShutdownSignal>,
    bootstrap_retry: RetryConfig,
}

impl PipelineBuilder {
    fn new(config: SyncConfig) -> Self {
        Self {
            config,
            client: None,
            translator: None,
            status_writer: None,
            shutdown: None,
            bootstrap_retry: RetryConfig::with_max_attempts(BOOTSTRAP_ATTEMPTS),
        }
    }

    /// Transport to the remote controller (required)
    pub fn remote_client(mut self, client: Arc<dyn RemoteClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Resource translator (required)
    pub fn translator(mut self, translator: Arc<dyn GraphTranslator>) -> Self {
        self.translator = Some(translator);
        self
    }

    /// Writer for status conditions (required)
    pub fn status_writer(mut self, writer: Arc<dyn StatusWriter>) -> Self {
        self.status_writer = Some(writer);
        self
    }

    /// Share an existing shutdown signal instead of creating one
    pub fn shutdown_signal(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = Some(signal);
        self
    }

    /// Override the backoff used for the initial cache population
    pub fn bootstrap_retry(mut self, retry: RetryConfig) -> Self {
        self.bootstrap_retry = retry;
        self
    }

    /// Construct every stage
    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;
        let client = self
            .client
            .ok_or_else(|| Error::config("remoteClient", "a remote client is required"))?;
        let translator = self
            .translator
            .ok_or_else(|| Error::config("translator", "a graph translator is required"))?;
        let status_writer = self
            .status_writer
            .ok_or_else(|| Error::config("statusWriter", "a status writer is required"))?;

        let config = Arc::new(self.config);
        let shutdown = self.shutdown.unwrap_or_default();
        let registry = Arc::new(ModelRegistry::new());
        let cache = Arc::new(RemoteCache::new(Arc::clone(&client), &config));

        let ingestion = Arc::new(ShardedQueue::<ChangeKey>::new(
            "ingestion",
            config.ingestion_shards,
            config.requeue_backoff(),
        ));
        let sync_queue = Arc::new(ShardedQueue::<ModelName>::new(
            "sync",
            config.sync_workers,
            config.requeue_backoff(),
        ));
        let publisher: Arc<dyn ModelPublisher> = sync_queue.clone();

        let builder = Arc::new(GraphBuilder::new(
            Arc::clone(&registry),
            translator,
            Arc::clone(&publisher),
        ));
        let retry = Arc::new(RetryQueues::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&publisher),
        ));
        let status = Arc::new(StatusQueue::new(config.requeue_backoff()));

        let interval = if config.delete_config {
            warn!("delete-config mode, periodic full sync disabled");
            None
        } else {
            config.full_sync_interval()
        };
        let full_syncer = Arc::new(FullSyncer::new(
            &config,
            Arc::clone(&registry),
            Arc::clone(&cache),
            publisher,
        ));
        let (scheduler, quick_sync) = SyncScheduler::new(interval, full_syncer, shutdown.token());

        let synchronizer = Arc::new(RestSynchronizer::new(SyncContext {
            config: Arc::clone(&config),
            registry: Arc::clone(&registry),
            cache: Arc::clone(&cache),
            client,
            retry: Arc::clone(&retry),
            status: Arc::clone(&status),
            quick_sync: quick_sync.clone(),
            shutdown: shutdown.clone(),
        }));

        Ok(Pipeline {
            config,
            registry,
            cache,
            ingestion,
            sync_queue,
            builder,
            synchronizer,
            retry,
            status,
            status_writer,
            quick_sync,
            scheduler: Mutex::new(Some(scheduler)),
            shutdown,
            bootstrap_retry: self.bootstrap_retry,
        })
    }
}

/// The assembled reconciliation pipeline
pub struct Pipeline {
    config: Arc<SyncConfig>,
    registry: Arc<ModelRegistry>,
    cache: Arc<RemoteCache>,
    ingestion: Arc<ShardedQueue<ChangeKey>>,
    sync_queue: Arc<ShardedQueue<ModelName>>,
    builder: Arc<GraphBuilder>,
    synchronizer: Arc<RestSynchronizer>,
    retry: Arc<RetryQueues>,
    status: Arc<StatusQueue>,
    status_writer: Arc<dyn StatusWriter>,
    quick_sync: QuickSyncHandle,
    scheduler: Mutex<Option<SyncScheduler>>,
    shutdown: ShutdownSignal,
    bootstrap_retry: RetryConfig,
}

impl Pipeline {
    /// Start building a pipeline
    pub fn builder(config: SyncConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Pipeline configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Desired-state models
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Remote inventory mirror
    pub fn cache(&self) -> &Arc<RemoteCache> {
        &self.cache
    }

    /// Status feedback queue
    pub fn status(&self) -> &Arc<StatusQueue> {
        &self.status
    }

    /// Handle to request a quick full sync
    pub fn quick_sync(&self) -> &QuickSyncHandle {
        &self.quick_sync
    }

    /// Shared stop signal
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Accept one change event into the ingestion queue
    pub fn ingest(&self, event: ChangeEvent) -> Result<()> {
        if self.shutdown.is_stopped() {
            return Err(Error::shutdown("pipeline is stopping"));
        }
        if event.op == EventOp::Delete {
            self.status.forget(&event.key);
        }
        let key = event.key.clone();
        self.builder.record(event);
        self.ingestion.enqueue(key)
    }

    /// Populate the cache for every configured kind.
    ///
    /// Exhausting the retry budget is fatal: the pipeline cannot diff
    /// without a baseline.
    pub async fn bootstrap(&self) -> Result<()> {
        retry_with_backoff(
            &self.bootstrap_retry,
            "populate remote cache",
            Error::is_retryable,
            || self.cache.populate_all(),
        )
        .await
        .map_err(|e| {
            metrics::record_fatal_shutdown("bootstrap");
            self.shutdown
                .trigger_fatal(format!("initial cache population failed: {e}"));
            e
        })?;

        for kind in self.cache.kinds() {
            debug!(kind = %kind, objects = self.cache.len(kind), "cache ready");
        }
        Ok(())
    }

    /// Run until the shutdown signal fires.
    ///
    /// Returns an error if the pipeline stopped because of a fatal
    /// condition.
    pub async fn run(self: Arc<Self>, source: Box<dyn EventSource>) -> Result<()> {
        let scheduler = self
            .scheduler
            .lock()
            .take()
            .ok_or_else(|| Error::internal("pipeline is already running"))?;

        self.bootstrap().await?;

        let mut handles = Vec::new();
        handles.extend(self.ingestion.run(Arc::clone(&self.builder)));
        handles.extend(self.sync_queue.run(Arc::clone(&self.synchronizer)));
        handles.extend(self.retry.run());
        handles.push(self.status.run(Arc::clone(&self.status_writer)));
        handles.push(tokio::spawn(scheduler.run()));
        info!(
            ingestion_shards = self.ingestion.shards(),
            sync_workers = self.sync_queue.shards(),
            "pipeline started"
        );

        // Reconcile anything that drifted while the process was down
        self.quick_sync.trigger();

        let token = self.shutdown.token();
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let source_handle = tokio::spawn(source.run(tx, token.clone()));

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.ingest(event) {
                            warn!(error = %e, "failed to ingest event");
                        }
                    }
                    None => {
                        debug!("event source finished, waiting for shutdown");
                        token.cancelled().await;
                        break;
                    }
                },
            }
        }

        info!("stopping pipeline workers");
        self.stop_workers();
        match source_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "event source failed"),
            Err(e) => warn!(error = %e, "event source task panicked"),
        }
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "worker task panicked");
            }
        }

        match self.shutdown.fatal_reason() {
            Some(reason) => Err(Error::shutdown(reason)),
            None => {
                info!("pipeline stopped");
                Ok(())
            }
        }
    }

    /// Request a graceful stop
    pub fn shutdown(&self) {
        self.shutdown.stop();
    }

    fn stop_workers(&self) {
        self.ingestion.stop_workers();
        self.sync_queue.stop_workers();
        self.retry.stop_workers();
        self.status.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Contribution, DesiredNode, MockGraphTranslator, NodeId, Translation};
    use crate::rest::{RemoteError, RestMethod};
    use crate::status::{MockStatusWriter, StatusCondition};
    use crate::testing::FakeController;
    use lbsync_common::ResourceType;
    use serde_json::json;
    use std::time::Duration;

    /// Sends a fixed list of events, then waits for shutdown
    struct ScriptedSource {
        events: Vec<ChangeEvent>,
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn run(
            self: Box<Self>,
            tx: mpsc::Sender<ChangeEvent>,
            shutdown: CancellationToken,
        ) -> Result<()> {
            for event in self.events {
                if tx.send(event).await.is_err() {
                    return Ok(());
                }
            }
            shutdown.cancelled().await;
            Ok(())
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            cluster_name: "c1".to_string(),
            ingestion_shards: 2,
            sync_workers: 2,
            fast_retry_base_ms: 1,
            fast_retry_max_ms: 5,
            slow_retry_base_ms: 1,
            slow_retry_max_ms: 5,
            requeue_base_ms: 1,
            requeue_max_ms: 5,
            full_sync_interval_secs: 0,
            object_kinds: vec!["virtualservice".to_string(), "pool".to_string()],
            ..Default::default()
        }
    }

    fn gateway_key() -> ChangeKey {
        ChangeKey::new(ResourceType::Gateway, "team-a", "edge")
    }

    fn translator() -> MockGraphTranslator {
        let mut translator = MockGraphTranslator::new();
        translator.expect_translate().returning(|key| {
            let model = ModelName::new("admin", &format!("c1--team-a-{}", key.name()));
            let vs = NodeId::new("virtualservice", model.name());
            Ok(Some(Translation {
                contributions: vec![Contribution {
                    model: model.clone(),
                    governs: true,
                    nodes: vec![
                        DesiredNode::root(vs.clone(), json!({"services": [{"port": 443}]})),
                        DesiredNode::child(
                            NodeId::new("pool", format!("{}-api", model.name())),
                            vs,
                            json!({"servers": []}),
                        ),
                    ],
                }],
                dependencies: vec![],
            }))
        });
        translator
    }

    fn recording_writer() -> (MockStatusWriter, Arc<Mutex<Vec<(ChangeKey, StatusCondition)>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = written.clone();
        let mut writer = MockStatusWriter::new();
        writer.expect_write().returning(move |key, condition| {
            sink.lock().push((key.clone(), condition.clone()));
            Ok(())
        });
        (writer, written)
    }

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..400 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[test]
    fn build_requires_collaborators() {
        let err = Pipeline::builder(config()).build().err().unwrap();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn build_validates_config() {
        let err = Pipeline::builder(SyncConfig {
            cluster_name: String::new(),
            ..config()
        })
        .remote_client(Arc::new(FakeController::new()))
        .translator(Arc::new(MockGraphTranslator::new()))
        .status_writer(Arc::new(MockStatusWriter::new()))
        .build()
        .err()
        .unwrap();
        assert!(matches!(err, Error::Config { .. }));
    }

    /// Story: a Gateway event flows through every stage to the controller and
    /// its status comes back as Synced
    #[tokio::test]
    async fn story_event_to_remote_objects_and_status() {
        let fake = Arc::new(FakeController::new());
        let (writer, written) = recording_writer();
        let pipeline = Arc::new(
            Pipeline::builder(config())
                .remote_client(fake.clone())
                .translator(Arc::new(translator()))
                .status_writer(Arc::new(writer))
                .build()
                .unwrap(),
        );

        let source = ScriptedSource {
            events: vec![ChangeEvent::new(EventOp::Add, gateway_key()).with_generation(Some(1))],
        };
        let run = tokio::spawn(Arc::clone(&pipeline).run(Box::new(source)));

        assert!(wait_for(|| fake.object_named("virtualservice", "c1--team-a-edge").is_some()).await);
        assert!(wait_for(|| fake.object_named("pool", "c1--team-a-edge-api").is_some()).await);
        assert!(wait_for(|| !written.lock().is_empty()).await);
        let (key, condition) = written.lock()[0].clone();
        assert_eq!(key, gateway_key());
        assert_eq!(condition, StatusCondition::synced(Some(1)));

        // Deleting the Gateway removes its remote objects
        pipeline
            .ingest(ChangeEvent::new(EventOp::Delete, gateway_key()))
            .unwrap();
        assert!(wait_for(|| fake.objects("virtualservice").is_empty()).await);
        assert!(wait_for(|| fake.objects("pool").is_empty()).await);

        pipeline.shutdown();
        run.await.unwrap().unwrap();
        assert!(pipeline.ingest(ChangeEvent::new(EventOp::Add, gateway_key())).is_err());
    }

    /// Story: a failed bootstrap is fatal and nothing starts
    #[tokio::test]
    async fn story_bootstrap_failure_is_fatal() {
        let fake = Arc::new(FakeController::new());
        fake.fail_next_get(RemoteError::new(401, "Invalid credentials"));
        let pipeline = Arc::new(
            Pipeline::builder(config())
                .remote_client(fake.clone())
                .translator(Arc::new(MockGraphTranslator::new()))
                .status_writer(Arc::new(MockStatusWriter::new()))
                .bootstrap_retry(RetryConfig {
                    max_attempts: 2,
                    initial_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                    backoff_multiplier: 2.0,
                })
                .build()
                .unwrap(),
        );

        let err = Arc::clone(&pipeline)
            .run(Box::new(ScriptedSource { events: vec![] }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cache { .. }));
        assert!(pipeline.shutdown_signal().fatal_reason().is_some());
        assert_eq!(fake.write_count(), 0);
    }

    #[tokio::test]
    async fn fatal_rest_error_stops_the_pipeline() {
        let fake = Arc::new(FakeController::new());
        fake.fail_next(Some(RestMethod::Post), RemoteError::new(401, "token expired"));
        let (writer, _) = recording_writer();
        let pipeline = Arc::new(
            Pipeline::builder(config())
                .remote_client(fake.clone())
                .translator(Arc::new(translator()))
                .status_writer(Arc::new(writer))
                .build()
                .unwrap(),
        );

        let source = ScriptedSource {
            events: vec![ChangeEvent::new(EventOp::Add, gateway_key())],
        };
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            Arc::clone(&pipeline).run(Box::new(source)),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::Shutdown { .. })));
        assert_eq!(fake.write_count(), 1);
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let pipeline = Arc::new(
            Pipeline::builder(config())
                .remote_client(Arc::new(FakeController::new()))
                .translator(Arc::new(MockGraphTranslator::new()))
                .status_writer(Arc::new(MockStatusWriter::new()))
                .build()
                .unwrap(),
        );
        pipeline.scheduler.lock().take();
        let err = Arc::clone(&pipeline)
            .run(Box::new(ScriptedSource { events: vec![] }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }
}
