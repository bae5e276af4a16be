//! Full and quick sync scheduling
//!
//! A single dispatcher loop waits on a periodic timer and on the quick-sync
//! channel and runs one full sync at a time. Full syncs can race with
//! per-model syncs from the ingestion path; the REST layer consults the
//! cache before every decision, which bounds the damage to a redundant
//! operation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use lbsync_common::{metrics, Result, SyncConfig};

use crate::cache::RemoteCache;
use crate::graph::{ModelName, ModelPublisher, ModelRegistry};

/// Something that can reconcile every model at once
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FullSync: Send + Sync {
    /// Run one full reconciliation pass
    async fn full_sync(&self) -> Result<()>;
}

/// Handle used to request an immediate full sync.
///
/// Requests made while one is already pending are coalesced.
#[derive(Clone, Debug)]
pub struct QuickSyncHandle {
    tx: mpsc::Sender<()>,
}

impl QuickSyncHandle {
    /// Request a quick sync. Returns `false` once the scheduler has stopped.
    pub fn trigger(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(())) => {
                debug!("quick sync already pending");
                true
            }
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

/// Dispatcher for periodic and on-demand full syncs
pub struct SyncScheduler {
    interval: Option<Duration>,
    rx: mpsc::Receiver<()>,
    syncer: Arc<dyn FullSync>,
    shutdown: CancellationToken,
}

impl SyncScheduler {
    /// Create a scheduler and the handle used to trigger quick syncs.
    ///
    /// An interval of `None` disables periodic syncs; quick syncs still run.
    pub fn new(
        interval: Option<Duration>,
        syncer: Arc<dyn FullSync>,
        shutdown: CancellationToken,
    ) -> (Self, QuickSyncHandle) {
        if interval.is_none() {
            warn!("periodic full sync is disabled");
        }
        let (tx, rx) = mpsc::channel(1);
        (
            Self {
                interval,
                rx,
                syncer,
                shutdown,
            },
            QuickSyncHandle { tx },
        )
    }

    /// Run until the shutdown token fires
    pub async fn run(mut self) {
        let mut ticker = self.interval.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        info!(interval_secs = ?self.interval.map(|d| d.as_secs()), "sync scheduler started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(()) = self.rx.recv() => self.run_once("quick").await,
                _ = next_tick(&mut ticker) => self.run_once("periodic").await,
            }
        }
        self.rx.close();
        info!("sync scheduler stopped");
    }

    async fn run_once(&self, trigger: &'static str) {
        debug!(trigger, "starting full sync");
        if let Err(e) = self.syncer.full_sync().await {
            warn!(trigger, error = %e, "full sync failed");
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Full sync over the registry and the remote cache
pub struct FullSyncer {
    registry: Arc<ModelRegistry>,
    cache: Arc<RemoteCache>,
    publisher: Arc<dyn ModelPublisher>,
    shard_prefix: Option<String>,
}

impl FullSyncer {
    /// Create a full syncer. With `sync_namespace` set, only models whose
    /// name carries that namespace's shard prefix are published.
    pub fn new(
        config: &SyncConfig,
        registry: Arc<ModelRegistry>,
        cache: Arc<RemoteCache>,
        publisher: Arc<dyn ModelPublisher>,
    ) -> Self {
        Self {
            registry,
            cache,
            publisher,
            shard_prefix: config
                .sync_namespace
                .as_deref()
                .map(|ns| config.namespace_shard_prefix(ns)),
        }
    }

    fn in_scope(&self, object_name: &str) -> bool {
        match &self.shard_prefix {
            Some(prefix) => object_name.starts_with(prefix.as_str()),
            None => true,
        }
    }
}

#[async_trait]
impl FullSync for FullSyncer {
    /// Refresh the cache, reset every retry counter, and publish each model
    /// whose remote objects differ from its graph, plus every model that
    /// still owns remote objects but is no longer known locally.
    async fn full_sync(&self) -> Result<()> {
        let started = Instant::now();
        self.cache.populate_all().await?;
        self.registry.reset_retry_counters();

        let mut published = 0usize;
        let known = self.registry.names();
        for name in &known {
            if !self.in_scope(name.name()) {
                continue;
            }
            let Some(graph) = self.registry.snapshot(name) else {
                continue;
            };
            if !self.cache.matches(&graph) {
                self.publisher.publish(name)?;
                published += 1;
            }
        }

        let known: HashSet<&ModelName> = known.iter().collect();
        for orphan in self.cache.owner_models() {
            if known.contains(&orphan) || !self.in_scope(orphan.name()) {
                continue;
            }
            debug!(model = %orphan, "remote objects left by an unknown model");
            self.publisher.publish(&orphan)?;
            published += 1;
        }

        let elapsed = started.elapsed();
        metrics::FULL_SYNC_DURATION.record(elapsed.as_secs_f64(), &[]);
        info!(
            models = self.registry.len(),
            published,
            duration_ms = elapsed.as_millis() as u64,
            "full sync complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{payload_checksum, DesiredNode, MockModelPublisher, NodeId};
    use crate::testing::FakeController;
    use lbsync_common::{ChangeKey, Error, ResourceType};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(sync_namespace: Option<&str>) -> SyncConfig {
        SyncConfig {
            cluster_name: "c1".to_string(),
            sync_namespace: sync_namespace.map(str::to_string),
            object_kinds: vec!["virtualservice".to_string()],
            ..Default::default()
        }
    }

    fn add_model(registry: &ModelRegistry, namespace: &str) -> ModelName {
        let name = ModelName::new("admin", &format!("c1--{namespace}-edge"));
        registry.get_or_create(&name).write().upsert_contribution(
            &ChangeKey::new(ResourceType::Gateway, namespace, "edge"),
            None,
            vec![DesiredNode::root(
                NodeId::new("virtualservice", name.name()),
                json!({}),
            )],
            true,
        );
        name
    }

    fn recording_publisher() -> (MockModelPublisher, Arc<Mutex<Vec<ModelName>>>) {
        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = published.clone();
        let mut publisher = MockModelPublisher::new();
        publisher.expect_publish().returning(move |m| {
            sink.lock().push(m.clone());
            Ok(())
        });
        (publisher, published)
    }

    /// Story: with a namespace filter only that namespace's models are published
    #[tokio::test]
    async fn story_namespace_scoped_full_sync() {
        let registry = Arc::new(ModelRegistry::new());
        let team_a = add_model(&registry, "team-a");
        add_model(&registry, "team-b");

        let config = config(Some("team-a"));
        let cache = Arc::new(RemoteCache::new(Arc::new(FakeController::new()), &config));
        let (publisher, published) = recording_publisher();
        let syncer = FullSyncer::new(&config, registry, cache, Arc::new(publisher));

        syncer.full_sync().await.unwrap();
        assert_eq!(*published.lock(), vec![team_a]);
    }

    fn owned_vs(name: &ModelName, checksum: &str) -> serde_json::Value {
        json!({
            "name": name.name(),
            "created_by": "lbsync-c1",
            "cloud_config_cksum": checksum,
            "markers": [{"key": "model", "values": [name.as_str()]}],
        })
    }

    #[tokio::test]
    async fn full_sync_resets_retry_counters_and_skips_matching_models() {
        let registry = Arc::new(ModelRegistry::new());
        let in_sync = add_model(&registry, "team-a");
        let missing = add_model(&registry, "team-b");
        registry.record_retry_attempt(&missing);
        registry.record_retry_attempt(&missing);

        let fake = Arc::new(FakeController::new());
        fake.seed("virtualservice", owned_vs(&in_sync, &payload_checksum(&json!({}))));

        let config = config(None);
        let cache = Arc::new(RemoteCache::new(fake, &config));
        let (publisher, published) = recording_publisher();
        let syncer = FullSyncer::new(&config, Arc::clone(&registry), cache, Arc::new(publisher));

        syncer.full_sync().await.unwrap();
        assert_eq!(*published.lock(), vec![missing.clone()]);
        assert_eq!(registry.retry_attempts(&missing), 0);
    }

    /// Story: an object changed behind the pipeline's back is republished
    /// even though the model still has remote objects
    #[tokio::test]
    async fn story_stale_remote_checksum_is_republished() {
        let registry = Arc::new(ModelRegistry::new());
        let model = add_model(&registry, "team-a");

        let fake = Arc::new(FakeController::new());
        fake.seed("virtualservice", owned_vs(&model, "edited-out-of-band"));

        let config = config(None);
        let cache = Arc::new(RemoteCache::new(fake, &config));
        let (publisher, published) = recording_publisher();
        let syncer = FullSyncer::new(&config, registry, cache, Arc::new(publisher));

        syncer.full_sync().await.unwrap();
        assert_eq!(*published.lock(), vec![model]);
    }

    /// Story: objects of a model deleted while the process was down are
    /// found through the cache and their model is published for teardown
    #[tokio::test]
    async fn story_orphaned_remote_objects_are_published() {
        let registry = Arc::new(ModelRegistry::new());
        let gone = ModelName::new("admin", "c1--team-a-gone");
        let other_ns = ModelName::new("admin", "c1--team-b-gone");

        let fake = Arc::new(FakeController::new());
        fake.seed("virtualservice", owned_vs(&gone, "abc"));
        fake.seed("virtualservice", owned_vs(&other_ns, "abc"));
        let mut foreign = owned_vs(&ModelName::new("admin", "c1--team-a-foreign"), "abc");
        foreign["created_by"] = json!("someone-else");
        fake.seed("virtualservice", foreign);

        let config = config(Some("team-a"));
        let cache = Arc::new(RemoteCache::new(fake, &config));
        let (publisher, published) = recording_publisher();
        let syncer = FullSyncer::new(&config, Arc::clone(&registry), cache, Arc::new(publisher));

        syncer.full_sync().await.unwrap();
        assert_eq!(*published.lock(), vec![gone]);
        assert!(registry.is_empty(), "full sync does not create models");
    }

    #[tokio::test]
    async fn emptied_models_with_remote_objects_are_published() {
        let registry = Arc::new(ModelRegistry::new());
        let name = ModelName::new("admin", "c1--team-a-edge");
        registry.get_or_create(&name);

        let fake = Arc::new(FakeController::new());
        fake.seed(
            "virtualservice",
            json!({
                "name": name.name(),
                "created_by": "lbsync-c1",
                "markers": [{"key": "model", "values": [name.as_str()]}],
            }),
        );

        let config = config(None);
        let cache = Arc::new(RemoteCache::new(fake, &config));
        let (publisher, published) = recording_publisher();
        let syncer = FullSyncer::new(&config, registry, cache, Arc::new(publisher));

        syncer.full_sync().await.unwrap();
        assert_eq!(*published.lock(), vec![name]);
    }

    #[tokio::test]
    async fn cache_failure_aborts_full_sync() {
        let fake = Arc::new(FakeController::new());
        fake.fail_next_get(crate::rest::RemoteError::new(503, "down"));
        let config = config(None);
        let cache = Arc::new(RemoteCache::new(fake, &config));
        let syncer = FullSyncer::new(
            &config,
            Arc::new(ModelRegistry::new()),
            cache,
            Arc::new(MockModelPublisher::new()),
        );

        let err = syncer.full_sync().await.unwrap_err();
        assert!(matches!(err, Error::Cache { .. }));
    }

    /// Story: quick-sync requests run the full sync and coalesce while pending
    #[tokio::test]
    async fn story_quick_sync_runs_full_sync() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let mut syncer = MockFullSync::new();
        syncer.expect_full_sync().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let token = CancellationToken::new();
        let (scheduler, quick) = SyncScheduler::new(None, Arc::new(syncer), token.clone());
        assert!(quick.trigger());
        assert!(quick.trigger(), "second request coalesces");

        let handle = tokio::spawn(scheduler.run());
        for _ in 0..200 {
            if runs.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        token.cancel();
        handle.await.unwrap();
        assert!(!quick.trigger(), "stopped scheduler refuses requests");
    }

    #[tokio::test]
    async fn periodic_timer_triggers_full_sync() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let mut syncer = MockFullSync::new();
        syncer.expect_full_sync().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::cache("virtualservice", "transient"))
        });

        let token = CancellationToken::new();
        let (scheduler, _quick) = SyncScheduler::new(
            Some(Duration::from_millis(10)),
            Arc::new(syncer),
            token.clone(),
        );
        let handle = tokio::spawn(scheduler.run());

        for _ in 0..200 {
            if runs.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(runs.load(Ordering::SeqCst) >= 2, "errors do not stop the loop");

        token.cancel();
        handle.await.unwrap();
    }
}
