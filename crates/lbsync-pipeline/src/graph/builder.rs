//! Graph builder: turns change keys into model mutations
//!
//! Resource-specific knowledge lives behind [`GraphTranslator`]; the builder
//! only knows how to apply a translation to the registry, track which models
//! each resource contributes to, and re-trigger every resource that depends
//! on a changed one (e.g. all Gateways referencing a TLS Secret).

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use lbsync_common::{ChangeEvent, ChangeKey, EventOp, Result};

use super::{DesiredNode, ModelName, ModelRegistry};
use crate::queue::{ShardedQueue, WorkHandler};

/// Nodes one resource contributes to one model
#[derive(Clone, Debug, PartialEq)]
pub struct Contribution {
    /// Target model
    pub model: ModelName,
    /// Whether the resource governs the model's lifetime
    pub governs: bool,
    /// Nodes contributed (may be empty)
    pub nodes: Vec<DesiredNode>,
}

/// Result of translating one resource
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Translation {
    /// Per-model contributions
    pub contributions: Vec<Contribution>,
    /// Resources whose changes must re-translate this one
    pub dependencies: Vec<ChangeKey>,
}

/// Resource-specific translation into desired-state nodes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GraphTranslator: Send + Sync {
    /// Translate the current state of the resource behind `key`.
    ///
    /// Returns `None` when the resource no longer exists.
    async fn translate(&self, key: &ChangeKey) -> Result<Option<Translation>>;
}

/// Destination for model names that need synchronization
#[cfg_attr(test, automock)]
pub trait ModelPublisher: Send + Sync {
    /// Request synchronization of a model
    fn publish(&self, model: &ModelName) -> Result<()>;
}

impl ModelPublisher for ShardedQueue<ModelName> {
    fn publish(&self, model: &ModelName) -> Result<()> {
        self.enqueue(model.clone())
    }
}

/// Applies translations to the model registry
pub struct GraphBuilder {
    registry: Arc<ModelRegistry>,
    translator: Arc<dyn GraphTranslator>,
    publisher: Arc<dyn ModelPublisher>,
    /// origin -> models it contributes to
    origin_models: DashMap<ChangeKey, BTreeSet<ModelName>>,
    /// origin -> resources it depends on
    dependencies: DashMap<ChangeKey, Vec<ChangeKey>>,
    /// dependency -> origins that reference it
    dependents: DashMap<ChangeKey, BTreeSet<ChangeKey>>,
    /// latest event per key waiting in the ingestion queue
    pending: DashMap<ChangeKey, ChangeEvent>,
}

impl GraphBuilder {
    /// Create a builder over a registry
    pub fn new(
        registry: Arc<ModelRegistry>,
        translator: Arc<dyn GraphTranslator>,
        publisher: Arc<dyn ModelPublisher>,
    ) -> Self {
        Self {
            registry,
            translator,
            publisher,
            origin_models: DashMap::new(),
            dependencies: DashMap::new(),
            dependents: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Remember the latest event for a key before it is queued.
    ///
    /// The ingestion queue coalesces keys, so only the newest operation and
    /// generation for a key are kept.
    pub fn record(&self, event: ChangeEvent) {
        self.pending.insert(event.key.clone(), event);
    }

    /// Apply one change and publish every model it touched.
    ///
    /// Resources that depend on the changed one are re-translated as well.
    /// If any of them fails, the first error is returned after the rest have
    /// been processed, so a requeue of the original key retries them all.
    pub async fn process(&self, event: &ChangeEvent) -> Result<()> {
        debug!(key = %event.key, op = %event.op, "processing change");

        let touched = self.apply(event).await?;
        self.publish(&touched)?;

        let mut first_error = None;
        let mut visited: HashSet<ChangeKey> = HashSet::from([event.key.clone()]);
        let mut work: VecDeque<ChangeKey> = self.dependents_of(&event.key).into();

        while let Some(dependent) = work.pop_front() {
            if !visited.insert(dependent.clone()) {
                continue;
            }
            debug!(key = %dependent, dependency = %event.key, "re-translating dependent");

            let retranslate = ChangeEvent::new(EventOp::Update, dependent.clone());
            match self.apply(&retranslate).await {
                Ok(models) => self.publish(&models)?,
                Err(e) => {
                    warn!(key = %dependent, dependency = %event.key, error = %e, "dependent translation failed");
                    first_error.get_or_insert(e);
                }
            }
            work.extend(self.dependents_of(&dependent));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Models that reference `dependency` through any contributing resource
    pub fn models_referencing(&self, dependency: &ChangeKey) -> Vec<ModelName> {
        let mut models = BTreeSet::new();
        for origin in self.dependents_of(dependency) {
            if let Some(set) = self.origin_models.get(&origin) {
                models.extend(set.iter().cloned());
            }
        }
        models.into_iter().collect()
    }

    /// Models a resource currently contributes to
    pub fn models_of(&self, origin: &ChangeKey) -> Vec<ModelName> {
        self.origin_models
            .get(origin)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<BTreeSet<ModelName>> {
        if event.op == EventOp::Delete {
            return Ok(self.remove_key(&event.key));
        }
        match self.translator.translate(&event.key).await? {
            Some(translation) => Ok(self.apply_translation(event, translation)),
            None => {
                debug!(key = %event.key, "resource no longer exists");
                Ok(self.remove_key(&event.key))
            }
        }
    }

    fn apply_translation(
        &self,
        event: &ChangeEvent,
        translation: Translation,
    ) -> BTreeSet<ModelName> {
        let key = &event.key;
        let mut touched = BTreeSet::new();
        let current: BTreeSet<ModelName> = translation
            .contributions
            .iter()
            .map(|c| c.model.clone())
            .collect();

        for contribution in translation.contributions {
            let entry = self.registry.get_or_create(&contribution.model);
            let changed = entry.write().upsert_contribution(
                key,
                event.generation,
                contribution.nodes,
                contribution.governs,
            );
            debug!(key = %key, model = %contribution.model, changed, "applied contribution");
            touched.insert(contribution.model);
        }

        let previous = self.models_of(key);
        for model in previous.into_iter().filter(|m| !current.contains(m)) {
            if let Some(entry) = self.registry.get(&model) {
                entry.write().remove_origin(key);
            }
            debug!(key = %key, model = %model, "resource no longer contributes to model");
            touched.insert(model);
        }

        if current.is_empty() {
            self.origin_models.remove(key);
        } else {
            self.origin_models.insert(key.clone(), current);
        }
        self.set_dependencies(key, translation.dependencies);

        touched
    }

    fn remove_key(&self, key: &ChangeKey) -> BTreeSet<ModelName> {
        let models = self
            .origin_models
            .remove(key)
            .map(|(_, set)| set)
            .unwrap_or_default();

        for model in &models {
            if let Some(entry) = self.registry.get(model) {
                let mut graph = entry.write();
                graph.remove_origin(key);
                if graph.is_empty() {
                    debug!(key = %key, model = %model, "model is empty, scheduling remote deletion");
                }
            }
        }
        self.set_dependencies(key, Vec::new());
        models
    }

    fn set_dependencies(&self, origin: &ChangeKey, dependencies: Vec<ChangeKey>) {
        if let Some((_, old)) = self.dependencies.remove(origin) {
            for dependency in old {
                let now_empty = match self.dependents.get_mut(&dependency) {
                    Some(mut set) => {
                        set.remove(origin);
                        set.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.dependents.remove_if(&dependency, |_, set| set.is_empty());
                }
            }
        }

        if dependencies.is_empty() {
            return;
        }
        for dependency in &dependencies {
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .insert(origin.clone());
        }
        self.dependencies.insert(origin.clone(), dependencies);
    }

    fn dependents_of(&self, key: &ChangeKey) -> Vec<ChangeKey> {
        self.dependents
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn publish(&self, models: &BTreeSet<ModelName>) -> Result<()> {
        for model in models {
            // A new change re-opens the retry budget
            self.registry.reset_retry(model);
            self.publisher.publish(model)?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkHandler<ChangeKey> for GraphBuilder {
    async fn handle(&self, key: ChangeKey) -> Result<()> {
        let event = self
            .pending
            .remove(&key)
            .map(|(_, event)| event)
            .unwrap_or_else(|| ChangeEvent::new(EventOp::Update, key.clone()));

        let result = self.process(&event).await;
        if result.is_err() {
            // Keep the operation for the requeued attempt unless a newer one arrived
            self.pending.entry(key).or_insert(event);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeId;
    use lbsync_common::{Error, ResourceType};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<ModelName>>,
    }

    impl RecordingPublisher {
        fn take(&self) -> Vec<ModelName> {
            std::mem::take(&mut *self.published.lock())
        }
    }

    impl ModelPublisher for RecordingPublisher {
        fn publish(&self, model: &ModelName) -> Result<()> {
            self.published.lock().push(model.clone());
            Ok(())
        }
    }

    fn gateway() -> ChangeKey {
        ChangeKey::new(ResourceType::Gateway, "team-a", "edge")
    }

    fn route() -> ChangeKey {
        ChangeKey::new(ResourceType::HttpRoute, "team-a", "checkout")
    }

    fn secret() -> ChangeKey {
        ChangeKey::new(ResourceType::Secret, "team-a", "tls")
    }

    fn model() -> ModelName {
        ModelName::new("admin", "c1--team-a-edge")
    }

    fn vs() -> NodeId {
        NodeId::new("virtualservice", "c1--team-a-edge")
    }

    fn gateway_translation() -> Translation {
        Translation {
            contributions: vec![Contribution {
                model: model(),
                governs: true,
                nodes: vec![DesiredNode::root(vs(), json!({"port": 443}))],
            }],
            dependencies: vec![secret()],
        }
    }

    fn route_translation(target: ModelName) -> Translation {
        Translation {
            contributions: vec![Contribution {
                model: target,
                governs: false,
                nodes: vec![DesiredNode::child(
                    NodeId::new("pool", "c1--team-a-checkout-80"),
                    vs(),
                    json!({"port": 80}),
                )],
            }],
            dependencies: vec![gateway()],
        }
    }

    fn builder(
        translator: MockGraphTranslator,
    ) -> (GraphBuilder, Arc<ModelRegistry>, Arc<RecordingPublisher>) {
        let registry = Arc::new(ModelRegistry::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let builder = GraphBuilder::new(
            Arc::clone(&registry),
            Arc::new(translator),
            publisher.clone(),
        );
        (builder, registry, publisher)
    }

    /// Story: a new Gateway creates its model and requests a sync
    #[tokio::test]
    async fn story_new_resource_creates_and_publishes_model() {
        let mut translator = MockGraphTranslator::new();
        translator
            .expect_translate()
            .returning(|_| Ok(Some(gateway_translation())));
        let (builder, registry, publisher) = builder(translator);

        registry.record_retry_attempt(&model());
        builder
            .process(&ChangeEvent::new(EventOp::Add, gateway()).with_generation(Some(3)))
            .await
            .unwrap();

        let graph = registry.snapshot(&model()).unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.governor(), Some(&gateway()));
        assert_eq!(graph.origins().collect::<Vec<_>>(), vec![(&gateway(), Some(3))]);
        assert_eq!(publisher.take(), vec![model()]);
        assert_eq!(registry.retry_attempts(&model()), 0, "new change resets retry budget");
    }

    /// Story: deleting a route removes only its pool from the shared model
    #[tokio::test]
    async fn story_route_deletion_removes_its_subtree() {
        let mut translator = MockGraphTranslator::new();
        translator.expect_translate().returning(|key| {
            if key.resource_type() == &ResourceType::Gateway {
                Ok(Some(gateway_translation()))
            } else {
                Ok(Some(route_translation(model())))
            }
        });
        let (builder, registry, publisher) = builder(translator);

        builder.process(&ChangeEvent::new(EventOp::Add, gateway())).await.unwrap();
        builder.process(&ChangeEvent::new(EventOp::Add, route())).await.unwrap();
        assert_eq!(registry.snapshot(&model()).unwrap().len(), 2);
        publisher.take();

        builder.process(&ChangeEvent::new(EventOp::Delete, route())).await.unwrap();

        let graph = registry.snapshot(&model()).unwrap();
        assert_eq!(graph.len(), 1);
        assert!(graph.get(&vs()).is_some());
        assert_eq!(publisher.take(), vec![model()]);
        assert!(builder.models_of(&route()).is_empty());
    }

    /// Story: deleting the governing Gateway empties the model but keeps it
    /// registered so the remote objects get deleted
    #[tokio::test]
    async fn story_governor_deletion_schedules_remote_delete() {
        let mut translator = MockGraphTranslator::new();
        translator
            .expect_translate()
            .returning(|_| Ok(Some(gateway_translation())));
        let (builder, registry, publisher) = builder(translator);

        builder.process(&ChangeEvent::new(EventOp::Add, gateway())).await.unwrap();
        publisher.take();

        builder.process(&ChangeEvent::new(EventOp::Delete, gateway())).await.unwrap();

        let graph = registry.snapshot(&model()).unwrap();
        assert!(graph.is_empty());
        assert_eq!(publisher.take(), vec![model()]);
        assert!(builder.models_referencing(&secret()).is_empty());
    }

    #[tokio::test]
    async fn missing_resource_is_treated_as_deleted() {
        let mut translator = MockGraphTranslator::new();
        let mut exists = true;
        translator.expect_translate().returning(move |_| {
            let result = if exists { Some(gateway_translation()) } else { None };
            exists = false;
            Ok(result)
        });
        let (builder, registry, _publisher) = builder(translator);

        builder.process(&ChangeEvent::new(EventOp::Add, gateway())).await.unwrap();
        builder.process(&ChangeEvent::new(EventOp::Update, gateway())).await.unwrap();

        assert!(registry.snapshot(&model()).unwrap().is_empty());
    }

    /// Story: a Secret change re-translates every Gateway that references it
    #[tokio::test]
    async fn story_dependency_change_retriggers_dependents() {
        let mut translator = MockGraphTranslator::new();
        translator
            .expect_translate()
            .withf(|key| key == &gateway())
            .times(2)
            .returning(|_| Ok(Some(gateway_translation())));
        translator
            .expect_translate()
            .withf(|key| key == &secret())
            .times(1)
            .returning(|_| Ok(Some(Translation::default())));
        let (builder, _registry, publisher) = builder(translator);

        builder.process(&ChangeEvent::new(EventOp::Add, gateway())).await.unwrap();
        assert_eq!(builder.models_referencing(&secret()), vec![model()]);
        publisher.take();

        builder.process(&ChangeEvent::new(EventOp::Update, secret())).await.unwrap();
        assert_eq!(publisher.take(), vec![model()]);
    }

    #[tokio::test]
    async fn moving_a_route_to_another_model_touches_both() {
        let other = ModelName::new("admin", "c1--team-a-other");
        let mut translator = MockGraphTranslator::new();
        let mut calls = 0;
        let target_other = other.clone();
        translator.expect_translate().returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(Some(route_translation(model())))
            } else {
                Ok(Some(route_translation(target_other.clone())))
            }
        });
        let (builder, registry, publisher) = builder(translator);

        builder.process(&ChangeEvent::new(EventOp::Add, route())).await.unwrap();
        publisher.take();
        builder.process(&ChangeEvent::new(EventOp::Update, route())).await.unwrap();

        assert!(registry.snapshot(&model()).unwrap().is_empty());
        assert_eq!(registry.snapshot(&other).unwrap().len(), 1);
        let mut published = publisher.take();
        published.sort();
        let mut expected = vec![model(), other];
        expected.sort();
        assert_eq!(published, expected);
    }

    #[tokio::test]
    async fn handler_uses_recorded_operation_and_keeps_it_on_failure() {
        let mut translator = MockGraphTranslator::new();
        translator
            .expect_translate()
            .times(1)
            .returning(|key| Err(Error::translation(key, "listener port missing")));
        let (builder, _registry, publisher) = builder(translator);

        builder.record(ChangeEvent::new(EventOp::Update, gateway()).with_generation(Some(7)));
        let err = builder.handle(gateway()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(publisher.take().is_empty());

        // The retained event is still pending for the next attempt
        assert_eq!(
            builder.pending.get(&gateway()).map(|e| e.generation),
            Some(Some(7))
        );

        // A Delete never consults the translator
        builder.record(ChangeEvent::new(EventOp::Delete, gateway()));
        builder.handle(gateway()).await.unwrap();
    }
}
