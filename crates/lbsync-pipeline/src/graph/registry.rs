//! Process-wide model registry
//!
//! Models are created on first reference and removed once an empty model has
//! been synchronized (its remote objects deleted). Each entry carries the
//! retry counter used by the retry queues; full syncs reset every counter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{ModelName, ObjectGraph};

/// One registered model
#[derive(Debug)]
pub struct ModelEntry {
    graph: RwLock<ObjectGraph>,
    retry_attempts: AtomicU32,
}

impl ModelEntry {
    fn new(name: ModelName) -> Self {
        Self {
            graph: RwLock::new(ObjectGraph::new(name)),
            retry_attempts: AtomicU32::new(0),
        }
    }

    /// Read access to the graph
    pub fn read(&self) -> RwLockReadGuard<'_, ObjectGraph> {
        self.graph.read()
    }

    /// Write access to the graph (graph builder only)
    pub fn write(&self) -> RwLockWriteGuard<'_, ObjectGraph> {
        self.graph.write()
    }

    /// Failed synchronizations since the last reset
    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts.load(Ordering::SeqCst)
    }
}

/// Concurrent map of model name to model
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: DashMap<ModelName, Arc<ModelEntry>>,
}

impl ModelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a model, creating an empty one if needed
    pub fn get_or_create(&self, name: &ModelName) -> Arc<ModelEntry> {
        self.models
            .entry(name.clone())
            .or_insert_with(|| Arc::new(ModelEntry::new(name.clone())))
            .clone()
    }

    /// Get a model if it is registered
    pub fn get(&self, name: &ModelName) -> Option<Arc<ModelEntry>> {
        self.models.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Copy of a model's current graph
    pub fn snapshot(&self, name: &ModelName) -> Option<ObjectGraph> {
        self.get(name).map(|entry| entry.read().clone())
    }

    /// Remove a model unconditionally
    pub fn remove(&self, name: &ModelName) -> bool {
        self.models.remove(name).is_some()
    }

    /// Remove a model only if its graph is still empty.
    ///
    /// Guards against deleting a model the graph builder repopulated while
    /// its deletion was being synchronized.
    pub fn remove_if_empty(&self, name: &ModelName) -> bool {
        self.models
            .remove_if(name, |_, entry| entry.read().is_empty())
            .is_some()
    }

    /// Names of every registered model, sorted
    pub fn names(&self) -> Vec<ModelName> {
        let mut names: Vec<ModelName> = self.models.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered models
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether no models are registered
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Reset every model's retry counter
    pub fn reset_retry_counters(&self) {
        for entry in self.models.iter() {
            entry.retry_attempts.store(0, Ordering::SeqCst);
        }
    }

    /// Count one failed synchronization and return the new total.
    ///
    /// Unknown models are registered so that the failure of a model being
    /// deleted is still counted.
    pub fn record_retry_attempt(&self, name: &ModelName) -> u32 {
        self.get_or_create(name)
            .retry_attempts
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    /// Reset one model's retry counter
    pub fn reset_retry(&self, name: &ModelName) {
        if let Some(entry) = self.get(name) {
            entry.retry_attempts.store(0, Ordering::SeqCst);
        }
    }

    /// Current retry counter for a model (0 when unknown)
    pub fn retry_attempts(&self, name: &ModelName) -> u32 {
        self.get(name).map(|e| e.retry_attempts()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DesiredNode, NodeId};
    use lbsync_common::{ChangeKey, ResourceType};
    use serde_json::json;

    fn name(n: &str) -> ModelName {
        ModelName::new("admin", n)
    }

    #[test]
    fn get_or_create_returns_the_same_entry() {
        let registry = ModelRegistry::new();
        let a = registry.get_or_create(&name("m"));
        let b = registry.get_or_create(&name("m"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&name("other")).is_none());
    }

    #[test]
    fn snapshot_is_detached_from_the_registry() {
        let registry = ModelRegistry::new();
        let entry = registry.get_or_create(&name("m"));
        let snap = registry.snapshot(&name("m")).unwrap();

        entry.write().upsert_contribution(
            &ChangeKey::new(ResourceType::Gateway, "ns", "gw"),
            None,
            vec![DesiredNode::root(NodeId::new("virtualservice", "vs"), json!({}))],
            true,
        );

        assert!(snap.is_empty());
        assert_eq!(registry.snapshot(&name("m")).unwrap().len(), 1);
    }

    #[test]
    fn remove_if_empty_keeps_repopulated_models() {
        let registry = ModelRegistry::new();
        let entry = registry.get_or_create(&name("m"));
        entry.write().upsert_contribution(
            &ChangeKey::new(ResourceType::Gateway, "ns", "gw"),
            None,
            vec![DesiredNode::root(NodeId::new("virtualservice", "vs"), json!({}))],
            true,
        );

        assert!(!registry.remove_if_empty(&name("m")));
        entry.write().clear();
        assert!(registry.remove_if_empty(&name("m")));
        assert!(registry.is_empty());
    }

    #[test]
    fn retry_counters_count_and_reset() {
        let registry = ModelRegistry::new();
        assert_eq!(registry.record_retry_attempt(&name("a")), 1);
        assert_eq!(registry.record_retry_attempt(&name("a")), 2);
        assert_eq!(registry.record_retry_attempt(&name("b")), 1);

        registry.reset_retry(&name("a"));
        assert_eq!(registry.retry_attempts(&name("a")), 0);
        assert_eq!(registry.retry_attempts(&name("b")), 1);

        registry.reset_retry_counters();
        assert_eq!(registry.retry_attempts(&name("b")), 0);
    }

    #[test]
    fn names_are_sorted() {
        let registry = ModelRegistry::new();
        registry.get_or_create(&name("b"));
        registry.get_or_create(&name("a"));
        assert_eq!(registry.names(), vec![name("a"), name("b")]);
    }
}
