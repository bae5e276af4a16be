//! Desired-state object graphs ("models")
//!
//! A model is a named composite of nodes that must exist on the remote
//! controller: typically one parent (a virtual service) and its children
//! (certificates, pools). Several resources may contribute nodes to the same
//! model; every node remembers the change key that contributed it so that a
//! resource deletion removes exactly its own subtree.
//!
//! The resource that *governs* a model (e.g. the Gateway behind a virtual
//! service) owns its lifetime: when the governor goes away the whole graph
//! collapses to empty and the REST layer deletes the remote objects.

mod builder;
mod registry;

pub use builder::{Contribution, GraphBuilder, GraphTranslator, ModelPublisher, Translation};
pub use registry::{ModelEntry, ModelRegistry};

#[cfg(test)]
pub use builder::{MockGraphTranslator, MockModelPublisher};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lbsync_common::{deterministic_hash, ChangeKey, Error};

use crate::queue::Shardable;

/// Name of a model: `<tenant>/<objectName>`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelName(String);

impl ModelName {
    /// Build a model name from its tenant and object name
    pub fn new(tenant: &str, name: &str) -> Self {
        Self(format!("{tenant}/{name}"))
    }

    /// Tenant the model's objects live in
    pub fn tenant(&self) -> &str {
        self.0.split_once('/').map(|(t, _)| t).unwrap_or(&self.0)
    }

    /// Object name part of the model name
    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, n)| n).unwrap_or(&self.0)
    }

    /// Full `<tenant>/<name>` string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ModelName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((tenant, name))
                if !tenant.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(tenant, name))
            }
            _ => Err(Error::invalid_key(s, "model name must be <tenant>/<name>")),
        }
    }
}

impl Serialize for ModelName {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ModelName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// The sync queue shards by the full model name so one model is only ever
// synchronized by one worker.
impl Shardable for ModelName {
    fn shard_key(&self) -> &str {
        &self.0
    }
}

/// Identity of a node: remote object kind plus object name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    /// Remote object kind, e.g. `virtualservice`
    pub kind: String,
    /// Remote object name
    pub name: String,
}

impl NodeId {
    /// Create a node id
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// A node as produced by a translator
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredNode {
    /// Node identity
    pub id: NodeId,
    /// Parent node, if this node is a child
    pub parent: Option<NodeId>,
    /// Opaque desired payload sent to the remote controller
    pub payload: Value,
}

impl DesiredNode {
    /// Create a top-level node
    pub fn root(id: NodeId, payload: Value) -> Self {
        Self {
            id,
            parent: None,
            payload,
        }
    }

    /// Create a child node
    pub fn child(id: NodeId, parent: NodeId, payload: Value) -> Self {
        Self {
            id,
            parent: Some(parent),
            payload,
        }
    }
}

/// A node stored in a model
#[derive(Clone, Debug, PartialEq)]
pub struct ModelNode {
    /// Node identity
    pub id: NodeId,
    /// Parent node, if any
    pub parent: Option<NodeId>,
    /// Desired payload
    pub payload: Value,
    /// Resource that contributed this node
    pub origin: ChangeKey,
    /// Checksum of the payload, stored remotely as `cloud_config_cksum`
    pub checksum: String,
}

/// Checksum of a desired payload.
///
/// `serde_json::Value` keeps object keys sorted, so the rendering is stable.
pub fn payload_checksum(payload: &Value) -> String {
    deterministic_hash(&payload.to_string())
}

/// Named desired-state graph
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectGraph {
    name: ModelName,
    nodes: BTreeMap<NodeId, ModelNode>,
    origins: BTreeMap<ChangeKey, Option<i64>>,
    governor: Option<ChangeKey>,
}

impl ObjectGraph {
    /// Create an empty graph
    pub fn new(name: ModelName) -> Self {
        Self {
            name,
            nodes: BTreeMap::new(),
            origins: BTreeMap::new(),
            governor: None,
        }
    }

    /// Model name
    pub fn name(&self) -> &ModelName {
        &self.name
    }

    /// Resource that governs the model's lifetime, if known
    pub fn governor(&self) -> Option<&ChangeKey> {
        self.governor.as_ref()
    }

    /// Resources currently contributing to this model, with the generation
    /// last observed for each
    pub fn origins(&self) -> impl Iterator<Item = (&ChangeKey, Option<i64>)> {
        self.origins.iter().map(|(k, g)| (k, *g))
    }

    /// Look up a node
    pub fn get(&self, id: &NodeId) -> Option<&ModelNode> {
        self.nodes.get(id)
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes (remote objects should be deleted)
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Replace everything `origin` contributes with `nodes`.
    ///
    /// A `None` generation keeps the previously observed one. Returns whether
    /// the graph content changed.
    pub fn upsert_contribution(
        &mut self,
        origin: &ChangeKey,
        generation: Option<i64>,
        nodes: Vec<DesiredNode>,
        governs: bool,
    ) -> bool {
        let before = self.checksum();

        self.nodes.retain(|_, node| &node.origin != origin);
        for node in nodes {
            let checksum = payload_checksum(&node.payload);
            if let Some(existing) = self.nodes.get(&node.id) {
                tracing::warn!(
                    model = %self.name,
                    node = %node.id,
                    previous_origin = %existing.origin,
                    origin = %origin,
                    "node contributed by two resources, latest wins"
                );
            }
            self.nodes.insert(
                node.id.clone(),
                ModelNode {
                    id: node.id,
                    parent: node.parent,
                    payload: node.payload,
                    origin: origin.clone(),
                    checksum,
                },
            );
        }

        let slot = self.origins.entry(origin.clone()).or_insert(None);
        if generation.is_some() {
            *slot = generation;
        }
        if governs {
            self.governor = Some(origin.clone());
        }

        before != self.checksum()
    }

    /// Drop everything `origin` contributed.
    ///
    /// Removing the governor collapses the whole graph. Returns whether
    /// anything was removed.
    pub fn remove_origin(&mut self, origin: &ChangeKey) -> bool {
        if self.governor.as_ref() == Some(origin) {
            let had_content = !self.nodes.is_empty() || !self.origins.is_empty();
            self.clear();
            return had_content;
        }

        let count = self.nodes.len();
        self.nodes.retain(|_, node| &node.origin != origin);
        let had_origin = self.origins.remove(origin).is_some();
        had_origin || count != self.nodes.len()
    }

    /// Remove every node and origin
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.origins.clear();
        self.governor = None;
    }

    /// Nodes ordered parents before children.
    ///
    /// A node whose parent is not in the graph is treated as a root. Ties are
    /// broken by node id so the order is deterministic.
    pub fn ordered_nodes(&self) -> Vec<&ModelNode> {
        let mut depths: HashMap<&NodeId, usize> = HashMap::with_capacity(self.nodes.len());
        for id in self.nodes.keys() {
            let mut depth = 0;
            let mut cursor = self.nodes.get(id).and_then(|n| n.parent.as_ref());
            // Bounded by the node count so a parent cycle cannot loop forever
            while let Some(parent) = cursor {
                if depth >= self.nodes.len() {
                    break;
                }
                match self.nodes.get(parent) {
                    Some(node) => {
                        depth += 1;
                        cursor = node.parent.as_ref();
                    }
                    None => break,
                }
            }
            depths.insert(id, depth);
        }

        let mut ordered: Vec<&ModelNode> = self.nodes.values().collect();
        ordered.sort_by(|a, b| {
            let da = depths.get(&a.id).copied().unwrap_or(0);
            let db = depths.get(&b.id).copied().unwrap_or(0);
            da.cmp(&db).then_with(|| a.id.cmp(&b.id))
        });
        ordered
    }

    /// Checksum over every node and its payload checksum
    pub fn checksum(&self) -> String {
        let mut input = String::new();
        for node in self.nodes.values() {
            input.push_str(&node.id.to_string());
            input.push('=');
            input.push_str(&node.checksum);
            input.push(';');
        }
        deterministic_hash(&input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lbsync_common::ResourceType;
    use serde_json::json;

    fn gateway() -> ChangeKey {
        ChangeKey::new(ResourceType::Gateway, "team-a", "edge")
    }

    fn route() -> ChangeKey {
        ChangeKey::new(ResourceType::HttpRoute, "team-a", "checkout")
    }

    fn vs() -> NodeId {
        NodeId::new("virtualservice", "c1--team-a-edge")
    }

    fn graph() -> ObjectGraph {
        ObjectGraph::new(ModelName::new("admin", "c1--team-a-edge"))
    }

    #[test]
    fn model_name_parts() {
        let name: ModelName = "admin/c1--team-a-edge".parse().unwrap();
        assert_eq!(name.tenant(), "admin");
        assert_eq!(name.name(), "c1--team-a-edge");
        assert_eq!(name.to_string(), "admin/c1--team-a-edge");
        assert!("no-tenant".parse::<ModelName>().is_err());
        assert!("a/b/c".parse::<ModelName>().is_err());
    }

    #[test]
    fn upsert_replaces_previous_contribution() {
        let mut g = graph();
        assert!(g.upsert_contribution(
            &gateway(),
            Some(1),
            vec![DesiredNode::root(vs(), json!({"port": 80}))],
            true,
        ));
        assert!(!g.upsert_contribution(
            &gateway(),
            None,
            vec![DesiredNode::root(vs(), json!({"port": 80}))],
            true,
        ));
        assert!(g.upsert_contribution(
            &gateway(),
            Some(2),
            vec![DesiredNode::root(vs(), json!({"port": 443}))],
            true,
        ));

        assert_eq!(g.len(), 1);
        assert_eq!(g.get(&vs()).unwrap().payload, json!({"port": 443}));
        assert_eq!(g.origins().collect::<Vec<_>>(), vec![(&gateway(), Some(2))]);
    }

    #[test]
    fn removing_a_contributor_drops_only_its_subtree() {
        let mut g = graph();
        g.upsert_contribution(&gateway(), None, vec![DesiredNode::root(vs(), json!({}))], true);
        g.upsert_contribution(
            &route(),
            None,
            vec![DesiredNode::child(
                NodeId::new("pool", "c1--team-a-checkout-80"),
                vs(),
                json!({"port": 80}),
            )],
            false,
        );
        assert_eq!(g.len(), 2);

        assert!(g.remove_origin(&route()));
        assert_eq!(g.len(), 1);
        assert!(g.get(&vs()).is_some());
        assert!(!g.remove_origin(&route()));
    }

    #[test]
    fn removing_the_governor_collapses_the_graph() {
        let mut g = graph();
        g.upsert_contribution(&gateway(), None, vec![DesiredNode::root(vs(), json!({}))], true);
        g.upsert_contribution(
            &route(),
            None,
            vec![DesiredNode::child(NodeId::new("pool", "p"), vs(), json!({}))],
            false,
        );

        assert!(g.remove_origin(&gateway()));
        assert!(g.is_empty());
        assert_eq!(g.origins().count(), 0);
        assert!(g.governor().is_none());
    }

    #[test]
    fn ordered_nodes_put_parents_first() {
        let mut g = graph();
        let cert = NodeId::new("sslkeyandcertificate", "c1--team-a-tls");
        let pool = NodeId::new("pool", "c1--team-a-a");
        g.upsert_contribution(
            &route(),
            None,
            vec![DesiredNode::child(pool.clone(), vs(), json!({}))],
            false,
        );
        g.upsert_contribution(
            &gateway(),
            None,
            vec![
                DesiredNode::child(cert.clone(), vs(), json!({})),
                DesiredNode::root(vs(), json!({})),
            ],
            true,
        );

        let order: Vec<&NodeId> = g.ordered_nodes().into_iter().map(|n| &n.id).collect();
        assert_eq!(order[0], &vs());
        assert!(order.contains(&&pool));
        assert!(order.contains(&&cert));
    }

    #[test]
    fn parent_cycles_do_not_hang_ordering() {
        let mut g = graph();
        let a = NodeId::new("pool", "a");
        let b = NodeId::new("pool", "b");
        g.upsert_contribution(
            &route(),
            None,
            vec![
                DesiredNode::child(a.clone(), b.clone(), json!({})),
                DesiredNode::child(b, a, json!({})),
            ],
            false,
        );
        assert_eq!(g.ordered_nodes().len(), 2);
    }

    #[test]
    fn checksum_tracks_payloads() {
        let mut a = graph();
        let mut b = graph();
        a.upsert_contribution(&gateway(), None, vec![DesiredNode::root(vs(), json!({"x": 1}))], true);
        b.upsert_contribution(&gateway(), None, vec![DesiredNode::root(vs(), json!({"x": 1}))], true);
        assert_eq!(a.checksum(), b.checksum());

        b.upsert_contribution(&gateway(), None, vec![DesiredNode::root(vs(), json!({"x": 2}))], true);
        assert_ne!(a.checksum(), b.checksum());
    }
}
