//! Change keys: the unit of work flowing through every pipeline queue
//!
//! A [`ChangeKey`] identifies one changed resource. Its string form is part of
//! the external contract and is relied on by string splitting downstream:
//!
//! - namespaced resources: `<ResourceType>/<Namespace>/<Name>`
//! - flat (cluster-scoped) resources: `<ResourceType>/<Name>`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Kind of resource a change key refers to
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    /// Gateway API Gateway
    Gateway,
    /// Gateway API GatewayClass (cluster-scoped)
    GatewayClass,
    /// Gateway API HTTPRoute
    HttpRoute,
    /// Core Service
    Service,
    /// Core Endpoints
    Endpoints,
    /// Core Secret
    Secret,
    /// Core Namespace (cluster-scoped)
    Namespace,
    /// Core Node (cluster-scoped)
    Node,
    /// Networking Ingress
    Ingress,
    /// Any other custom resource, by its kind name
    Other(String),
}

impl ResourceType {
    /// Wire name of this resource type
    pub fn as_str(&self) -> &str {
        match self {
            ResourceType::Gateway => "Gateway",
            ResourceType::GatewayClass => "GatewayClass",
            ResourceType::HttpRoute => "HTTPRoute",
            ResourceType::Service => "Service",
            ResourceType::Endpoints => "Endpoints",
            ResourceType::Secret => "Secret",
            ResourceType::Namespace => "Namespace",
            ResourceType::Node => "Node",
            ResourceType::Ingress => "Ingress",
            ResourceType::Other(kind) => kind,
        }
    }

    /// Whether resources of this type live outside any namespace
    pub fn is_cluster_scoped(&self) -> bool {
        matches!(
            self,
            ResourceType::GatewayClass | ResourceType::Namespace | ResourceType::Node
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains('/') {
            return Err(Error::invalid_key(s, "resource type must be non-empty without '/'"));
        }
        Ok(match s {
            "Gateway" => ResourceType::Gateway,
            "GatewayClass" => ResourceType::GatewayClass,
            "HTTPRoute" => ResourceType::HttpRoute,
            "Service" => ResourceType::Service,
            "Endpoints" => ResourceType::Endpoints,
            "Secret" => ResourceType::Secret,
            "Namespace" => ResourceType::Namespace,
            "Node" => ResourceType::Node,
            "Ingress" => ResourceType::Ingress,
            other => ResourceType::Other(other.to_string()),
        })
    }
}

/// Immutable identity of one changed resource
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeKey {
    resource_type: ResourceType,
    namespace: Option<String>,
    name: String,
}

impl ChangeKey {
    /// Key for a namespaced resource
    pub fn new(
        resource_type: ResourceType,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a flat (cluster-scoped) resource
    pub fn flat(resource_type: ResourceType, name: impl Into<String>) -> Self {
        Self {
            resource_type,
            namespace: None,
            name: name.into(),
        }
    }

    /// Resource type of the key
    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    /// Namespace, if the resource is namespaced
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Resource name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value used to pick an ingestion shard.
    ///
    /// Namespaced keys shard by namespace so that every change within one
    /// namespace is handled by the same worker. Flat keys shard by name.
    pub fn shard_key(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.name)
    }
}

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.resource_type, ns, self.name),
            None => write!(f, "{}/{}", self.resource_type, self.name),
        }
    }
}

impl FromStr for ChangeKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(Error::invalid_key(s, "empty segment"));
        }
        match parts.as_slice() {
            [kind, name] => Ok(ChangeKey::flat(kind.parse()?, *name)),
            [kind, ns, name] => Ok(ChangeKey::new(kind.parse()?, *ns, *name)),
            _ => Err(Error::invalid_key(s, "expected 2 or 3 '/'-separated segments")),
        }
    }
}

impl Serialize for ChangeKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChangeKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// What happened to the resource behind a key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventOp {
    /// Resource was created
    Add,
    /// Resource was modified
    Update,
    /// Resource was removed
    Delete,
}

impl fmt::Display for EventOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventOp::Add => "ADD",
            EventOp::Update => "UPDATE",
            EventOp::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Uniform message emitted by every event source
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Operation observed on the resource
    pub op: EventOp,
    /// Identity of the resource
    pub key: ChangeKey,
    /// `metadata.generation` at the time of the event, when known
    pub generation: Option<i64>,
}

impl ChangeEvent {
    /// Create an event without generation information
    pub fn new(op: EventOp, key: ChangeKey) -> Self {
        Self {
            op,
            key,
            generation: None,
        }
    }

    /// Attach the observed generation
    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.generation = generation;
        self
    }
}
