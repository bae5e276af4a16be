//! Local mirror of the remote controller's object inventory
//!
//! One map per object kind, keyed by `(tenant, name)`. A populate pass scans
//! the kind's collection endpoint page by page and swaps the finished map in
//! with a single insert, so readers never observe a half-built map.
//!
//! The cache is the only source of truth for "does this remote object
//! already exist". The REST layer refreshes every kind it touched after each
//! synchronization attempt, success or failure.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use lbsync_common::{Error, Result, SyncConfig};

use crate::graph::{ModelName, ObjectGraph};
use crate::rest::{RemoteClient, RemoteError};

/// Marker key under which created objects record their owning model
pub const MODEL_MARKER_KEY: &str = "model";

/// Upper bound on pages followed in one scan
const MAX_PAGES: usize = 10_000;

type KindMap = HashMap<(String, String), CacheEntry>;

/// Remote identity of one object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    /// Tenant the object lives in
    pub tenant: String,
    /// Object name
    pub name: String,
    /// Remote identifier
    pub uuid: String,
    /// Remote version (`_last_modified`)
    pub version: Option<String>,
    /// `cloud_config_cksum` written when the object was created or updated
    pub checksum: Option<String>,
    /// `created_by` marker
    pub created_by: Option<String>,
    /// Model recorded in the object's markers
    pub owner_model: Option<ModelName>,
}

impl CacheEntry {
    /// Parse an object from a collection response.
    ///
    /// Objects without a name or uuid are skipped.
    pub fn from_object(object: &Value, default_tenant: &str) -> Option<Self> {
        let str_field = |field: &str| object.get(field).and_then(Value::as_str).map(str::to_string);

        let owner_model = object
            .get("markers")
            .and_then(Value::as_array)
            .and_then(|markers| {
                markers
                    .iter()
                    .find(|m| m.get("key").and_then(Value::as_str) == Some(MODEL_MARKER_KEY))
            })
            .and_then(|m| m.get("values"))
            .and_then(Value::as_array)
            .and_then(|values| values.first())
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok());

        Some(Self {
            tenant: str_field("tenant").unwrap_or_else(|| default_tenant.to_string()),
            name: str_field("name")?,
            uuid: str_field("uuid")?,
            version: str_field("_last_modified"),
            checksum: str_field("cloud_config_cksum"),
            created_by: str_field("created_by"),
            owner_model,
        })
    }
}

/// Convert a transport failure into a cache error.
///
/// Authentication and authorization failures cannot be fixed by retrying.
fn cache_error(kind: &str, e: RemoteError) -> Error {
    if matches!(e.status, 401 | 403) {
        Error::cache_permanent(kind, e.to_string())
    } else {
        Error::cache(kind, e.to_string())
    }
}

/// Turn a `next` link (usually an absolute URI) into a request path
fn next_path(kind: &str, next: &str) -> Result<String> {
    if next.starts_with('/') {
        return Ok(next.to_string());
    }
    next.find("/api/")
        .map(|idx| next[idx..].to_string())
        .ok_or_else(|| Error::cache_permanent(kind, format!("unexpected continuation link '{next}'")))
}

/// Mirror of remote objects for every configured kind
pub struct RemoteCache {
    client: Arc<dyn RemoteClient>,
    tenant: String,
    controller_user: String,
    page_size: u32,
    kinds: Vec<String>,
    objects: DashMap<String, Arc<KindMap>>,
}

impl RemoteCache {
    /// Create an empty cache for the kinds in `config`
    pub fn new(client: Arc<dyn RemoteClient>, config: &SyncConfig) -> Self {
        Self {
            client,
            tenant: config.tenant.clone(),
            controller_user: config.controller_user(),
            page_size: config.page_size,
            kinds: config.object_kinds.clone(),
            objects: DashMap::new(),
        }
    }

    /// Mirrored kinds, parents first
    pub fn kinds(&self) -> &[String] {
        &self.kinds
    }

    /// Scan every page of `kind` and replace its map atomically.
    ///
    /// Returns the number of objects cached.
    pub async fn populate(&self, kind: &str) -> Result<usize> {
        let mut map = KindMap::new();
        let mut path = format!("/api/{kind}?page_size={}", self.page_size);

        for page in 1..=MAX_PAGES {
            let body = self
                .client
                .get(&path, &self.tenant)
                .await
                .map_err(|e| cache_error(kind, e))?;

            if let Some(results) = body.get("results").and_then(Value::as_array) {
                for object in results {
                    if let Some(entry) = CacheEntry::from_object(object, &self.tenant) {
                        map.insert((entry.tenant.clone(), entry.name.clone()), entry);
                    }
                }
            }

            match body.get("next").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => path = next_path(kind, next)?,
                _ => {
                    debug!(kind = %kind, pages = page, objects = map.len(), "cache populated");
                    let count = map.len();
                    self.objects.insert(kind.to_string(), Arc::new(map));
                    return Ok(count);
                }
            }
        }

        Err(Error::cache(
            kind,
            format!("collection did not terminate after {MAX_PAGES} pages"),
        ))
    }

    /// Populate every configured kind
    pub async fn populate_all(&self) -> Result<()> {
        for kind in &self.kinds {
            self.populate(kind).await?;
        }
        Ok(())
    }

    /// Re-scan one kind after a synchronization attempt
    pub async fn refresh(&self, kind: &str) -> Result<()> {
        self.populate(kind).await.map(|_| ())
    }

    /// Cached identity of an object, or `None` on a miss
    pub fn get(&self, kind: &str, tenant: &str, name: &str) -> Option<CacheEntry> {
        self.objects
            .get(kind)
            .and_then(|map| map.get(&(tenant.to_string(), name.to_string())).cloned())
    }

    /// Objects created by this controller for `model`, as `(kind, entry)`
    /// pairs in configured kind order
    pub fn owned_by(&self, model: &ModelName) -> Vec<(String, CacheEntry)> {
        let mut owned = Vec::new();
        for kind in &self.kinds {
            let Some(map) = self.objects.get(kind).map(|m| Arc::clone(m.value())) else {
                continue;
            };
            let mut entries: Vec<&CacheEntry> = map
                .values()
                .filter(|e| {
                    e.owner_model.as_ref() == Some(model)
                        && e.created_by.as_deref() == Some(self.controller_user.as_str())
                })
                .collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            owned.extend(entries.into_iter().map(|e| (kind.clone(), e.clone())));
        }
        owned
    }

    /// Whether any object owned by `model` is present remotely
    pub fn has_model(&self, model: &ModelName) -> bool {
        !self.owned_by(model).is_empty()
    }

    /// Models owning at least one object this controller created
    pub fn owner_models(&self) -> BTreeSet<ModelName> {
        let mut models = BTreeSet::new();
        for kind in &self.kinds {
            let Some(map) = self.objects.get(kind).map(|m| Arc::clone(m.value())) else {
                continue;
            };
            models.extend(
                map.values()
                    .filter(|e| e.created_by.as_deref() == Some(self.controller_user.as_str()))
                    .filter_map(|e| e.owner_model.clone()),
            );
        }
        models
    }

    /// Whether the cached remote objects already match `graph`: every node
    /// exists with its checksum, and nothing else is owned by the model.
    pub fn matches(&self, graph: &ObjectGraph) -> bool {
        let tenant = graph.name().tenant();
        let mut desired = HashSet::new();
        for node in graph.ordered_nodes() {
            match self.get(&node.id.kind, tenant, &node.id.name) {
                Some(entry) if entry.checksum.as_deref() == Some(node.checksum.as_str()) => {}
                _ => return false,
            }
            desired.insert((node.id.kind.as_str(), node.id.name.as_str()));
        }
        self.owned_by(graph.name())
            .iter()
            .all(|(kind, entry)| desired.contains(&(kind.as_str(), entry.name.as_str())))
    }

    /// Drop one object from the cached map
    pub fn evict(&self, kind: &str, tenant: &str, name: &str) {
        if let Some(mut map) = self.objects.get_mut(kind) {
            let key = (tenant.to_string(), name.to_string());
            if map.contains_key(&key) {
                Arc::make_mut(map.value_mut()).remove(&key);
            }
        }
    }

    /// Number of cached objects of a kind
    pub fn len(&self, kind: &str) -> usize {
        self.objects.get(kind).map(|m| m.len()).unwrap_or(0)
    }

    /// Look up a single object by name directly on the controller.
    ///
    /// Anything other than exactly one match is a configuration error.
    pub async fn resolve_unique(&self, kind: &str, name: &str) -> Result<CacheEntry> {
        let path = format!("/api/{kind}/?name={name}");
        let body = self
            .client
            .get(&path, &self.tenant)
            .await
            .map_err(|e| cache_error(kind, e))?;

        let results = body
            .get("results")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        match results {
            [object] => CacheEntry::from_object(object, &self.tenant).ok_or_else(|| {
                Error::config(format!("{kind}/{name}"), "object is missing name or uuid")
            }),
            _ => Err(Error::config(
                format!("{kind}/{name}"),
                format!("expected exactly one {kind} named '{name}', found {}", results.len()),
            )),
        }
    }
}
