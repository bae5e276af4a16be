//! In-memory remote controller for tests
//!
//! Implements [`RemoteClient`] with paginated collection reads, scripted
//! failures and a log of every call, so pipeline behavior can be asserted
//! end to end without a network.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use crate::rest::{RemoteClient, RemoteError, RestMethod, RestOp};

/// One call observed by the fake
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RecordedCall {
    pub method: RestMethod,
    pub path: String,
    pub tenant: String,
}

struct ScriptedFailure {
    method: Option<RestMethod>,
    error: RemoteError,
}

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<String, BTreeMap<String, Value>>,
    next_id: u64,
    failures: VecDeque<ScriptedFailure>,
    get_failures: VecDeque<RemoteError>,
    forbidden_tenants: HashSet<String>,
    calls: Vec<RecordedCall>,
}

pub(crate) struct FakeController {
    state: Mutex<FakeState>,
    page_size: usize,
}

impl Default for FakeController {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeController {
    pub fn new() -> Self {
        Self::with_page_size(2)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            page_size: page_size.max(1),
        }
    }

    /// Insert an object directly, returning its uuid
    pub fn seed(&self, kind: &str, object: Value) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        let uuid = object
            .get("uuid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{kind}-{}", state.next_id));
        let mut object = object;
        if let Some(map) = object.as_object_mut() {
            map.insert("uuid".to_string(), json!(uuid));
        }
        state
            .objects
            .entry(kind.to_string())
            .or_default()
            .insert(uuid.clone(), object);
        uuid
    }

    /// Remove an object behind the pipeline's back
    pub fn remove_named(&self, kind: &str, name: &str) {
        let mut state = self.state.lock();
        if let Some(objects) = state.objects.get_mut(kind) {
            objects.retain(|_, o| o.get("name").and_then(Value::as_str) != Some(name));
        }
    }

    /// Fail the next write (optionally only of one method)
    pub fn fail_next(&self, method: Option<RestMethod>, error: RemoteError) {
        self.fail_times(1, method, error);
    }

    pub fn fail_times(&self, times: usize, method: Option<RestMethod>, error: RemoteError) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state.failures.push_back(ScriptedFailure {
                method,
                error: error.clone(),
            });
        }
    }

    pub fn fail_next_get(&self, error: RemoteError) {
        self.state.lock().get_failures.push_back(error);
    }

    /// Reject every write under `tenant` with 403
    pub fn forbid_tenant(&self, tenant: &str) {
        self.state.lock().forbidden_tenants.insert(tenant.to_string());
    }

    pub fn objects(&self, kind: &str) -> Vec<Value> {
        self.state
            .lock()
            .objects
            .get(kind)
            .map(|o| o.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn object_named(&self, kind: &str, name: &str) -> Option<Value> {
        self.objects(kind)
            .into_iter()
            .find(|o| o.get("name").and_then(Value::as_str) == Some(name))
    }

    /// Every non-GET call, in order
    pub fn writes(&self) -> Vec<RecordedCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.method != RestMethod::Get)
            .cloned()
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.writes().len()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

fn parse_path(path: &str) -> (String, Option<String>, HashMap<String, String>) {
    let trimmed = path.strip_prefix("/api/").unwrap_or(path);
    let (resource, query) = trimmed.split_once('?').unwrap_or((trimmed, ""));
    let mut segments = resource.trim_matches('/').split('/');
    let kind = segments.next().unwrap_or_default().to_string();
    let uuid = segments.next().filter(|s| !s.is_empty()).map(str::to_string);
    let params = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    (kind, uuid, params)
}

fn not_found() -> RemoteError {
    RemoteError::new(404, "Object not found")
}

#[async_trait]
impl RemoteClient for FakeController {
    async fn execute(&self, op: &RestOp) -> Result<Value, RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(RecordedCall {
            method: op.method,
            path: op.path.clone(),
            tenant: op.tenant.clone(),
        });

        if state.forbidden_tenants.contains(&op.tenant) {
            return Err(RemoteError::new(403, "Forbidden"));
        }
        let matches = state
            .failures
            .front()
            .map(|f| f.method.map_or(true, |m| m == op.method))
            .unwrap_or(false);
        if matches {
            if let Some(failure) = state.failures.pop_front() {
                return Err(failure.error);
            }
        }

        let (kind, uuid, _) = parse_path(&op.path);
        match op.method {
            RestMethod::Post => {
                state.next_id += 1;
                let uuid = format!("{kind}-{}", state.next_id);
                let mut object = op.payload.clone().unwrap_or_else(|| json!({}));
                if let Some(map) = object.as_object_mut() {
                    map.insert("uuid".to_string(), json!(uuid));
                    map.insert("_last_modified".to_string(), json!(state.next_id.to_string()));
                    map.entry("tenant").or_insert_with(|| json!(op.tenant));
                }
                state
                    .objects
                    .entry(kind)
                    .or_default()
                    .insert(uuid, object.clone());
                Ok(object)
            }
            RestMethod::Put => {
                let uuid = uuid.ok_or_else(not_found)?;
                state.next_id += 1;
                let version = state.next_id.to_string();
                let objects = state.objects.entry(kind).or_default();
                let existing = objects.get_mut(&uuid).ok_or_else(not_found)?;
                let mut object = op.payload.clone().unwrap_or_else(|| json!({}));
                if let Some(map) = object.as_object_mut() {
                    map.insert("uuid".to_string(), json!(uuid));
                    map.insert("_last_modified".to_string(), json!(version));
                    if let Some(tenant) = existing.get("tenant") {
                        map.entry("tenant").or_insert_with(|| tenant.clone());
                    }
                }
                *existing = object.clone();
                Ok(object)
            }
            RestMethod::Delete => {
                let uuid = uuid.ok_or_else(not_found)?;
                state
                    .objects
                    .get_mut(&kind)
                    .and_then(|o| o.remove(&uuid))
                    .map(|_| Value::Null)
                    .ok_or_else(not_found)
            }
            RestMethod::Get => Err(RemoteError::new(405, "use get()")),
        }
    }

    async fn get(&self, path: &str, tenant: &str) -> Result<Value, RemoteError> {
        let mut state = self.state.lock();
        state.calls.push(RecordedCall {
            method: RestMethod::Get,
            path: path.to_string(),
            tenant: tenant.to_string(),
        });
        if let Some(error) = state.get_failures.pop_front() {
            return Err(error);
        }

        let (kind, _, params) = parse_path(path);
        let page: usize = params
            .get("page")
            .and_then(|p| p.parse().ok())
            .unwrap_or(1)
            .max(1);
        let name_filter = params.get("name");

        let matching: Vec<Value> = state
            .objects
            .get(&kind)
            .map(|objects| {
                objects
                    .values()
                    .filter(|o| match name_filter {
                        Some(name) => o.get("name").and_then(Value::as_str) == Some(name.as_str()),
                        None => true,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let start = (page - 1) * self.page_size;
        let results: Vec<Value> = matching
            .iter()
            .skip(start)
            .take(self.page_size)
            .cloned()
            .collect();

        let mut body = Map::new();
        body.insert("count".to_string(), json!(matching.len()));
        body.insert("results".to_string(), Value::Array(results));
        if start + self.page_size < matching.len() {
            body.insert(
                "next".to_string(),
                json!(format!("https://fake-controller/api/{kind}?page={}", page + 1)),
            );
        }
        Ok(Value::Object(body))
    }
}
