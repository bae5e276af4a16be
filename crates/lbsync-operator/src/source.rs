//! Kubernetes watch event source
//!
//! Watches Gateways, HTTPRoutes and Secrets and turns every watcher event
//! into a [`ChangeEvent`]. Objects listed during the initial (re)list arrive
//! as `Add`; later changes arrive as `Update`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ApiResource, DynamicObject};
use kube::runtime::watcher::{self, Event};
use kube::{Client, Resource, ResourceExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lbsync_common::{ChangeEvent, ChangeKey, EventOp, ResourceType, Result};
use lbsync_pipeline::EventSource;

use crate::gateway::{Gateway, HasApiResource, HttpRoute};

/// Pause after a watcher error before polling the stream again
const WATCH_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Server-side watch timeout, kept below the client's read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Event source backed by Kubernetes watches
pub struct KubeEventSource {
    client: Client,
    namespace: Option<String>,
}

impl KubeEventSource {
    /// Watch every namespace, or only `namespace` when set
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn dynamic_api(&self, ar: &ApiResource) -> Api<DynamicObject> {
        match &self.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }

    fn secret_api(&self) -> Api<Secret> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl EventSource for KubeEventSource {
    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<ChangeEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let config = watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
        let gateways = watcher::watcher(self.dynamic_api(&Gateway::api_resource()), config.clone());
        let routes = watcher::watcher(self.dynamic_api(&HttpRoute::api_resource()), config.clone());
        let secrets = watcher::watcher(self.secret_api(), config);

        let mut gateways = std::pin::pin!(gateways);
        let mut routes = std::pin::pin!(routes);
        let mut secrets = std::pin::pin!(secrets);

        info!(namespace = ?self.namespace, "watching gateway resources");
        loop {
            let (resource_type, event) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(event) = gateways.next() => convert(ResourceType::Gateway, event),
                Some(event) = routes.next() => convert(ResourceType::HttpRoute, event),
                Some(event) = secrets.next() => convert(ResourceType::Secret, event),
                else => break,
            };
            match event {
                Ok(Some(event)) => {
                    if tx.send(event).await.is_err() {
                        debug!("event receiver closed");
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, resource_type = %resource_type.as_str(), "watcher error, will retry");
                    if !backoff(&shutdown, WATCH_ERROR_BACKOFF).await {
                        break;
                    }
                }
            }
        }
        info!("watchers stopped");
        Ok(())
    }
}

type Converted = std::result::Result<Option<ChangeEvent>, watcher::Error>;

fn convert<K>(
    resource_type: ResourceType,
    event: std::result::Result<Event<K>, watcher::Error>,
) -> (ResourceType, Converted)
where
    K: Resource,
{
    let converted = event.map(|e| change_event(resource_type.clone(), e));
    (resource_type, converted)
}

/// Sleep for `delay`. Returns `false` when shutdown was requested first.
async fn backoff(shutdown: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Map a watcher event to a change event; list markers map to nothing
pub fn change_event<K>(resource_type: ResourceType, event: Event<K>) -> Option<ChangeEvent>
where
    K: Resource,
{
    let (op, object) = match event {
        Event::InitApply(object) => (EventOp::Add, object),
        Event::Apply(object) => (EventOp::Update, object),
        Event::Delete(object) => (EventOp::Delete, object),
        Event::Init | Event::InitDone => return None,
    };

    let name = object.name_any();
    let key = match object.namespace() {
        Some(namespace) => ChangeKey::new(resource_type, namespace, name),
        None => ChangeKey::flat(resource_type, name),
    };
    Some(ChangeEvent::new(op, key).with_generation(object.meta().generation))
}
