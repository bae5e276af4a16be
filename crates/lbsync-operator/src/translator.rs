//! Gateway API translation into desired-state models
//!
//! Every Gateway owns one model named `<tenant>/<cluster>--<namespace>-<gateway>`.
//! The Gateway contributes the virtual service and its TLS certificates;
//! HTTPRoutes attached to it contribute one pool per backend. Secrets
//! contribute nothing themselves but are dependencies of every Gateway that
//! references them, so a rotated certificate re-translates those Gateways.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DynamicObject};
use kube::Client;
use serde_json::{json, Value};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use lbsync_common::{ChangeKey, Error, ResourceType, Result, SyncConfig};
use lbsync_pipeline::{
    Contribution, DesiredNode, GraphTranslator, ModelName, NodeId, Translation,
};

use crate::gateway::{from_dynamic, Gateway, HasApiResource, HttpRoute};

/// Remote object kind of the per-Gateway virtual service
pub const KIND_VIRTUAL_SERVICE: &str = "virtualservice";
/// Remote object kind of TLS certificates
pub const KIND_CERTIFICATE: &str = "sslkeyandcertificate";
/// Remote object kind of backend pools
pub const KIND_POOL: &str = "pool";

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";

/// Read access to the resources the translator needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceReader: Send + Sync {
    /// Fetch a Gateway, `None` if it does not exist
    async fn gateway(&self, namespace: &str, name: &str) -> Result<Option<Gateway>>;
    /// Fetch an HTTPRoute, `None` if it does not exist
    async fn http_route(&self, namespace: &str, name: &str) -> Result<Option<HttpRoute>>;
    /// Fetch a Secret, `None` if it does not exist
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

/// Reader backed by the Kubernetes API
pub struct KubeResourceReader {
    client: Client,
}

impl KubeResourceReader {
    /// Create a reader using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn dynamic(
        &self,
        namespace: &str,
        name: &str,
        ar: &kube::api::ApiResource,
    ) -> Result<Option<DynamicObject>> {
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, ar);
        Ok(api.get_opt(name).await?)
    }
}

#[async_trait]
impl ResourceReader for KubeResourceReader {
    async fn gateway(&self, namespace: &str, name: &str) -> Result<Option<Gateway>> {
        self.dynamic(namespace, name, &Gateway::api_resource())
            .await?
            .map(from_dynamic)
            .transpose()
    }

    async fn http_route(&self, namespace: &str, name: &str) -> Result<Option<HttpRoute>> {
        self.dynamic(namespace, name, &HttpRoute::api_resource())
            .await?
            .map(from_dynamic)
            .transpose()
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Translator for Gateway, HTTPRoute and Secret changes
pub struct GatewayTranslator {
    tenant: String,
    name_prefix: String,
    reader: Arc<dyn ResourceReader>,
}

impl GatewayTranslator {
    /// Create a translator for the configured cluster and tenant
    pub fn new(config: &SyncConfig, reader: Arc<dyn ResourceReader>) -> Self {
        Self {
            tenant: config.tenant.clone(),
            name_prefix: config.name_prefix(),
            reader,
        }
    }

    fn object_name(&self, namespace: &str, name: &str) -> String {
        format!("{}{}-{}", self.name_prefix, namespace, name)
    }

    fn model_for(&self, namespace: &str, gateway: &str) -> ModelName {
        ModelName::new(&self.tenant, &self.object_name(namespace, gateway))
    }

    async fn translate_gateway(&self, namespace: &str, name: &str) -> Result<Option<Translation>> {
        let Some(gateway) = self.reader.gateway(namespace, name).await? else {
            return Ok(None);
        };

        let vs_id = NodeId::new(KIND_VIRTUAL_SERVICE, self.object_name(namespace, name));
        let mut nodes = Vec::new();
        let mut dependencies = Vec::new();
        let mut services = Vec::new();
        let mut domains = Vec::new();

        for listener in &gateway.spec.listeners {
            let tls = listener.tls.as_ref();
            services.push(json!({
                "port": listener.port,
                "enable_ssl": tls.is_some(),
            }));
            if let Some(hostname) = &listener.hostname {
                if !domains.contains(hostname) {
                    domains.push(hostname.clone());
                }
            }

            for cert in tls.iter().flat_map(|t| t.certificate_refs.iter()) {
                if !cert.is_secret() {
                    continue;
                }
                let secret_ns = cert.namespace.as_deref().unwrap_or(namespace);
                let secret_key = ChangeKey::new(ResourceType::Secret, secret_ns, &cert.name);
                if !dependencies.contains(&secret_key) {
                    dependencies.push(secret_key);
                }

                let cert_id = NodeId::new(KIND_CERTIFICATE, self.object_name(secret_ns, &cert.name));
                if nodes.iter().any(|n: &DesiredNode| n.id == cert_id) {
                    continue;
                }
                match self.reader.secret(secret_ns, &cert.name).await? {
                    Some(secret) => match certificate_payload(&secret) {
                        Some(payload) => {
                            nodes.push(DesiredNode::child(cert_id, vs_id.clone(), payload))
                        }
                        None => debug!(
                            namespace = %secret_ns,
                            secret = %cert.name,
                            "secret has no TLS data, skipping certificate"
                        ),
                    },
                    None => debug!(
                        namespace = %secret_ns,
                        secret = %cert.name,
                        "referenced secret not found, skipping certificate"
                    ),
                }
            }
        }

        let ssl_refs: Vec<Value> = nodes
            .iter()
            .map(|n| Value::String(n.id.name.clone()))
            .collect();
        let vs_payload = json!({
            "services": services,
            "vh_domain_name": domains,
            "ssl_key_and_certificate_refs": ssl_refs,
            "gateway_class": gateway.spec.gateway_class_name,
        });
        nodes.insert(0, DesiredNode::root(vs_id, vs_payload));

        Ok(Some(Translation {
            contributions: vec![Contribution {
                model: self.model_for(namespace, name),
                governs: true,
                nodes,
            }],
            dependencies,
        }))
    }

    async fn translate_route(&self, namespace: &str, name: &str) -> Result<Option<Translation>> {
        let Some(route) = self.reader.http_route(namespace, name).await? else {
            return Ok(None);
        };

        let mut translation = Translation::default();
        for parent in route.spec.parent_refs.iter().filter(|p| p.is_gateway()) {
            let gw_ns = parent.namespace.as_deref().unwrap_or(namespace);
            let gw_key = ChangeKey::new(ResourceType::Gateway, gw_ns, &parent.name);
            if !translation.dependencies.contains(&gw_key) {
                translation.dependencies.push(gw_key);
            }

            // Routes only attach to Gateways that exist; the Gateway's own
            // change re-translates this route once it appears.
            if self.reader.gateway(gw_ns, &parent.name).await?.is_none() {
                debug!(route = %name, gateway = %parent.name, "parent gateway not found");
                continue;
            }

            let gateway_object = self.object_name(gw_ns, &parent.name);
            let vs_id = NodeId::new(KIND_VIRTUAL_SERVICE, gateway_object.clone());
            let mut nodes: Vec<DesiredNode> = Vec::new();
            for backend in route.spec.rules.iter().flat_map(|r| r.backend_refs.iter()) {
                if backend.kind.as_deref().is_some_and(|k| k != "Service") {
                    continue;
                }
                let Some(port) = backend.port else {
                    debug!(route = %name, backend = %backend.name, "backend has no port");
                    continue;
                };
                let backend_ns = backend.namespace.as_deref().unwrap_or(namespace);
                // One pool per parent gateway
                let pool_id = NodeId::new(
                    KIND_POOL,
                    format!("{gateway_object}-{namespace}-{name}-{}-{port}", backend.name),
                );
                if nodes.iter().any(|n| n.id == pool_id) {
                    continue;
                }
                let payload = json!({
                    "default_server_port": port,
                    "servers": [{
                        "hostname": format!("{}.{}.svc", backend.name, backend_ns),
                        "port": port,
                    }],
                    "hostnames": route.spec.hostnames,
                });
                nodes.push(DesiredNode::child(pool_id, vs_id.clone(), payload));
            }

            translation.contributions.push(Contribution {
                model: self.model_for(gw_ns, &parent.name),
                governs: false,
                nodes,
            });
        }
        Ok(Some(translation))
    }
}

fn certificate_payload(secret: &Secret) -> Option<Value> {
    let data = secret.data.as_ref()?;
    let cert = data.get(TLS_CERT_KEY)?;
    let key = data.get(TLS_KEY_KEY)?;
    Some(json!({
        "type": "SSL_CERTIFICATE_TYPE_VIRTUALSERVICE",
        "certificate": {
            "certificate": String::from_utf8_lossy(&cert.0),
        },
        "key": String::from_utf8_lossy(&key.0),
    }))
}

#[async_trait]
impl GraphTranslator for GatewayTranslator {
    async fn translate(&self, key: &ChangeKey) -> Result<Option<Translation>> {
        let namespace = key.namespace().unwrap_or_default();
        match key.resource_type() {
            ResourceType::Gateway => self
                .translate_gateway(namespace, key.name())
                .await
                .map_err(|e| wrap(key, e)),
            ResourceType::HttpRoute => self
                .translate_route(namespace, key.name())
                .await
                .map_err(|e| wrap(key, e)),
            // Dependents are re-triggered by the graph builder
            _ => Ok(Some(Translation::default())),
        }
    }
}

/// Kubernetes errors keep their type so retryability is preserved
fn wrap(key: &ChangeKey, err: Error) -> Error {
    match err {
        Error::Serialization { message } => Error::translation(key, message),
        other => other,
    }
}
