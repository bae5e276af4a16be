//! HTTP transport to the remote controller

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::trace;

use lbsync_common::{Error, RemoteConfig, Result};

use super::{RemoteClient, RemoteError, RemoteErrorCode, RestMethod, RestOp};

/// Header carrying the tenant context of a request
pub const TENANT_HEADER: &str = "X-Tenant";

/// Header carrying the requested API version
pub const API_VERSION_HEADER: &str = "X-Api-Version";

/// [`RemoteClient`] over HTTPS with basic or bearer authentication
pub struct HttpRemoteClient {
    http: reqwest::Client,
    base_url: String,
    config: RemoteConfig,
}

impl HttpRemoteClient {
    /// Build a client from validated connection settings
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::config("remote", format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            config: config.clone(),
        })
    }

    fn request(&self, method: Method, path: &str, tenant: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self
            .http
            .request(method, url)
            .header(TENANT_HEADER, tenant);

        if let Some(version) = &self.config.api_version {
            builder = builder.header(API_VERSION_HEADER, version);
        }
        match (&self.config.auth_token, &self.config.password) {
            (Some(token), _) => builder.bearer_auth(token),
            (None, password) => builder.basic_auth(&self.config.username, password.as_ref()),
        }
    }

    async fn send(&self, builder: RequestBuilder) -> std::result::Result<Value, RemoteError> {
        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&body)
                .map_err(|e| RemoteError::new(status.as_u16(), format!("invalid response body: {e}")));
        }
        Err(error_from_body(status, &body))
    }
}

fn method_for(method: RestMethod) -> Method {
    match method {
        RestMethod::Get => Method::GET,
        RestMethod::Post => Method::POST,
        RestMethod::Put => Method::PUT,
        RestMethod::Delete => Method::DELETE,
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::timeout(e.to_string())
    } else if e.is_connect() {
        RemoteError::unreachable(e.to_string())
    } else {
        RemoteError::new(e.status().map(|s| s.as_u16()).unwrap_or(0), e.to_string())
    }
}

/// Build a [`RemoteError`] from a non-success response.
///
/// Controllers answer with `{"error": "...", "code": "..."}`; anything else
/// is kept verbatim as the message.
fn error_from_body(status: StatusCode, body: &str) -> RemoteError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| {
            if body.is_empty() {
                status.canonical_reason().unwrap_or("unknown error").to_string()
            } else {
                body.to_string()
            }
        });
    let code = parsed
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(Value::as_str)
        .and_then(RemoteErrorCode::from_wire);

    let mut err = RemoteError::new(status.as_u16(), message);
    err.code = code;
    err
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn execute(&self, op: &RestOp) -> std::result::Result<Value, RemoteError> {
        trace!(method = %op.method, path = %op.path, tenant = %op.tenant, "executing rest op");
        let mut builder = self.request(method_for(op.method), &op.path, &op.tenant);
        if let Some(payload) = &op.payload {
            builder = builder.json(payload);
        }
        self.send(builder).await
    }

    async fn get(&self, path: &str, tenant: &str) -> std::result::Result<Value, RemoteError> {
        trace!(path = %path, tenant = %tenant, "rest get");
        self.send(self.request(Method::GET, path, tenant)).await
    }
}
