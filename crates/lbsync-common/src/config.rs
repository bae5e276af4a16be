//! Pipeline and remote-controller configuration
//!
//! Both structs deserialize from JSON and carry safe defaults. The binary
//! fills them from CLI flags with `LBSYNC_*` environment fallbacks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, DEFAULT_TENANT, NAME_PREFIX_SEPARATOR};

/// Default interval between periodic full syncs (seconds)
pub const DEFAULT_FULL_SYNC_INTERVAL_SECS: u64 = 1800;

/// Default number of retries before a model is abandoned
pub const DEFAULT_RETRY_CAP: u32 = 3;

/// Default number of ingestion shards
pub const DEFAULT_INGESTION_SHARDS: usize = 8;

/// Default number of sync workers
pub const DEFAULT_SYNC_WORKERS: usize = 8;

/// Remote object kinds mirrored by the cache when none are configured.
///
/// Ordered parents first.
pub const DEFAULT_OBJECT_KINDS: &[&str] = &[
    "virtualservice",
    "sslkeyandcertificate",
    "pool",
];

/// Configuration for the reconciliation pipeline
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Name of the Kubernetes cluster; prefixes every remote object name
    pub cluster_name: String,
    /// Tenant every operation runs under
    pub tenant: String,
    /// Elevated tenant used to retry operations rejected with 403
    pub admin_tenant: String,
    /// Seconds between periodic full syncs; 0 disables periodic sync
    pub full_sync_interval_secs: u64,
    /// Retries allowed per model before the work is abandoned
    pub retry_cap: u32,
    /// Number of ingestion shards (one worker each)
    pub ingestion_shards: usize,
    /// Number of sync shards (one worker each)
    pub sync_workers: usize,
    /// Initial fast-retry backoff in milliseconds
    pub fast_retry_base_ms: u64,
    /// Maximum fast-retry backoff in milliseconds
    pub fast_retry_max_ms: u64,
    /// Initial slow-retry backoff in milliseconds
    pub slow_retry_base_ms: u64,
    /// Maximum slow-retry backoff in milliseconds
    pub slow_retry_max_ms: u64,
    /// Initial backoff for failed queue items in milliseconds
    pub requeue_base_ms: u64,
    /// Maximum backoff for failed queue items in milliseconds
    pub requeue_max_ms: u64,
    /// Restrict full-sync publication to models of this namespace
    pub sync_namespace: Option<String>,
    /// Only execute DELETE operations (configuration teardown)
    pub delete_config: bool,
    /// Remote object kinds mirrored by the cache
    pub object_kinds: Vec<String>,
    /// Page size requested from collection endpoints
    pub page_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cluster_name: "cluster".to_string(),
            tenant: DEFAULT_TENANT.to_string(),
            admin_tenant: DEFAULT_TENANT.to_string(),
            full_sync_interval_secs: DEFAULT_FULL_SYNC_INTERVAL_SECS,
            retry_cap: DEFAULT_RETRY_CAP,
            ingestion_shards: DEFAULT_INGESTION_SHARDS,
            sync_workers: DEFAULT_SYNC_WORKERS,
            fast_retry_base_ms: 500,
            fast_retry_max_ms: 10_000,
            slow_retry_base_ms: 30_000,
            slow_retry_max_ms: 300_000,
            requeue_base_ms: 5,
            requeue_max_ms: 60_000,
            sync_namespace: None,
            delete_config: false,
            object_kinds: DEFAULT_OBJECT_KINDS.iter().map(|k| k.to_string()).collect(),
            page_size: 100,
        }
    }
}

impl SyncConfig {
    /// Check invariants that the pipeline relies on
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(Error::config("clusterName", "must not be empty"));
        }
        if self.cluster_name.contains('/') {
            return Err(Error::config("clusterName", "must not contain '/'"));
        }
        if self.tenant.is_empty() {
            return Err(Error::config("tenant", "must not be empty"));
        }
        if self.ingestion_shards == 0 {
            return Err(Error::config("ingestionShards", "must be at least 1"));
        }
        if self.sync_workers == 0 {
            return Err(Error::config("syncWorkers", "must be at least 1"));
        }
        if self.object_kinds.is_empty() {
            return Err(Error::config("objectKinds", "at least one kind is required"));
        }
        if self.fast_retry_base_ms > self.fast_retry_max_ms {
            return Err(Error::config(
                "fastRetryBaseMs",
                "must not exceed fastRetryMaxMs",
            ));
        }
        if self.slow_retry_base_ms > self.slow_retry_max_ms {
            return Err(Error::config(
                "slowRetryBaseMs",
                "must not exceed slowRetryMaxMs",
            ));
        }
        if self.page_size == 0 {
            return Err(Error::config("pageSize", "must be at least 1"));
        }
        Ok(())
    }

    /// Periodic full sync interval, or `None` when disabled
    pub fn full_sync_interval(&self) -> Option<Duration> {
        match self.full_sync_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Prefix carried by every remote object name this cluster owns
    pub fn name_prefix(&self) -> String {
        format!("{}{}", self.cluster_name, NAME_PREFIX_SEPARATOR)
    }

    /// Prefix of model object names that belong to a namespace shard
    pub fn namespace_shard_prefix(&self, namespace: &str) -> String {
        format!("{}{}-", self.name_prefix(), namespace)
    }

    /// Value of the `created_by` marker on objects this cluster owns
    pub fn controller_user(&self) -> String {
        format!("lbsync-{}", self.cluster_name)
    }

    /// Fast-retry backoff bounds
    pub fn fast_retry_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.fast_retry_base_ms),
            Duration::from_millis(self.fast_retry_max_ms),
        )
    }

    /// Slow-retry backoff bounds
    pub fn slow_retry_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.slow_retry_base_ms),
            Duration::from_millis(self.slow_retry_max_ms),
        )
    }

    /// Backoff bounds for items whose handler failed
    pub fn requeue_backoff(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.requeue_base_ms),
            Duration::from_millis(self.requeue_max_ms),
        )
    }
}

/// Connection settings for the remote load-balancing controller
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteConfig {
    /// Base URL, e.g. `https://10.10.10.10`
    pub base_url: String,
    /// API user
    pub username: String,
    /// Password for basic authentication
    pub password: Option<String>,
    /// Bearer token, preferred over the password when set
    pub auth_token: Option<String>,
    /// Value of the API version header
    pub api_version: Option<String>,
    /// Client-side timeout for each REST call in seconds
    pub request_timeout_secs: u64,
    /// Skip TLS certificate verification
    pub insecure_skip_verify: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: "admin".to_string(),
            password: None,
            auth_token: None,
            api_version: None,
            request_timeout_secs: 60,
            insecure_skip_verify: false,
        }
    }
}

// Credentials stay out of logs.
impl std::fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("api_version", &self.api_version)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish()
    }
}

impl RemoteConfig {
    /// Check that the controller can be reached and authenticated against
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(Error::config("baseUrl", "controller URL is required"));
        }
        if !(self.base_url.starts_with("https://") || self.base_url.starts_with("http://")) {
            return Err(Error::config("baseUrl", "must start with http:// or https://"));
        }
        if self.password.is_none() && self.auth_token.is_none() {
            return Err(Error::config(
                "credentials",
                "either a password or an auth token is required",
            ));
        }
        Ok(())
    }

    /// Client-side request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry_cap, 3);
        assert_eq!(config.sync_workers, 8);
        assert_eq!(
            config.full_sync_interval(),
            Some(Duration::from_secs(DEFAULT_FULL_SYNC_INTERVAL_SECS))
        );
    }

    #[test]
    fn zero_interval_disables_periodic_sync() {
        let config = SyncConfig {
            full_sync_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.full_sync_interval(), None);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = SyncConfig {
            sync_workers: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("syncWorkers"));
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let config = SyncConfig {
            fast_retry_base_ms: 10_000,
            fast_retry_max_ms: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn naming_helpers_follow_cluster_prefix() {
        let config = SyncConfig {
            cluster_name: "prod".to_string(),
            ..Default::default()
        };
        assert_eq!(config.name_prefix(), "prod--");
        assert_eq!(config.namespace_shard_prefix("team-a"), "prod--team-a-");
        assert_eq!(config.controller_user(), "lbsync-prod");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"clusterName":"edge","syncNamespace":"team-a"}"#).unwrap();
        assert_eq!(config.cluster_name, "edge");
        assert_eq!(config.sync_namespace.as_deref(), Some("team-a"));
        assert_eq!(config.retry_cap, DEFAULT_RETRY_CAP);
    }

    #[test]
    fn remote_config_requires_credentials() {
        let config = RemoteConfig {
            base_url: "https://controller".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RemoteConfig {
            base_url: "https://controller".to_string(),
            password: Some("secret".to_string()),
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn remote_config_debug_redacts_secrets() {
        let config = RemoteConfig {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
