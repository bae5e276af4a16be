//! Command-line flags with `LBSYNC_*` environment fallbacks

use clap::Parser;

use lbsync_common::config::{
    DEFAULT_FULL_SYNC_INTERVAL_SECS, DEFAULT_INGESTION_SHARDS, DEFAULT_RETRY_CAP,
    DEFAULT_SYNC_WORKERS,
};
use lbsync_common::telemetry::{LogFormat, TelemetryConfig};
use lbsync_common::{RemoteConfig, SyncConfig, DEFAULT_TENANT};

/// lbsync - synchronize Gateway API resources to an external load balancer
#[derive(Parser, Debug)]
#[command(name = "lbsync", version, about, long_about = None)]
pub struct Cli {
    /// Cluster name, used as the prefix of every remote object name
    #[arg(long, env = "LBSYNC_CLUSTER_NAME")]
    pub cluster_name: String,

    /// Tenant that owns the remote objects
    #[arg(long, env = "LBSYNC_TENANT", default_value = DEFAULT_TENANT)]
    pub tenant: String,

    /// Tenant used when an operation is forbidden in the configured one
    #[arg(long, env = "LBSYNC_ADMIN_TENANT", default_value = DEFAULT_TENANT)]
    pub admin_tenant: String,

    /// Seconds between periodic full syncs (0 disables them)
    #[arg(long, env = "LBSYNC_FULL_SYNC_INTERVAL", default_value_t = DEFAULT_FULL_SYNC_INTERVAL_SECS)]
    pub full_sync_interval: u64,

    /// Retries before a model is abandoned until the next full sync
    #[arg(long, env = "LBSYNC_RETRY_CAP", default_value_t = DEFAULT_RETRY_CAP)]
    pub retry_cap: u32,

    /// Number of ingestion shards
    #[arg(long, env = "LBSYNC_INGESTION_SHARDS", default_value_t = DEFAULT_INGESTION_SHARDS)]
    pub ingestion_shards: usize,

    /// Number of REST sync workers
    #[arg(long, env = "LBSYNC_SYNC_WORKERS", default_value_t = DEFAULT_SYNC_WORKERS)]
    pub sync_workers: usize,

    /// Only sync models of this namespace, and only watch it
    #[arg(long, env = "LBSYNC_SYNC_NAMESPACE")]
    pub sync_namespace: Option<String>,

    /// Only execute deletes (tear down everything this cluster created)
    #[arg(long, env = "LBSYNC_DELETE_CONFIG")]
    pub delete_config: bool,

    /// Remote object kinds mirrored by the cache, parents first
    #[arg(long, env = "LBSYNC_OBJECT_KINDS", value_delimiter = ',')]
    pub object_kinds: Vec<String>,

    /// Controller URL
    #[arg(long, env = "LBSYNC_CONTROLLER_URL")]
    pub controller_url: String,

    /// Controller user
    #[arg(long, env = "LBSYNC_CONTROLLER_USERNAME", default_value = "admin")]
    pub controller_username: String,

    /// Controller password
    #[arg(long, env = "LBSYNC_CONTROLLER_PASSWORD", hide_env_values = true)]
    pub controller_password: Option<String>,

    /// Controller auth token, preferred over the password
    #[arg(long, env = "LBSYNC_CONTROLLER_TOKEN", hide_env_values = true)]
    pub controller_token: Option<String>,

    /// Controller API version header
    #[arg(long, env = "LBSYNC_CONTROLLER_API_VERSION")]
    pub controller_api_version: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, env = "LBSYNC_REQUEST_TIMEOUT", default_value_t = 60)]
    pub request_timeout: u64,

    /// Skip TLS verification of the controller certificate
    #[arg(long, env = "LBSYNC_INSECURE_SKIP_VERIFY")]
    pub insecure_skip_verify: bool,

    /// Log format: json or text
    #[arg(long, env = "LBSYNC_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,
}

impl Cli {
    /// Telemetry settings for this cluster
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            cluster_name: Some(self.cluster_name.clone()),
            log_format: self.log_format,
            ..Default::default()
        }
    }

    /// Split the flags into pipeline and controller configuration
    pub fn into_configs(self) -> (SyncConfig, RemoteConfig) {
        let defaults = SyncConfig::default();
        let object_kinds = if self.object_kinds.is_empty() {
            defaults.object_kinds.clone()
        } else {
            self.object_kinds
        };

        let sync = SyncConfig {
            cluster_name: self.cluster_name,
            tenant: self.tenant,
            admin_tenant: self.admin_tenant,
            full_sync_interval_secs: self.full_sync_interval,
            retry_cap: self.retry_cap,
            ingestion_shards: self.ingestion_shards,
            sync_workers: self.sync_workers,
            sync_namespace: self.sync_namespace,
            delete_config: self.delete_config,
            object_kinds,
            ..defaults
        };
        let remote = RemoteConfig {
            base_url: self.controller_url,
            username: self.controller_username,
            password: self.controller_password,
            auth_token: self.controller_token,
            api_version: self.controller_api_version,
            request_timeout_secs: self.request_timeout,
            insecure_skip_verify: self.insecure_skip_verify,
        };
        (sync, remote)
    }
}
