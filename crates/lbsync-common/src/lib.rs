//! Common types for lbsync: change keys, configuration, errors, and telemetry

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod hash;
pub mod key;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use config::{RemoteConfig, SyncConfig};
pub use error::Error;
pub use hash::{deterministic_hash, shard_index};
pub use key::{ChangeEvent, ChangeKey, EventOp, ResourceType};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default tenant used when none is configured
pub const DEFAULT_TENANT: &str = "admin";

/// Separator between the cluster name and the rest of every remote object name
pub const NAME_PREFIX_SEPARATOR: &str = "--";

/// Field manager used for server-side status writes
pub const FIELD_MANAGER: &str = "lbsync-controller";
