//! REST synchronization layer
//!
//! [`RestSynchronizer`] diffs a model against the remote cache, executes the
//! resulting [`RestOp`]s through a [`RemoteClient`], and classifies failures
//! into retry, refresh or fatal paths.

mod classify;
mod http;
mod sync;

pub use classify::{classify, ErrorClass};
pub use http::HttpRemoteClient;
pub use sync::{RestSynchronizer, SyncContext, SyncOutcome};

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use lbsync_common::Error;

use crate::graph::ModelName;

/// Message recorded on operations skipped after an earlier failure
pub const ABORTED_MESSAGE: &str = "Aborted due to prev error";

/// HTTP verb of a REST operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RestMethod {
    /// Read
    Get,
    /// Create
    Post,
    /// Replace
    Put,
    /// Delete
    Delete,
}

impl RestMethod {
    /// Verb as sent on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            RestMethod::Get => "GET",
            RestMethod::Post => "POST",
            RestMethod::Put => "PUT",
            RestMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for RestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One create/update/delete against the remote controller.
///
/// Built fresh for every synchronization attempt; `error` is set after
/// execution.
#[derive(Clone, Debug, PartialEq)]
pub struct RestOp {
    /// HTTP verb
    pub method: RestMethod,
    /// Request path, e.g. `/api/pool/pool-1234`
    pub path: String,
    /// Request body for POST/PUT
    pub payload: Option<Value>,
    /// Tenant context the request runs under
    pub tenant: String,
    /// Remote object kind
    pub model_kind: String,
    /// Remote object name
    pub object_name: String,
    /// Model the operation belongs to
    pub model: ModelName,
    /// Failure recorded after execution
    pub error: Option<RemoteError>,
}

impl RestOp {
    /// Whether the op has run (or was aborted) and failed
    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

impl fmt::Display for RestOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.method, self.path, self.object_name)
    }
}

/// Structured reason for a remote failure, when the client can tell
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteErrorCode {
    /// Another writer modified the object concurrently
    ConcurrentUpdate,
    /// Credentials are invalid or expired
    InvalidCredentials,
    /// The request timed out on the client side
    Timeout,
    /// The controller could not be reached
    Unreachable,
}

impl RemoteErrorCode {
    /// Parse a code string returned in an error body
    pub fn from_wire(code: &str) -> Option<Self> {
        match code {
            "CONCURRENT_UPDATE" => Some(Self::ConcurrentUpdate),
            "INVALID_CREDENTIALS" => Some(Self::InvalidCredentials),
            "TIMEOUT" => Some(Self::Timeout),
            "UNREACHABLE" => Some(Self::Unreachable),
            _ => None,
        }
    }
}

/// Failure returned by the remote controller or the transport
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("remote call failed [{status}]: {message}")]
pub struct RemoteError {
    /// HTTP status, or 0 when no response was received
    pub status: u16,
    /// Error text
    pub message: String,
    /// Structured reason, if known
    pub code: Option<RemoteErrorCode>,
}

impl RemoteError {
    /// Error from an HTTP response
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
        }
    }

    /// Attach a structured code
    pub fn with_code(mut self, code: RemoteErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Client-side timeout
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(0, message).with_code(RemoteErrorCode::Timeout)
    }

    /// Connection could not be established
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(0, message).with_code(RemoteErrorCode::Unreachable)
    }

    /// Marker for operations skipped after an earlier failure
    pub fn aborted() -> Self {
        Self::new(0, ABORTED_MESSAGE)
    }

    /// Whether the remote reported the object as missing
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// Whether this is the abort marker rather than a real failure
    pub fn is_aborted(&self) -> bool {
        self.status == 0 && self.code.is_none() && self.message == ABORTED_MESSAGE
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Error::remote(e.status, e.message)
    }
}

/// Transport to the remote controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Execute a create/update/delete. Returns the response body (or
    /// `Value::Null` when there is none).
    async fn execute(&self, op: &RestOp) -> Result<Value, RemoteError>;

    /// Issue a GET for `path` (which may carry a query string) under `tenant`
    async fn get(&self, path: &str, tenant: &str) -> Result<Value, RemoteError>;
}
