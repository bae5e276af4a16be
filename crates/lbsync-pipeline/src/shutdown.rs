//! Process-wide stop signal
//!
//! Every stage holds a clone of the same [`ShutdownSignal`]. A graceful stop
//! and a fatal stop cancel the same token; a fatal stop also records why, so
//! the binary can exit non-zero with the reason.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared stop signal with an optional fatal reason
#[derive(Clone, Default, Debug)]
pub struct ShutdownSignal {
    token: CancellationToken,
    fatal_reason: Arc<Mutex<Option<String>>>,
}

impl ShutdownSignal {
    /// Create a signal that has not fired
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when the signal fires
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request a graceful stop
    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            info!("shutdown requested");
        }
        self.token.cancel();
    }

    /// Stop because continuing would operate on stale trust.
    ///
    /// Only the first reason is kept.
    pub fn trigger_fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut slot = self.fatal_reason.lock();
            if slot.is_none() {
                error!(reason = %reason, "fatal error, shutting down");
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    /// Whether the signal has fired
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason recorded by [`ShutdownSignal::trigger_fatal`], if any
    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal_reason.lock().clone()
    }

    /// Wait until the signal fires
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
