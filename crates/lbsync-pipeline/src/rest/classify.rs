//! Failure classification
//!
//! Checked in order:
//!
//! | Condition | Class |
//! |---|---|
//! | 401 with invalid/expired credentials | [`ErrorClass::Fatal`] |
//! | 401 otherwise | [`ErrorClass::FastRetry`] |
//! | 403 | [`ErrorClass::ElevateTenant`] |
//! | concurrent update | [`ErrorClass::ConcurrentUpdate`] |
//! | timeout, 408, 409, 429 | [`ErrorClass::FastRetry`] |
//! | unreachable, no response, 5xx | [`ErrorClass::SlowRetry`] |
//! | anything else | [`ErrorClass::Failed`] |
//!
//! Structured [`RemoteErrorCode`]s take precedence; message matching is kept
//! for controllers that only report the condition in text.

use super::{RemoteError, RemoteErrorCode};

const CONCURRENT_UPDATE_TEXT: &str = "Concurrent Update Error";
const INVALID_CREDENTIALS_TEXT: &str = "invalid credentials";
const EXPIRED_TEXT: &str = "expired";

/// What to do about a failed operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Stop accepting work and shut down
    Fatal,
    /// Retry soon via the fast queue
    FastRetry,
    /// Retry much later via the slow queue
    SlowRetry,
    /// Retry once under the administrative tenant
    ElevateTenant,
    /// Refresh the cache and schedule a quick sync without using retry budget
    ConcurrentUpdate,
    /// Report the failure; no automatic retry
    Failed,
}

impl ErrorClass {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Fatal => "fatal",
            ErrorClass::FastRetry => "fast_retry",
            ErrorClass::SlowRetry => "slow_retry",
            ErrorClass::ElevateTenant => "elevate_tenant",
            ErrorClass::ConcurrentUpdate => "concurrent_update",
            ErrorClass::Failed => "failed",
        }
    }
}

/// Classify a remote failure
pub fn classify(err: &RemoteError) -> ErrorClass {
    let lower = err.message.to_lowercase();

    if err.status == 401 {
        let invalid = err.code == Some(RemoteErrorCode::InvalidCredentials)
            || lower.contains(INVALID_CREDENTIALS_TEXT)
            || lower.contains(EXPIRED_TEXT);
        return if invalid {
            ErrorClass::Fatal
        } else {
            ErrorClass::FastRetry
        };
    }

    if err.status == 403 {
        return ErrorClass::ElevateTenant;
    }

    if err.code == Some(RemoteErrorCode::ConcurrentUpdate)
        || err.message.contains(CONCURRENT_UPDATE_TEXT)
    {
        return ErrorClass::ConcurrentUpdate;
    }

    match (err.code, err.status) {
        (Some(RemoteErrorCode::Timeout), _) | (_, 408 | 409 | 429) => ErrorClass::FastRetry,
        (Some(RemoteErrorCode::Unreachable), _) | (_, 0) => ErrorClass::SlowRetry,
        (_, status) if status >= 500 => ErrorClass::SlowRetry,
        (Some(RemoteErrorCode::InvalidCredentials), _) => ErrorClass::Fatal,
        _ => ErrorClass::Failed,
    }
}
