//! Error taxonomy shared by every subsystem.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::StateError;

/// Category of a failed outbound call.
///
/// Produced by the call site (HTTP status, transport error category) and used for
/// observability and retry eligibility. Never derived from error message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Network,
    RateLimit,
    Unavailable,
    Authorization,
    NotFound,
    Generic,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Network => "network",
            FailureKind::RateLimit => "rate_limit",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Authorization => "authorization",
            FailureKind::NotFound => "not_found",
            FailureKind::Generic => "generic",
        }
    }

    /// Map an HTTP status code to a failure kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => FailureKind::Timeout,
            401 | 403 => FailureKind::Authorization,
            404 => FailureKind::NotFound,
            429 => FailureKind::RateLimit,
            502..=504 => FailureKind::Unavailable,
            _ => FailureKind::Generic,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed call to a protected dependency.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind} failure: {message}")]
pub struct CallFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl CallFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("operation timed out after {}ms", after.as_millis()),
        )
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Generic, message)
    }
}

/// Errors surfaced by the fabric to its callers.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Fast-fail while a breaker is open. Never retried.
    #[error("circuit breaker '{name}' is open, retry in {}ms", retry_after.as_millis())]
    CircuitOpen { name: String, retry_after: Duration },

    /// No healthy instance with spare capacity.
    #[error("no healthy instance available for service '{0}'")]
    ServiceUnavailable(String),

    /// Admission refused by a closed backpressure controller.
    #[error("request rejected by backpressure controller '{0}'")]
    BackpressureRejected(String),

    /// Item shed by a backpressure controller above its drop watermark.
    #[error("request dropped by backpressure controller '{0}'")]
    Dropped(String),

    /// Primary and backup failed and no partial result could be served.
    #[error("failover exhausted for '{service}' (primary: {primary}; backup: {backup})")]
    FailoverExhausted {
        service: String,
        primary: String,
        backup: String,
    },

    #[error("state persistence failed: {0}")]
    StatePersistence(#[from] StateError),

    #[error(transparent)]
    Call(#[from] CallFailure),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FabricError {
    /// Failure kind for breaker/failover accounting.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            FabricError::Call(failure) => failure.kind,
            FabricError::CircuitOpen { .. } | FabricError::ServiceUnavailable(_) => {
                FailureKind::Unavailable
            }
            FabricError::BackpressureRejected(_) | FabricError::Dropped(_) => FailureKind::RateLimit,
            _ => FailureKind::Generic,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, FabricError::CircuitOpen { .. })
    }
}

impl From<FabricError> for CallFailure {
    fn from(err: FabricError) -> Self {
        match err {
            FabricError::Call(failure) => failure,
            other => CallFailure::new(other.failure_kind(), other.to_string()),
        }
    }
}

/// Result type for fabric operations.
pub type FabricResult<T> = Result<T, FabricError>;
