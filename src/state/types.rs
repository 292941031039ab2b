//! State store types and error definitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    /// Backend unreachable or refusing commands.
    #[error("store backend unavailable: {0}")]
    Unavailable(String),

    /// Backend did not answer within the operation timeout.
    #[error("store operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation does not apply to the type stored at the key.
    #[error("wrong value type at key '{0}'")]
    WrongType(String),

    /// A batch was rejected as a whole; nothing was applied.
    #[error("transaction aborted: {0}")]
    TransactionAborted(String),
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type StateResult<T> = Result<T, StateError>;

/// One operation of an all-or-nothing batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateOp {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Delete {
        key: String,
    },
    Increment {
        key: String,
        by: i64,
    },
    FieldSet {
        key: String,
        field: String,
        value: String,
    },
}

impl StateOp {
    /// Build a `Set` carrying the JSON encoding of `value`.
    pub fn set<T: Serialize + ?Sized>(
        key: impl Into<String>,
        value: &T,
        ttl: Option<Duration>,
    ) -> StateResult<Self> {
        Ok(StateOp::Set {
            key: key.into(),
            value: serde_json::to_string(value)?,
            ttl,
        })
    }

    pub fn delete(key: impl Into<String>) -> Self {
        StateOp::Delete { key: key.into() }
    }

    pub fn increment(key: impl Into<String>, by: i64) -> Self {
        StateOp::Increment { key: key.into(), by }
    }

    pub fn field_set(
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        StateOp::FieldSet {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            StateOp::Set { key, .. }
            | StateOp::Delete { key }
            | StateOp::Increment { key, .. }
            | StateOp::FieldSet { key, .. } => key,
        }
    }
}

/// Per-operation reply of an applied batch, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchReply {
    Stored,
    Deleted(bool),
    Integer(i64),
    /// `true` when the field did not exist before.
    FieldStored(bool),
}

/// Backend identification for health reports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendInfo {
    pub backend: String,
    pub node_id: String,
    /// "standalone" or "cluster".
    pub mode: String,
    pub nodes: usize,
    pub keys: usize,
}

/// Result of a store health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHealth {
    pub healthy: bool,
    pub latency_ms: f64,
    pub backend: Option<BackendInfo>,
    pub error: Option<String>,
}

/// Operation counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub transactions: u64,
    pub errors: u64,
}
