//! Caller-visible outcome status.

use serde::{Deserialize, Serialize};

/// Outcome of a call where degradation is part of the contract
/// (failover, backpressure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Partial,
    Dropped,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Partial => "partial",
            CallStatus::Dropped => "dropped",
            CallStatus::Failed => "failed",
        }
    }
}
