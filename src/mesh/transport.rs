//! Inter-service transport.
//!
//! # Responsibilities
//! - Invoke an instance: POST JSON to `/process`
//! - Probe an instance: GET its health check path
//! - Classify failures into a `FailureKind` from the HTTP status or the
//!   transport error category

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CallFailure, FabricError, FabricResult, FailureKind};
use crate::load_balancer::ServiceInstance;

/// Path every instance serves work on.
pub const PROCESS_PATH: &str = "/process";

/// Result of one health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Healthy,
    Degraded,
    Unhealthy,
}

/// How the registry talks to instances.
#[async_trait]
pub trait ServiceTransport: Send + Sync + Debug {
    async fn invoke(
        &self,
        instance: &ServiceInstance,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value, CallFailure>;

    async fn probe(&self, instance: &ServiceInstance, timeout: Duration) -> ProbeOutcome;
}

fn classify(err: &reqwest::Error) -> FailureKind {
    if err.is_timeout() {
        FailureKind::Timeout
    } else if err.is_connect() {
        FailureKind::Network
    } else if let Some(status) = err.status() {
        FailureKind::from_status(status.as_u16())
    } else if err.is_request() || err.is_body() {
        FailureKind::Network
    } else {
        FailureKind::Generic
    }
}

/// Probe body of `{"status": "degraded"}` marks a live but degraded instance.
fn probe_body_outcome(body: &[u8]) -> ProbeOutcome {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) if value.get("status").and_then(Value::as_str) == Some("degraded") => {
            ProbeOutcome::Degraded
        }
        _ => ProbeOutcome::Healthy,
    }
}

/// HTTP transport over reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> FabricResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("resilience-fabric/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()
            .map_err(|e| FabricError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ServiceTransport for HttpTransport {
    async fn invoke(
        &self,
        instance: &ServiceInstance,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value, CallFailure> {
        let url = instance
            .url(PROCESS_PATH)
            .map_err(|e| CallFailure::generic(e.to_string()))?;

        let response = self
            .client
            .post(url.clone())
            .json(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CallFailure::new(classify(&e), format!("POST {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallFailure::new(
                FailureKind::from_status(status.as_u16()),
                format!("POST {} returned {}", url, status),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| CallFailure::new(classify(&e), format!("reading {}: {}", url, e)))?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body)
            .map_err(|e| CallFailure::generic(format!("invalid JSON from {}: {}", url, e)))
    }

    async fn probe(&self, instance: &ServiceInstance, timeout: Duration) -> ProbeOutcome {
        let url = match instance.url(&instance.health_check_path) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(instance = %instance.id, error = %e, "Failed to build health check URL");
                return ProbeOutcome::Unhealthy;
            }
        };

        let response = match self.client.get(url.clone()).timeout(timeout).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(instance = %instance.id, url = %url, kind = %classify(&e), "Health check failed: request error");
                return ProbeOutcome::Unhealthy;
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(instance = %instance.id, status = %status, "Health check failed: non-success status");
            return ProbeOutcome::Unhealthy;
        }
        match response.bytes().await {
            Ok(body) => probe_body_outcome(&body),
            // The status already said the instance is up.
            Err(_) => ProbeOutcome::Healthy,
        }
    }
}
