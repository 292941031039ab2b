//! Local discovery agent client.
//!
//! Mirrors registry membership into the agent's loopback HTTP API so that
//! other processes can find instances. Agent failures are logged and never
//! fail a registry operation.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use url::Url;

use crate::config::DiscoveryConfig;
use crate::error::{FabricError, FabricResult};
use crate::load_balancer::ServiceInstance;

const REGISTER_PATH: &str = "/v1/agent/service/register";
const DEREGISTER_PATH: &str = "/v1/agent/service/deregister/";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentCheck {
    #[serde(rename = "HTTP")]
    pub http: String,
    pub interval: String,
    pub timeout: String,
    pub deregister_critical_service_after: String,
}

/// Registration body for the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
    pub check: AgentCheck,
}

fn secs(d: u64) -> String {
    format!("{}s", d)
}

#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    client: reqwest::Client,
    agent: Url,
    config: DiscoveryConfig,
}

impl DiscoveryClient {
    pub fn new(config: DiscoveryConfig) -> FabricResult<Self> {
        let agent = Url::parse(&config.agent_address).map_err(|e| {
            FabricError::Config(format!(
                "discovery.agent_address '{}' is not a URL: {}",
                config.agent_address, e
            ))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.check_timeout_secs.max(1)))
            .no_proxy()
            .build()
            .map_err(|e| FabricError::Config(format!("failed to build discovery client: {}", e)))?;
        Ok(Self {
            client,
            agent,
            config,
        })
    }

    pub fn registration(&self, instance: &ServiceInstance) -> AgentRegistration {
        let mut check_url = instance.base_url.clone();
        check_url.set_path(&instance.health_check_path);
        AgentRegistration {
            id: instance.id.clone(),
            name: instance.service_name.clone(),
            address: instance.host.clone(),
            port: instance.port,
            tags: vec![format!("priority-{}", instance.priority)],
            meta: instance.metadata.clone(),
            check: AgentCheck {
                http: check_url.to_string(),
                interval: secs(self.config.check_interval_secs),
                timeout: secs(self.config.check_timeout_secs),
                deregister_critical_service_after: secs(self.config.deregister_critical_after_secs),
            },
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, String> {
        self.agent.join(path).map_err(|e| e.to_string())
    }

    /// Register `instance` with the agent. Returns whether the agent accepted it.
    pub async fn register(&self, instance: &ServiceInstance) -> bool {
        let body = self.registration(instance);
        let result = match self.endpoint(REGISTER_PATH) {
            Ok(url) => self
                .client
                .put(url)
                .json(&body)
                .send()
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e),
        };
        self.log_outcome("register", &instance.id, result)
    }

    pub async fn deregister(&self, instance_id: &str) -> bool {
        let result = match self.endpoint(&format!("{}{}", DEREGISTER_PATH, instance_id)) {
            Ok(url) => self.client.put(url).send().await.map_err(|e| e.to_string()),
            Err(e) => Err(e),
        };
        self.log_outcome("deregister", instance_id, result)
    }

    fn log_outcome(
        &self,
        operation: &'static str,
        instance_id: &str,
        result: Result<reqwest::Response, String>,
    ) -> bool {
        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(operation, instance = %instance_id, "Discovery agent updated");
                true
            }
            Ok(response) => {
                tracing::warn!(operation, instance = %instance_id, status = %response.status(), "Discovery agent refused request");
                false
            }
            Err(e) => {
                tracing::warn!(operation, instance = %instance_id, error = %e, "Discovery agent unreachable");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::InstanceSpec;

    #[test]
    fn test_registration_body() {
        let client = DiscoveryClient::new(DiscoveryConfig::default()).unwrap();
        let instance = ServiceInstance::new(
            "pricing",
            InstanceSpec::new("pricing-1", "10.0.0.5", 7000)
                .health_check_path("/healthz")
                .priority(2)
                .metadata("zone", "a"),
            100,
        )
        .unwrap();

        let body = serde_json::to_value(client.registration(&instance)).unwrap();
        assert_eq!(body["ID"], "pricing-1");
        assert_eq!(body["Name"], "pricing");
        assert_eq!(body["Port"], 7000);
        assert_eq!(body["Tags"][0], "priority-2");
        assert_eq!(body["Meta"]["zone"], "a");
        assert_eq!(body["Check"]["HTTP"], "http://10.0.0.5:7000/healthz");
        assert_eq!(body["Check"]["Interval"], "10s");
        assert_eq!(body["Check"]["DeregisterCriticalServiceAfter"], "60s");
    }

    #[test]
    fn test_invalid_agent_address() {
        let config = DiscoveryConfig {
            agent_address: "not a url".into(),
            ..Default::default()
        };
        assert!(DiscoveryClient::new(config).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_not_fatal() {
        let config = DiscoveryConfig {
            agent_address: "http://127.0.0.1:1".into(),
            check_timeout_secs: 1,
            ..Default::default()
        };
        let client = DiscoveryClient::new(config).unwrap();
        assert!(!client.deregister("missing").await);
    }
}
