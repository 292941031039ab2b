//! Active health checking.
//!
//! # Responsibilities
//! - Probe a snapshot of instances concurrently
//! - Update each instance's status and heartbeat from the probe outcome
//! - Report instances unhealthy for longer than `deregister_after`

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::ServiceMeshConfig;
use crate::load_balancer::{InstanceStatus, ServiceInstance};
use crate::mesh::transport::{ProbeOutcome, ServiceTransport};
use crate::observability::metrics;

/// Outcome of one pass over a service's instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    /// Maintenance instances are not probed.
    pub skipped: usize,
    /// Unhealthy past the deregistration deadline.
    pub expired: Vec<String>,
}

impl HealthReport {
    pub fn checked(&self) -> usize {
        self.healthy + self.degraded + self.unhealthy
    }
}

#[derive(Debug, Clone)]
pub struct HealthChecker {
    transport: Arc<dyn ServiceTransport>,
    timeout: Duration,
    deregister_after: Duration,
}

impl HealthChecker {
    pub fn new(transport: Arc<dyn ServiceTransport>, config: &ServiceMeshConfig) -> Self {
        Self {
            transport,
            timeout: config.health_check_timeout(),
            deregister_after: config.deregister_after(),
        }
    }

    pub async fn check_instances(&self, instances: &[Arc<ServiceInstance>]) -> HealthReport {
        let mut report = HealthReport::default();
        let targets: Vec<&Arc<ServiceInstance>> = instances
            .iter()
            .filter(|i| i.status() != InstanceStatus::Maintenance)
            .collect();
        report.skipped = instances.len() - targets.len();

        let outcomes = join_all(
            targets
                .iter()
                .map(|instance| self.transport.probe(instance, self.timeout)),
        )
        .await;

        let now = Instant::now();
        for (instance, outcome) in targets.into_iter().zip(outcomes) {
            self.apply(instance, outcome, now, &mut report);
            metrics::record_instance_health(
                &instance.service_name,
                &instance.id,
                instance.status() == InstanceStatus::Healthy,
            );
        }
        report
    }

    fn apply(
        &self,
        instance: &ServiceInstance,
        outcome: ProbeOutcome,
        now: Instant,
        report: &mut HealthReport,
    ) {
        // A probe racing with set_instance_status must not undo maintenance.
        if instance.status() == InstanceStatus::Maintenance {
            report.skipped += 1;
            return;
        }

        match outcome {
            ProbeOutcome::Healthy => {
                report.healthy += 1;
                let previous = instance.mark_healthy();
                if previous != InstanceStatus::Healthy {
                    tracing::info!(
                        service = %instance.service_name,
                        instance = %instance.id,
                        from = previous.as_str(),
                        "Instance healthy"
                    );
                }
            }
            ProbeOutcome::Degraded => {
                report.degraded += 1;
                if instance.mark_degraded() != InstanceStatus::Degraded {
                    tracing::warn!(service = %instance.service_name, instance = %instance.id, "Instance degraded");
                }
            }
            ProbeOutcome::Unhealthy => {
                report.unhealthy += 1;
                let (previous, unhealthy_for) = instance.mark_unhealthy(now);
                if previous != InstanceStatus::Unhealthy {
                    tracing::warn!(service = %instance.service_name, instance = %instance.id, "Instance unhealthy");
                }
                if unhealthy_for >= self.deregister_after {
                    tracing::warn!(
                        service = %instance.service_name,
                        instance = %instance.id,
                        unhealthy_secs = unhealthy_for.as_secs(),
                        "Instance unhealthy past deregistration deadline"
                    );
                    report.expired.push(instance.id.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallFailure;
    use crate::load_balancer::instance::test_instance;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct ScriptedProbes {
        outcomes: Mutex<HashMap<String, ProbeOutcome>>,
    }

    impl ScriptedProbes {
        fn set(&self, id: &str, outcome: ProbeOutcome) {
            self.outcomes.lock().unwrap().insert(id.to_string(), outcome);
        }
    }

    #[async_trait]
    impl ServiceTransport for ScriptedProbes {
        async fn invoke(&self, _: &ServiceInstance, _: &Value, _: Duration) -> Result<Value, CallFailure> {
            Ok(Value::Null)
        }

        async fn probe(&self, instance: &ServiceInstance, _: Duration) -> ProbeOutcome {
            self.outcomes
                .lock()
                .unwrap()
                .get(&instance.id)
                .copied()
                .unwrap_or(ProbeOutcome::Healthy)
        }
    }

    fn checker(probes: Arc<ScriptedProbes>, deregister_after_secs: u64) -> HealthChecker {
        let config = ServiceMeshConfig {
            deregister_after_secs,
            ..Default::default()
        };
        HealthChecker::new(probes, &config)
    }

    #[tokio::test]
    async fn test_outcomes_update_status() {
        let probes = Arc::new(ScriptedProbes::default());
        let checker = checker(probes.clone(), 300);
        let a = test_instance("a", 10);
        let b = test_instance("b", 10);
        let c = test_instance("c", 10);
        let m = test_instance("m", 10);
        m.set_status(InstanceStatus::Maintenance);
        probes.set("b", ProbeOutcome::Degraded);
        probes.set("c", ProbeOutcome::Unhealthy);
        probes.set("m", ProbeOutcome::Unhealthy);

        let report = checker
            .check_instances(&[a.clone(), b.clone(), c.clone(), m.clone()])
            .await;
        assert_eq!(report.healthy, 1);
        assert_eq!(report.degraded, 1);
        assert_eq!(report.unhealthy, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.checked(), 3);
        assert!(report.expired.is_empty());

        assert_eq!(a.status(), InstanceStatus::Healthy);
        assert_eq!(b.status(), InstanceStatus::Degraded);
        assert_eq!(c.status(), InstanceStatus::Unhealthy);
        assert_eq!(m.status(), InstanceStatus::Maintenance);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prolonged_unhealthiness_expires() {
        let probes = Arc::new(ScriptedProbes::default());
        let checker = checker(probes.clone(), 60);
        let a = test_instance("a", 10);
        probes.set("a", ProbeOutcome::Unhealthy);

        assert!(checker.check_instances(&[a.clone()]).await.expired.is_empty());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(checker.check_instances(&[a.clone()]).await.expired.is_empty());

        // Recovery resets the clock.
        probes.set("a", ProbeOutcome::Healthy);
        checker.check_instances(&[a.clone()]).await;
        probes.set("a", ProbeOutcome::Unhealthy);
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(checker.check_instances(&[a.clone()]).await.expired.is_empty());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(checker.check_instances(&[a.clone()]).await.expired, vec!["a".to_string()]);
    }
}
