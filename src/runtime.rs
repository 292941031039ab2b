//! Runtime context.
//!
//! Built once at startup and handed to whatever needs a fabric component.
//! Owns the runtime-wide background tasks (store health, breaker metrics flush);
//! per-service loops belong to the registry.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::backpressure::BackpressureController;
use crate::config::validation::{into_fabric_error, validate_config};
use crate::config::FabricConfig;
use crate::error::FabricResult;
use crate::failover::{FailoverManager, FailoverResult};
use crate::lifecycle::TaskGroup;
use crate::mesh::{DiscoveryClient, ScalingIntent, ServiceRegistry, ServiceTransport};
use crate::resilience::CircuitBreakerManager;
use crate::state::{DistributedStateStore, StoreBackend};

/// How often breaker snapshots are written to the store.
const BREAKER_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct RuntimeContext {
    config: FabricConfig,
    store: Arc<DistributedStateStore>,
    breakers: Arc<CircuitBreakerManager>,
    registry: ServiceRegistry,
    failover: Arc<FailoverManager>,
    tasks: TaskGroup,
}

impl RuntimeContext {
    /// Validate `config`, build every component and start the runtime tasks.
    pub async fn start(
        config: FabricConfig,
        backend: Arc<dyn StoreBackend>,
        transport: Arc<dyn ServiceTransport>,
    ) -> FabricResult<(Self, mpsc::UnboundedReceiver<ScalingIntent>)> {
        validate_config(&config).map_err(into_fabric_error)?;

        let store = Arc::new(DistributedStateStore::new(
            config.app_name.clone(),
            config.state_store.clone(),
            backend,
        )?);
        let health = store.health_check().await;
        if !health.healthy {
            tracing::warn!(error = ?health.error, "State store unavailable at startup, running degraded");
        }

        let breakers = Arc::new(CircuitBreakerManager::new(
            config.circuit_breaker.clone(),
            Some(store.clone()),
        )?);
        let discovery = if config.discovery.enabled {
            Some(DiscoveryClient::new(config.discovery.clone())?)
        } else {
            None
        };
        let (registry, intents) = ServiceRegistry::new(
            config.service_mesh.clone(),
            breakers.clone(),
            transport,
            Some(store.clone()),
            discovery,
        )?;
        let failover = Arc::new(FailoverManager::new(
            config.failover.clone(),
            breakers.clone(),
            Some(store.clone()),
        )?);

        let mut tasks = TaskGroup::new();
        let monitored = store.clone();
        tasks.spawn("store-health", move |shutdown| monitored.run_health_monitor(shutdown));
        let flushed = breakers.clone();
        tasks.spawn("breaker-flush", move |shutdown| {
            flushed.run_metrics_flush(BREAKER_FLUSH_INTERVAL, shutdown)
        });

        tracing::info!(
            app = %config.app_name,
            strategy = ?config.service_mesh.load_balancing,
            discovery = config.discovery.enabled,
            "Fabric runtime started"
        );

        Ok((
            Self {
                config,
                store,
                breakers,
                registry,
                failover,
                tasks,
            },
            intents,
        ))
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DistributedStateStore> {
        &self.store
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn failover(&self) -> &Arc<FailoverManager> {
        &self.failover
    }

    /// A backpressure controller wired to the shared store.
    pub fn backpressure<T: Send>(&self, name: &str) -> FabricResult<BackpressureController<T>> {
        BackpressureController::new(name, self.config.backpressure.clone(), Some(self.store.clone()))
    }

    /// Call `service` through the registry, falling back to `backup_service`.
    pub async fn call_with_failover(
        &self,
        service: &str,
        backup_service: &str,
        payload: Value,
        priority: Option<u8>,
    ) -> FabricResult<FailoverResult<Value>> {
        let registry = &self.registry;
        let attempts = self.config.circuit_breaker.max_attempts;
        let primary_timeout = attempt_budget(self.config.failover.primary_timeout(), attempts);
        let backup_timeout = attempt_budget(self.config.failover.backup_timeout(), attempts);
        self.failover
            .execute_with_failover(
                service,
                || {
                    let payload = payload.clone();
                    async move {
                        registry
                            .call_service(service, payload, Some(primary_timeout), priority)
                            .await
                            .map_err(Into::into)
                    }
                },
                || async {
                    registry
                        .call_service(backup_service, payload.clone(), Some(backup_timeout), priority)
                        .await
                        .map_err(Into::into)
                },
            )
            .await
    }

    /// Stop the registry loops and the runtime tasks, waiting for them.
    pub async fn shutdown(self) {
        tracing::info!("Fabric runtime shutting down");
        self.registry.shutdown().await;
        self.tasks.stop(self.config.shutdown_timeout()).await;
        tracing::info!("Fabric runtime stopped");
    }
}

/// Per-attempt deadline that keeps every retry of a call inside `total`.
fn attempt_budget(total: Duration, attempts: u32) -> Duration {
    (total / attempts.max(1)).max(Duration::from_millis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CallFailure, FabricError};
    use crate::load_balancer::{InstanceSpec, ServiceInstance};
    use crate::mesh::ProbeOutcome;
    use crate::state::MemoryBackend;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl ServiceTransport for Echo {
        async fn invoke(
            &self,
            instance: &ServiceInstance,
            payload: &Value,
            _timeout: Duration,
        ) -> Result<Value, CallFailure> {
            Ok(serde_json::json!({ "from": instance.service_name, "payload": payload }))
        }

        async fn probe(&self, _instance: &ServiceInstance, _timeout: Duration) -> ProbeOutcome {
            ProbeOutcome::Healthy
        }
    }

    async fn start(config: FabricConfig) -> FabricResult<RuntimeContext> {
        RuntimeContext::start(config, Arc::new(MemoryBackend::new()), Arc::new(Echo))
            .await
            .map(|(ctx, _)| ctx)
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut config = FabricConfig::default();
        config.backpressure.drop_threshold = 0.5;
        assert!(matches!(start(config).await, Err(FabricError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_call_and_shutdown() {
        let ctx = start(FabricConfig::default()).await.unwrap();
        assert!(ctx.store().is_healthy());

        ctx.registry()
            .register_service("backup", InstanceSpec::new("b1", "127.0.0.1", 9001))
            .await
            .unwrap();
        // No primary instance: the backup serves and the primary counts a failure.
        let out = ctx
            .call_with_failover("primary", "backup", serde_json::json!({"x": 1}), None)
            .await
            .unwrap();
        assert_eq!(out.result.unwrap()["from"], "backup");
        assert_eq!(ctx.failover().get_status("primary").failure_count, 1);

        let queue = ctx.backpressure::<u32>("jobs").unwrap();
        assert!(queue.add_request(1).await.is_admitted());

        ctx.shutdown().await;
    }

    /// Never answers calls to "stuck"; echoes everything else.
    #[derive(Debug)]
    struct Stuck;

    #[async_trait]
    impl ServiceTransport for Stuck {
        async fn invoke(
            &self,
            instance: &ServiceInstance,
            payload: &Value,
            timeout: Duration,
        ) -> Result<Value, CallFailure> {
            if instance.service_name == "stuck" {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
            Echo.invoke(instance, payload, timeout).await
        }

        async fn probe(&self, _instance: &ServiceInstance, _timeout: Duration) -> ProbeOutcome {
            ProbeOutcome::Healthy
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_primary_trips_service_breaker() {
        let mut config = FabricConfig::default();
        config.circuit_breaker.failure_threshold = 3;
        config.failover.failure_threshold = 10;
        config.failover.primary_timeout_ms = 100;
        let (ctx, _intents) =
            RuntimeContext::start(config, Arc::new(MemoryBackend::new()), Arc::new(Stuck))
                .await
                .unwrap();
        ctx.registry()
            .register_service("stuck", InstanceSpec::new("s1", "127.0.0.1", 9001))
            .await
            .unwrap();
        ctx.registry()
            .register_service("spare", InstanceSpec::new("p1", "127.0.0.1", 9002))
            .await
            .unwrap();

        for _ in 0..4 {
            let out = ctx
                .call_with_failover("stuck", "spare", serde_json::json!({}), None)
                .await
                .unwrap();
            assert_eq!(out.result.unwrap()["from"], "spare");
        }

        let breaker = ctx.breakers().get("service:stuck").unwrap();
        let status = breaker.get_status();
        assert_eq!(status.state, crate::CircuitState::Open);
        assert_eq!(status.metrics.total_failures, 3);
        assert_eq!(status.metrics.failures_by_kind.get("timeout"), Some(&3));
        assert_eq!(status.metrics.total_rejections, 1);

        let instances = ctx.registry().get_instances("stuck");
        assert_eq!(instances[0].active_requests, 0);

        ctx.shutdown().await;
    }

    #[test]
    fn test_attempt_budget_fits_outer_deadline() {
        let total = Duration::from_millis(300);
        assert_eq!(attempt_budget(total, 3), Duration::from_millis(100));
        assert_eq!(attempt_budget(total, 0), total);
        assert_eq!(attempt_budget(Duration::ZERO, 3), Duration::from_millis(1));
    }
}
