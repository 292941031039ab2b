//! Service registry.
//!
//! # Responsibilities
//! - Track instances per logical service
//! - Route calls to one instance through the service's circuit breaker
//! - Run one health loop and one auto-scaler loop per service while it has
//!   instances
//!
//! # Design Decisions
//! - Instance lists are copy-on-write snapshots; loops iterate a snapshot and
//!   never the live list
//! - Membership changes for one service are serialized by that service's lock
//! - A service's loops start with its first instance and stop with its last

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant};

use crate::config::validation::{ensure_valid, validate_service_mesh};
use crate::config::{LoadBalancingStrategy, ServiceMeshConfig};
use crate::error::{FabricError, FabricResult};
use crate::health::{HealthChecker, HealthReport};
use crate::lifecycle::TaskGroup;
use crate::load_balancer::{
    self, InstanceSnapshot, InstanceSpec, InstanceStatus, LoadBalancer, RequestGuard,
    ServiceInstance,
};
use crate::mesh::autoscaler::{
    self, ScalingDirection, ScalingIntent, ScalingPolicy, ScalingState,
};
use crate::mesh::discovery::DiscoveryClient;
use crate::mesh::transport::ServiceTransport;
use crate::observability::metrics;
use crate::resilience::circuit_breaker::CircuitBreakerStatus;
use crate::resilience::CircuitBreakerManager;
use crate::state::DistributedStateStore;

/// Store component segment for membership snapshots.
pub const STORE_COMPONENT: &str = "service_registry";

/// How long a deregistration waits for the service loops to exit.
const LOOP_STOP_DEADLINE: Duration = Duration::from_secs(5);

/// Breaker name guarding calls to `service`.
pub fn breaker_name(service: &str) -> String {
    format!("service:{}", service)
}

#[derive(Debug, Default)]
struct PoolTasks {
    group: Option<TaskGroup>,
    retired: bool,
}

/// A dispatched call holding its instance slot.
///
/// Dropped before `finish`, it records a failed response so cancelled calls
/// still show up in the instance's response statistics.
struct InFlightCall {
    guard: RequestGuard,
    start: Instant,
    finished: bool,
}

impl InFlightCall {
    fn new(guard: RequestGuard) -> Self {
        Self {
            guard,
            start: Instant::now(),
            finished: false,
        }
    }

    /// Release the slot, recording the response unless `success` is `None`.
    fn finish(mut self, success: Option<bool>) {
        self.finished = true;
        if let Some(success) = success {
            self.guard.record_response(self.start.elapsed(), success);
        }
    }
}

impl Drop for InFlightCall {
    fn drop(&mut self) {
        if !self.finished {
            self.guard.record_response(self.start.elapsed(), false);
        }
    }
}

/// Instances of one service plus its loop handles.
#[derive(Debug)]
struct ServicePool {
    name: String,
    balancer: Box<dyn LoadBalancer>,
    instances: ArcSwap<Vec<Arc<ServiceInstance>>>,
    membership: Mutex<()>,
    scaling: Mutex<ScalingState>,
    tasks: Mutex<PoolTasks>,
}

impl ServicePool {
    fn new(name: &str, strategy: LoadBalancingStrategy) -> Self {
        Self {
            name: name.to_string(),
            balancer: load_balancer::build(strategy),
            instances: ArcSwap::from_pointee(Vec::new()),
            membership: Mutex::new(()),
            scaling: Mutex::new(ScalingState::default()),
            tasks: Mutex::new(PoolTasks::default()),
        }
    }

    fn snapshot(&self) -> Arc<Vec<Arc<ServiceInstance>>> {
        self.instances.load_full()
    }

    fn is_empty(&self) -> bool {
        self.instances.load().is_empty()
    }

    fn find(&self, instance_id: &str) -> Option<Arc<ServiceInstance>> {
        self.instances
            .load()
            .iter()
            .find(|i| i.id == instance_id)
            .cloned()
    }

    /// Add or replace an instance. Returns the replaced one.
    fn insert(&self, instance: Arc<ServiceInstance>) -> Option<Arc<ServiceInstance>> {
        let _guard = self.membership.lock().expect("pool membership mutex poisoned");
        let mut next = (**self.instances.load()).clone();
        let replaced = match next.iter().position(|i| i.id == instance.id) {
            Some(index) => Some(std::mem::replace(&mut next[index], instance)),
            None => {
                next.push(instance);
                None
            }
        };
        self.instances.store(Arc::new(next));
        replaced
    }

    fn remove(&self, instance_id: &str) -> Option<Arc<ServiceInstance>> {
        let _guard = self.membership.lock().expect("pool membership mutex poisoned");
        let mut next = (**self.instances.load()).clone();
        let index = next.iter().position(|i| i.id == instance_id)?;
        let removed = next.remove(index);
        self.instances.store(Arc::new(next));
        self.balancer.forget(instance_id);
        Some(removed)
    }

    /// Mark the pool detached and hand back its loops.
    fn retire(&self) -> Option<TaskGroup> {
        let mut tasks = self.tasks.lock().expect("pool tasks mutex poisoned");
        tasks.retired = true;
        tasks.group.take()
    }

    fn loops_running(&self) -> bool {
        self.tasks
            .lock()
            .expect("pool tasks mutex poisoned")
            .group
            .is_some()
    }
}

/// Per-service view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub average_load: f64,
    pub loops_running: bool,
    pub instances: Vec<InstanceSnapshot>,
    pub breaker: Option<CircuitBreakerStatus>,
}

/// Whole-registry view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryStatus {
    pub strategy: LoadBalancingStrategy,
    pub total_services: usize,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub services: Vec<ServiceStatus>,
}

#[derive(Debug)]
struct RegistryInner {
    config: ServiceMeshConfig,
    services: DashMap<String, Arc<ServicePool>>,
    breakers: Arc<CircuitBreakerManager>,
    transport: Arc<dyn ServiceTransport>,
    health: HealthChecker,
    policy: ScalingPolicy,
    store: Option<Arc<DistributedStateStore>>,
    discovery: Option<DiscoveryClient>,
    intents: mpsc::UnboundedSender<ScalingIntent>,
    closed: AtomicBool,
}

/// Registry of logical services and their instances. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl ServiceRegistry {
    /// Build a registry. The receiver yields scaling intents for the external
    /// orchestrator.
    pub fn new(
        config: ServiceMeshConfig,
        breakers: Arc<CircuitBreakerManager>,
        transport: Arc<dyn ServiceTransport>,
        store: Option<Arc<DistributedStateStore>>,
        discovery: Option<DiscoveryClient>,
    ) -> FabricResult<(Self, mpsc::UnboundedReceiver<ScalingIntent>)> {
        ensure_valid(&config, validate_service_mesh)?;
        let (intents, rx) = mpsc::unbounded_channel();
        let inner = RegistryInner {
            health: HealthChecker::new(transport.clone(), &config),
            policy: ScalingPolicy::from_config(&config),
            config,
            services: DashMap::new(),
            breakers,
            transport,
            store,
            discovery,
            intents,
            closed: AtomicBool::new(false),
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            rx,
        ))
    }

    pub fn config(&self) -> &ServiceMeshConfig {
        &self.inner.config
    }

    fn pool(&self, service: &str) -> Option<Arc<ServicePool>> {
        self.inner.services.get(service).map(|p| p.value().clone())
    }

    /// Add (or replace) an instance of `service`. The first instance of a
    /// service starts its health and auto-scaler loops.
    pub async fn register_service(&self, service: &str, spec: InstanceSpec) -> FabricResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(FabricError::ServiceUnavailable(service.to_string()));
        }
        let instance = Arc::new(ServiceInstance::new(
            service,
            spec,
            self.inner.config.default_max_requests,
        )?);

        // Insert under the map entry lock so a concurrent removal of the last
        // instance cannot retire the pool underneath us.
        let (pool, replaced) = {
            let entry = self
                .inner
                .services
                .entry(service.to_string())
                .or_insert_with(|| {
                    Arc::new(ServicePool::new(service, self.inner.config.load_balancing))
                });
            let pool = entry.value().clone();
            let replaced = pool.insert(instance.clone());
            (pool, replaced)
        };

        tracing::info!(
            service = %service,
            instance = %instance.id,
            address = %instance.base_url,
            priority = instance.priority,
            replaced = replaced.is_some(),
            "Instance registered"
        );

        self.start_loops(&pool);
        if let Some(discovery) = &self.inner.discovery {
            discovery.register(&instance).await;
        }
        self.persist_pool(&pool);
        Ok(())
    }

    /// Remove an instance. Returns false when it was not registered.
    pub async fn deregister_service(&self, service: &str, instance_id: &str) -> bool {
        self.remove_instance(service, instance_id, false).await.is_some()
    }

    async fn remove_instance(
        &self,
        service: &str,
        instance_id: &str,
        from_loop: bool,
    ) -> Option<Arc<ServiceInstance>> {
        let pool = self.pool(service)?;
        let removed = pool.remove(instance_id)?;
        tracing::info!(service = %service, instance = %instance_id, "Instance deregistered");

        let retired = self
            .inner
            .services
            .remove_if(service, |_, p| Arc::ptr_eq(p, &pool) && p.is_empty());
        if retired.is_some() {
            if let Some(group) = pool.retire() {
                // A loop cannot await its own handle.
                if from_loop {
                    group.cancel();
                } else {
                    group.stop(LOOP_STOP_DEADLINE).await;
                }
                tracing::info!(service = %service, "Last instance removed, service loops stopped");
            }
        }

        if let Some(discovery) = &self.inner.discovery {
            discovery.deregister(instance_id).await;
        }
        self.persist_pool(&pool);
        Some(removed)
    }

    fn start_loops(&self, pool: &Arc<ServicePool>) {
        let mut tasks = pool.tasks.lock().expect("pool tasks mutex poisoned");
        if tasks.retired || tasks.group.is_some() {
            return;
        }

        let mut group = TaskGroup::new();
        let registry = self.clone();
        let health_pool = pool.clone();
        group.spawn(format!("health:{}", pool.name), move |shutdown| {
            registry.run_health_loop(health_pool, shutdown)
        });
        let registry = self.clone();
        let scaling_pool = pool.clone();
        group.spawn(format!("autoscale:{}", pool.name), move |shutdown| {
            registry.run_autoscale_loop(scaling_pool, shutdown)
        });
        tasks.group = Some(group);
        tracing::debug!(service = %pool.name, "Service loops started");
    }

    async fn run_health_loop(self, pool: Arc<ServicePool>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.inner.config.health_check_interval();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_pool(&pool, true).await;
                }
                _ = shutdown.recv() => {
                    tracing::debug!(service = %pool.name, "Health loop stopping");
                    break;
                }
            }
        }
    }

    async fn run_autoscale_loop(self, pool: Arc<ServicePool>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.inner.config.autoscale_interval();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scale_pool(&pool, true).await;
                }
                _ = shutdown.recv() => {
                    tracing::debug!(service = %pool.name, "Auto-scaler loop stopping");
                    break;
                }
            }
        }
    }

    /// Reserve a slot on an instance chosen by the balancer, preferring the
    /// requested priority tier.
    fn acquire_instance(&self, pool: &ServicePool, priority: Option<u8>) -> Option<RequestGuard> {
        let snapshot = pool.snapshot();
        let tier: Vec<Arc<ServiceInstance>> = match priority {
            Some(p) => snapshot
                .iter()
                .filter(|i| i.priority == p && i.is_selectable())
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        let candidates = if tier.is_empty() {
            snapshot.as_slice()
        } else {
            tier.as_slice()
        };

        // A pick can lose the slot race; retry at most once per candidate.
        for _ in 0..candidates.len() {
            let chosen = pool.balancer.select_instance(candidates)?;
            if let Some(guard) = chosen.try_acquire() {
                return Some(guard);
            }
        }
        None
    }

    /// Call one instance of `service` through its circuit breaker.
    ///
    /// `timeout` bounds each attempt (default: the mesh call timeout). Fails with
    /// `ServiceUnavailable` when no Healthy instance has spare capacity.
    pub async fn call_service(
        &self,
        service: &str,
        payload: Value,
        timeout: Option<Duration>,
        priority: Option<u8>,
    ) -> FabricResult<Value> {
        let guard = match self
            .pool(service)
            .and_then(|pool| self.acquire_instance(&pool, priority))
        {
            Some(guard) => guard,
            None => {
                tracing::warn!(service = %service, "No healthy instance available");
                metrics::record_service_call(service, "unavailable");
                return Err(FabricError::ServiceUnavailable(service.to_string()));
            }
        };

        let instance = guard.instance().clone();
        let breaker = self.inner.breakers.get_or_create(&breaker_name(service));
        let timeout = timeout.unwrap_or_else(|| self.inner.config.call_timeout());
        let transport = self.inner.transport.clone();

        tracing::debug!(
            service = %service,
            instance = %instance.id,
            load_factor = instance.load_factor(),
            "Dispatching call"
        );
        let in_flight = InFlightCall::new(guard);
        let result = breaker
            .call(
                || {
                    let transport = transport.clone();
                    let instance = instance.clone();
                    let payload = payload.clone();
                    async move { transport.invoke(&instance, &payload, timeout).await }
                },
                Some(timeout),
            )
            .await;

        match &result {
            Ok(_) => {
                in_flight.finish(Some(true));
                metrics::record_service_call(service, "success");
            }
            Err(FabricError::CircuitOpen { .. }) => {
                in_flight.finish(None);
                metrics::record_service_call(service, "rejected");
            }
            Err(_) => {
                in_flight.finish(Some(false));
                metrics::record_service_call(service, "failure");
            }
        }
        result
    }

    /// Set an instance's status. Returns the previous status, or `None` when
    /// the instance is unknown.
    pub fn set_instance_status(
        &self,
        service: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Option<InstanceStatus> {
        let instance = self.pool(service)?.find(instance_id)?;
        let previous = instance.set_status(status);
        if previous != status {
            tracing::info!(
                service = %service,
                instance = %instance_id,
                from = previous.as_str(),
                to = status.as_str(),
                "Instance status set"
            );
        }
        Some(previous)
    }

    /// Refresh an instance's heartbeat. Returns false when unknown.
    pub fn heartbeat(&self, service: &str, instance_id: &str) -> bool {
        match self.pool(service).and_then(|p| p.find(instance_id)) {
            Some(instance) => {
                instance.heartbeat();
                true
            }
            None => false,
        }
    }

    pub fn get_instances(&self, service: &str) -> Vec<InstanceSnapshot> {
        self.pool(service)
            .map(|pool| pool.snapshot().iter().map(|i| i.snapshot()).collect())
            .unwrap_or_default()
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.services.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    fn pool_status(&self, pool: &ServicePool) -> ServiceStatus {
        let instances: Vec<InstanceSnapshot> = pool.snapshot().iter().map(|i| i.snapshot()).collect();
        let loads: Vec<f64> = instances.iter().map(|i| i.load_factor).collect();
        ServiceStatus {
            name: pool.name.clone(),
            total_instances: instances.len(),
            healthy_instances: instances
                .iter()
                .filter(|i| i.status == InstanceStatus::Healthy)
                .count(),
            average_load: autoscaler::average_load(&loads),
            loops_running: pool.loops_running(),
            breaker: self
                .inner
                .breakers
                .get(&breaker_name(&pool.name))
                .map(|b| b.get_status()),
            instances,
        }
    }

    pub fn get_service_status(&self, service: &str) -> Option<ServiceStatus> {
        self.pool(service).map(|pool| self.pool_status(&pool))
    }

    pub fn get_registry_status(&self) -> RegistryStatus {
        let services: Vec<ServiceStatus> = self
            .service_names()
            .iter()
            .filter_map(|name| self.get_service_status(name))
            .collect();
        RegistryStatus {
            strategy: self.inner.config.load_balancing,
            total_services: services.len(),
            total_instances: services.iter().map(|s| s.total_instances).sum(),
            healthy_instances: services.iter().map(|s| s.healthy_instances).sum(),
            services,
        }
    }

    /// Probe every instance of `service` once and deregister expired ones.
    pub async fn check_service_health(&self, service: &str) -> Option<HealthReport> {
        let pool = self.pool(service)?;
        Some(self.check_pool(&pool, false).await)
    }

    async fn check_pool(&self, pool: &ServicePool, from_loop: bool) -> HealthReport {
        let snapshot = pool.snapshot();
        let report = self.inner.health.check_instances(&snapshot).await;
        tracing::trace!(
            service = %pool.name,
            healthy = report.healthy,
            unhealthy = report.unhealthy,
            "Health check pass complete"
        );
        for instance_id in &report.expired {
            self.remove_instance(&pool.name, instance_id, from_loop).await;
        }
        report
    }

    /// Run one auto-scaling evaluation for `service`.
    pub async fn evaluate_scaling(&self, service: &str) -> Option<ScalingIntent> {
        let pool = self.pool(service)?;
        self.scale_pool(&pool, false).await
    }

    async fn scale_pool(&self, pool: &ServicePool, from_loop: bool) -> Option<ScalingIntent> {
        let snapshot = pool.snapshot();
        let loads: Vec<f64> = snapshot.iter().map(|i| i.load_factor()).collect();
        let now = Instant::now();

        let direction = {
            let mut state = pool.scaling.lock().expect("scaling state mutex poisoned");
            let direction = self.inner.policy.decide(&loads, &state, now)?;
            state.record(direction, now);
            direction
        };

        let average = autoscaler::average_load(&loads);
        let mut intent = ScalingIntent::new(&pool.name, direction, snapshot.len(), average);
        if direction == ScalingDirection::Down {
            let victim = snapshot
                .iter()
                .min_by(|a, b| a.load_factor().total_cmp(&b.load_factor()))?;
            self.remove_instance(&pool.name, &victim.id, from_loop).await;
            intent.instance_id = Some(victim.id.clone());
        }

        tracing::info!(
            service = %pool.name,
            direction = direction.as_str(),
            current = intent.current_instances,
            desired = intent.desired_instances,
            average_load = average,
            "Scaling intent issued"
        );
        metrics::record_scaling_intent(&pool.name, direction.as_str());
        if self.inner.intents.send(intent.clone()).is_err() {
            tracing::debug!(service = %pool.name, "No orchestrator listening for scaling intents");
        }
        self.persist(autoscaler::STORE_COMPONENT, &pool.name, intent.clone());
        Some(intent)
    }

    fn persist_pool(&self, pool: &ServicePool) {
        let instances: Vec<InstanceSnapshot> = pool.snapshot().iter().map(|i| i.snapshot()).collect();
        self.persist(STORE_COMPONENT, &pool.name, instances);
    }

    /// Advisory snapshot write in the background.
    fn persist<T: Serialize + Send + Sync + 'static>(&self, component: &'static str, id: &str, value: T) {
        let Some(store) = self.inner.store.clone() else {
            return;
        };
        if !store.is_healthy() {
            return;
        }
        let key = store.key(component, id);
        tokio::spawn(async move {
            if let Err(e) = store.set(&key, &value, None, false).await {
                tracing::warn!(key = %key, error = %e, "Failed to persist registry snapshot");
                metrics::record_persistence_failure(component);
            }
        });
    }

    /// Stop every service loop and refuse further registrations.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let pools: Vec<Arc<ServicePool>> =
            self.inner.services.iter().map(|p| p.value().clone()).collect();
        for pool in pools {
            if let Some(group) = pool.retire() {
                group.stop(LOOP_STOP_DEADLINE).await;
            }
        }
        tracing::info!("Service registry stopped");
    }
}
