//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the fabric.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// Root configuration for the resilience fabric.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Application namespace used as the first segment of every store key.
    pub app_name: String,

    /// Distributed state store settings.
    pub state_store: StateStoreConfig,

    /// Defaults for every circuit breaker.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Defaults for backpressure controllers.
    pub backpressure: BackpressureConfig,

    /// Service registry, health checking and auto-scaling.
    pub service_mesh: ServiceMeshConfig,

    /// Primary/backup failover.
    pub failover: FailoverConfig,

    /// Local service discovery agent.
    pub discovery: DiscoveryConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,

    /// Deadline for background tasks to stop on shutdown, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            app_name: "fabric".to_string(),
            state_store: StateStoreConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            backpressure: BackpressureConfig::default(),
            service_mesh: ServiceMeshConfig::default(),
            failover: FailoverConfig::default(),
            discovery: DiscoveryConfig::default(),
            observability: ObservabilityConfig::default(),
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl FabricConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Storage engine behind the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendKind {
    /// In-process map. State does not outlive the process.
    #[default]
    Memory,
    /// Shared Redis server or cluster proxy.
    Redis,
}

/// State store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StateStoreConfig {
    /// Storage engine.
    pub backend: StoreBackendKind,

    /// Connection URL for networked backends.
    pub url: String,

    /// TTL applied when a write does not specify one (0 = no expiry).
    pub default_ttl_secs: u64,

    /// Interval of the background health poll.
    pub health_check_interval_secs: u64,

    /// Deadline for a single backend operation.
    pub operation_timeout_ms: u64,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Memory,
            url: "redis://127.0.0.1:6379".to_string(),
            default_ttl_secs: 3600,
            health_check_interval_secs: 5,
            operation_timeout_ms: 2_000,
        }
    }
}

impl StateStoreConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_secs > 0).then(|| Duration::from_secs(self.default_ttl_secs))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (in Closed) before the circuit opens.
    pub failure_threshold: u32,

    /// Successes in Half-Open before the circuit closes.
    pub success_threshold: u32,

    /// Time the circuit stays open before admitting a trial call.
    pub open_timeout_ms: u64,

    /// Concurrent trial calls admitted while Half-Open.
    pub half_open_max_calls: u32,

    /// Attempts per call, the first one included.
    #[serde(alias = "max_retries")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff.
    pub base_delay_ms: u64,

    /// Cap for exponential backoff.
    pub max_delay_ms: u64,

    /// Exponent base for backoff growth.
    pub backoff_base: f64,

    /// Jitter as a fraction of the delay, applied in both directions.
    pub jitter_ratio: f64,

    /// Per-attempt timeout when the caller does not pass one.
    pub call_timeout_ms: u64,

    /// Number of recent outcomes kept for the success-rate window.
    pub window_size: usize,

    /// Failure kinds that are never retried.
    pub non_retryable: Vec<FailureKind>,

    /// TTL of the persisted metrics snapshot.
    pub metrics_ttl_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout_ms: 60_000,
            half_open_max_calls: 1,
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_base: 2.0,
            jitter_ratio: 0.1,
            call_timeout_ms: 30_000,
            window_size: 100,
            non_retryable: vec![FailureKind::Authorization, FailureKind::NotFound],
            metrics_ttl_secs: 3600,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn metrics_ttl(&self) -> Duration {
        Duration::from_secs(self.metrics_ttl_secs)
    }

    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        !self.non_retryable.contains(&kind)
    }
}

/// Backpressure controller configuration.
///
/// Watermarks are fractions of `max_queue_size`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub max_queue_size: usize,

    /// Occupancy at or below which pressure is considered relieved.
    pub low_watermark: f64,

    /// Occupancy at or above which the controller reports pressure.
    pub high_watermark: f64,

    /// Occupancy at or above which producers are delayed.
    pub delay_threshold: f64,

    /// Occupancy at or above which items are dropped.
    pub drop_threshold: f64,

    /// Upper bound of a producer delay.
    pub max_delay_ms: u64,

    /// TTL of the persisted counters snapshot.
    pub metrics_ttl_secs: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            low_watermark: 0.5,
            high_watermark: 0.8,
            delay_threshold: 0.9,
            drop_threshold: 0.95,
            max_delay_ms: 1_000,
            metrics_ttl_secs: 3600,
        }
    }
}

impl BackpressureConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Load balancing algorithm used by a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    ResponseTime,
}

/// Service registry, health checking and auto-scaling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceMeshConfig {
    pub load_balancing: LoadBalancingStrategy,

    /// Interval of the per-service health loop.
    pub health_check_interval_secs: u64,

    /// Deadline for one health probe.
    pub health_check_timeout_ms: u64,

    /// Continuous unhealthiness after which an instance is deregistered.
    pub deregister_after_secs: u64,

    /// Default request limit for instances registered without one.
    pub default_max_requests: usize,

    /// Default timeout for `call_service`.
    pub call_timeout_ms: u64,

    pub min_instances: usize,
    pub max_instances: usize,

    /// Mean load factor above which a scale-up intent is emitted.
    pub scale_up_threshold: f64,

    /// Mean load factor below which an instance is removed.
    pub scale_down_threshold: f64,

    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,

    /// Interval of the per-service auto-scaler loop.
    pub autoscale_interval_secs: u64,
}

impl Default for ServiceMeshConfig {
    fn default() -> Self {
        Self {
            load_balancing: LoadBalancingStrategy::RoundRobin,
            health_check_interval_secs: 30,
            health_check_timeout_ms: 5_000,
            deregister_after_secs: 300,
            default_max_requests: 100,
            call_timeout_ms: 30_000,
            min_instances: 1,
            max_instances: 10,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_up_cooldown_secs: 300,
            scale_down_cooldown_secs: 600,
            autoscale_interval_secs: 60,
        }
    }
}

impl ServiceMeshConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn deregister_after(&self) -> Duration {
        Duration::from_secs(self.deregister_after_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn autoscale_interval(&self) -> Duration {
        Duration::from_secs(self.autoscale_interval_secs)
    }
}

/// How the failover manager decides to leave the primary path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStrategy {
    /// Fail over after `failure_threshold` consecutive primary failures.
    #[default]
    Threshold,
    /// Fail over on the first primary failure.
    Immediate,
    /// Run the primary through a circuit breaker and fail over as soon as it rejects.
    CircuitBreaker,
}

/// Failover configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub strategy: FailoverStrategy,

    /// Consecutive primary failures before switching to backup.
    pub failure_threshold: u32,

    /// Consecutive primary successes (in backup mode) before switching back.
    pub recovery_threshold: u32,

    /// Serve cached results when both paths fail.
    pub enable_partial_results: bool,

    pub primary_timeout_ms: u64,
    pub backup_timeout_ms: u64,

    /// Minimum spacing of primary probes while in backup mode.
    pub recovery_check_interval_ms: u64,

    /// TTL of cached results used for partial responses.
    pub partial_result_ttl_secs: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            strategy: FailoverStrategy::Threshold,
            failure_threshold: 3,
            recovery_threshold: 5,
            enable_partial_results: true,
            primary_timeout_ms: 30_000,
            backup_timeout_ms: 30_000,
            recovery_check_interval_ms: 30_000,
            partial_result_ttl_secs: 3600,
        }
    }
}

impl FailoverConfig {
    pub fn primary_timeout(&self) -> Duration {
        Duration::from_millis(self.primary_timeout_ms)
    }

    pub fn backup_timeout(&self) -> Duration {
        Duration::from_millis(self.backup_timeout_ms)
    }

    pub fn recovery_check_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_check_interval_ms)
    }

    pub fn partial_result_ttl(&self) -> Duration {
        Duration::from_secs(self.partial_result_ttl_secs)
    }
}

/// Local discovery agent configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Mirror registrations to the local agent.
    pub enabled: bool,

    /// Loopback base URL of the agent HTTP API.
    pub agent_address: String,

    /// Health check interval requested from the agent.
    pub check_interval_secs: u64,

    /// Health check timeout requested from the agent.
    pub check_timeout_secs: u64,

    /// Agent-side deregistration of critical services.
    pub deregister_critical_after_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            agent_address: "http://127.0.0.1:8500".to_string(),
            check_interval_secs: 10,
            check_timeout_secs: 5,
            deregister_critical_after_secs: 60,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
