//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, intervals > 0)
//! - Detect inconsistent combinations (watermarks out of order, min > max)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Each section validates independently so components can check their own
//!   config at construction time

use crate::config::schema::{
    BackpressureConfig, CircuitBreakerConfig, FabricConfig, FailoverConfig, ServiceMeshConfig,
    StateStoreConfig, StoreBackendKind,
};
use crate::error::FabricError;

/// A single semantic configuration violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Collapse a list of violations into a construction error.
pub fn into_fabric_error(errors: Vec<ValidationError>) -> FabricError {
    let joined = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    FabricError::Config(joined)
}

/// Run a section validator, failing construction on any violation.
pub fn ensure_valid<C>(
    config: &C,
    validate: fn(&C, &mut Vec<ValidationError>),
) -> Result<(), FabricError> {
    let mut errors = Vec::new();
    validate(config, &mut errors);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(into_fabric_error(errors))
    }
}

fn check(errors: &mut Vec<ValidationError>, ok: bool, field: &str, message: &str) {
    if !ok {
        errors.push(ValidationError::new(field, message));
    }
}

fn is_fraction(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

/// Validate the whole configuration tree.
pub fn validate_config(config: &FabricConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check(
        &mut errors,
        !config.app_name.is_empty() && !config.app_name.contains(':'),
        "app_name",
        "must be non-empty and must not contain ':'",
    );
    validate_state_store(&config.state_store, &mut errors);
    validate_circuit_breaker(&config.circuit_breaker, &mut errors);
    validate_backpressure(&config.backpressure, &mut errors);
    validate_service_mesh(&config.service_mesh, &mut errors);
    validate_failover(&config.failover, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn validate_state_store(config: &StateStoreConfig, errors: &mut Vec<ValidationError>) {
    check(
        errors,
        config.health_check_interval_secs > 0,
        "state_store.health_check_interval_secs",
        "must be greater than 0",
    );
    check(
        errors,
        config.operation_timeout_ms > 0,
        "state_store.operation_timeout_ms",
        "must be greater than 0",
    );
    if config.backend == StoreBackendKind::Redis {
        check(
            errors,
            config.url.starts_with("redis://") || config.url.starts_with("rediss://"),
            "state_store.url",
            "must be a redis:// or rediss:// URL",
        );
    }
}

pub fn validate_circuit_breaker(config: &CircuitBreakerConfig, errors: &mut Vec<ValidationError>) {
    check(
        errors,
        config.failure_threshold > 0,
        "circuit_breaker.failure_threshold",
        "must be greater than 0",
    );
    check(
        errors,
        config.success_threshold > 0,
        "circuit_breaker.success_threshold",
        "must be greater than 0",
    );
    check(
        errors,
        config.max_attempts > 0,
        "circuit_breaker.max_attempts",
        "must be at least 1",
    );
    check(
        errors,
        config.base_delay_ms <= config.max_delay_ms,
        "circuit_breaker.base_delay_ms",
        "must not exceed max_delay_ms",
    );
    check(
        errors,
        config.backoff_base >= 1.0,
        "circuit_breaker.backoff_base",
        "must be at least 1.0",
    );
    check(
        errors,
        is_fraction(config.jitter_ratio),
        "circuit_breaker.jitter_ratio",
        "must be within [0, 1]",
    );
    check(
        errors,
        config.call_timeout_ms > 0,
        "circuit_breaker.call_timeout_ms",
        "must be greater than 0",
    );
    check(
        errors,
        config.window_size > 0,
        "circuit_breaker.window_size",
        "must be greater than 0",
    );
    check(
        errors,
        config.half_open_max_calls > 0,
        "circuit_breaker.half_open_max_calls",
        "must be greater than 0",
    );
    check(
        errors,
        config.metrics_ttl_secs > 0,
        "circuit_breaker.metrics_ttl_secs",
        "must be greater than 0",
    );
}

pub fn validate_backpressure(config: &BackpressureConfig, errors: &mut Vec<ValidationError>) {
    check(
        errors,
        config.max_queue_size > 0,
        "backpressure.max_queue_size",
        "must be greater than 0",
    );
    for (field, value) in [
        ("backpressure.low_watermark", config.low_watermark),
        ("backpressure.high_watermark", config.high_watermark),
        ("backpressure.delay_threshold", config.delay_threshold),
        ("backpressure.drop_threshold", config.drop_threshold),
    ] {
        check(errors, is_fraction(value), field, "must be within [0, 1]");
    }
    check(
        errors,
        config.low_watermark <= config.high_watermark,
        "backpressure.low_watermark",
        "must not exceed high_watermark",
    );
    check(
        errors,
        config.high_watermark <= config.delay_threshold,
        "backpressure.high_watermark",
        "must not exceed delay_threshold",
    );
    check(
        errors,
        config.delay_threshold <= config.drop_threshold,
        "backpressure.delay_threshold",
        "must not exceed drop_threshold",
    );
    check(
        errors,
        config.metrics_ttl_secs > 0,
        "backpressure.metrics_ttl_secs",
        "must be greater than 0",
    );
}

pub fn validate_service_mesh(config: &ServiceMeshConfig, errors: &mut Vec<ValidationError>) {
    check(
        errors,
        config.health_check_interval_secs > 0,
        "service_mesh.health_check_interval_secs",
        "must be greater than 0",
    );
    check(
        errors,
        config.health_check_timeout_ms > 0,
        "service_mesh.health_check_timeout_ms",
        "must be greater than 0",
    );
    check(
        errors,
        config.autoscale_interval_secs > 0,
        "service_mesh.autoscale_interval_secs",
        "must be greater than 0",
    );
    check(
        errors,
        config.default_max_requests > 0,
        "service_mesh.default_max_requests",
        "must be greater than 0",
    );
    check(
        errors,
        config.min_instances <= config.max_instances,
        "service_mesh.min_instances",
        "must not exceed max_instances",
    );
    check(
        errors,
        is_fraction(config.scale_up_threshold) && is_fraction(config.scale_down_threshold),
        "service_mesh.scale_up_threshold",
        "scale thresholds must be within [0, 1]",
    );
    check(
        errors,
        config.scale_down_threshold < config.scale_up_threshold,
        "service_mesh.scale_down_threshold",
        "must be lower than scale_up_threshold",
    );
}

pub fn validate_failover(config: &FailoverConfig, errors: &mut Vec<ValidationError>) {
    check(
        errors,
        config.failure_threshold > 0,
        "failover.failure_threshold",
        "must be greater than 0",
    );
    check(
        errors,
        config.recovery_threshold > 0,
        "failover.recovery_threshold",
        "must be greater than 0",
    );
    check(
        errors,
        config.primary_timeout_ms > 0 && config.backup_timeout_ms > 0,
        "failover.backup_timeout_ms",
        "primary and backup timeouts must be greater than 0",
    );
    check(
        errors,
        !config.enable_partial_results || config.partial_result_ttl_secs > 0,
        "failover.partial_result_ttl_secs",
        "must be greater than 0 when partial results are enabled",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&FabricConfig::default()).is_ok());
    }

    #[test]
    fn test_watermarks_out_of_order() {
        let mut config = FabricConfig::default();
        config.backpressure.delay_threshold = 0.97;
        config.backpressure.drop_threshold = 0.9;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "backpressure.delay_threshold");
    }

    #[test]
    fn test_collects_every_error() {
        let mut config = FabricConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        config.service_mesh.min_instances = 5;
        config.service_mesh.max_instances = 2;
        config.service_mesh.scale_down_threshold = 0.9;
        config.failover.recovery_threshold = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"circuit_breaker.failure_threshold"));
        assert!(fields.contains(&"service_mesh.min_instances"));
        assert!(fields.contains(&"service_mesh.scale_down_threshold"));
        assert!(fields.contains(&"failover.recovery_threshold"));

        let err = into_fabric_error(errors);
        assert!(err.to_string().starts_with("invalid configuration:"));
    }

    #[test]
    fn test_zero_ttls_are_rejected() {
        let mut config = FabricConfig::default();
        config.circuit_breaker.metrics_ttl_secs = 0;
        config.backpressure.metrics_ttl_secs = 0;
        config.failover.partial_result_ttl_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "circuit_breaker.metrics_ttl_secs",
                "backpressure.metrics_ttl_secs",
                "failover.partial_result_ttl_secs",
            ]
        );

        // Without partial results the cache TTL is never used.
        config.circuit_breaker.metrics_ttl_secs = 60;
        config.backpressure.metrics_ttl_secs = 60;
        config.failover.enable_partial_results = false;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_half_open_cap_and_store_url() {
        let mut config = FabricConfig::default();
        config.circuit_breaker.half_open_max_calls = 0;
        config.state_store.backend = StoreBackendKind::Redis;
        config.state_store.url = "http://cache:6379".into();

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["state_store.url", "circuit_breaker.half_open_max_calls"]
        );

        config.circuit_breaker.half_open_max_calls = 2;
        config.state_store.url = "redis://cache:6379/0".into();
        assert!(validate_config(&config).is_ok());
    }
}
