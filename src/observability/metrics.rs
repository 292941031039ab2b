//! Metrics collection and exposition.
//!
//! # Metrics
//! - `fabric_breaker_state` (gauge): 0=closed, 1=open, 2=half-open
//! - `fabric_breaker_calls_total` (counter): calls by breaker and outcome
//! - `fabric_breaker_call_duration_seconds` (histogram)
//! - `fabric_backpressure_decisions_total` (counter): by queue and decision
//! - `fabric_backpressure_queue_depth` (gauge)
//! - `fabric_instance_health` (gauge): 1=healthy, 0=otherwise
//! - `fabric_service_calls_total` (counter): by service and outcome
//! - `fabric_scaling_intents_total` (counter): by service and direction
//! - `fabric_failover_events_total` (counter): by service and event
//! - `fabric_store_operations_total` (counter): by operation and outcome
//! - `fabric_persistence_failures_total` (counter): by component

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_breaker_state(breaker: &str, state_code: u8) {
    gauge!("fabric_breaker_state", "breaker" => breaker.to_string()).set(state_code as f64);
}

pub fn record_breaker_call(breaker: &str, outcome: &'static str, start: Instant) {
    counter!(
        "fabric_breaker_calls_total",
        "breaker" => breaker.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("fabric_breaker_call_duration_seconds", "breaker" => breaker.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_backpressure_decision(queue: &str, decision: &'static str) {
    counter!(
        "fabric_backpressure_decisions_total",
        "queue" => queue.to_string(),
        "decision" => decision
    )
    .increment(1);
}

pub fn record_queue_depth(queue: &str, depth: usize) {
    gauge!("fabric_backpressure_queue_depth", "queue" => queue.to_string()).set(depth as f64);
}

pub fn record_instance_health(service: &str, instance: &str, healthy: bool) {
    gauge!(
        "fabric_instance_health",
        "service" => service.to_string(),
        "instance" => instance.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_service_call(service: &str, outcome: &'static str) {
    counter!(
        "fabric_service_calls_total",
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_scaling_intent(service: &str, direction: &'static str) {
    counter!(
        "fabric_scaling_intents_total",
        "service" => service.to_string(),
        "direction" => direction
    )
    .increment(1);
}

pub fn record_failover_event(service: &str, event: &'static str) {
    counter!(
        "fabric_failover_events_total",
        "service" => service.to_string(),
        "event" => event
    )
    .increment(1);
}

pub fn record_store_operation(operation: &'static str, success: bool) {
    counter!(
        "fabric_store_operations_total",
        "operation" => operation,
        "outcome" => if success { "ok" } else { "error" }
    )
    .increment(1);
}

pub fn record_persistence_failure(component: &'static str) {
    counter!("fabric_persistence_failures_total", "component" => component).increment(1);
}
