//! Service instance abstraction.
//!
//! # Responsibilities
//! - Represent a single registered instance of a logical service
//! - Track in-flight requests and enforce `max_requests`
//! - Track health status, heartbeat and rolling response statistics

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use url::Url;

use crate::error::{FabricError, FabricResult};
use crate::resilience::circuit_breaker::now_ms;

/// Smoothing factor for the response time average.
const RESPONSE_EWMA_ALPHA: f64 = 0.3;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Healthy = 0,
    Unhealthy = 1,
    Degraded = 2,
    Maintenance = 3,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Degraded => "degraded",
            InstanceStatus::Maintenance => "maintenance",
        }
    }
}

impl From<u8> for InstanceStatus {
    fn from(val: u8) -> Self {
        match val {
            0 => InstanceStatus::Healthy,
            2 => InstanceStatus::Degraded,
            3 => InstanceStatus::Maintenance,
            _ => InstanceStatus::Unhealthy,
        }
    }
}

/// Registration input for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub health_check_path: String,
    /// Lower is preferred when a caller asks for a tier.
    pub priority: u8,
    pub weight: u32,
    /// `None` uses the registry default.
    pub max_requests: Option<usize>,
    pub metadata: HashMap<String, String>,
}

impl InstanceSpec {
    pub fn new(instance_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            instance_id: instance_id.into(),
            host: host.into(),
            port,
            health_check_path: "/health".to_string(),
            priority: 1,
            weight: 1,
            max_requests: None,
            metadata: HashMap::new(),
        }
    }

    pub fn health_check_path(mut self, path: impl Into<String>) -> Self {
        self.health_check_path = path.into();
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn max_requests(mut self, max_requests: usize) -> Self {
        self.max_requests = Some(max_requests);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Default)]
struct ResponseStats {
    calls: u64,
    successes: u64,
    avg_response_ms: Option<f64>,
}

/// A single instance of a logical service.
#[derive(Debug)]
pub struct ServiceInstance {
    pub id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub health_check_path: String,
    pub priority: u8,
    pub weight: u32,
    pub max_requests: usize,
    pub metadata: HashMap<String, String>,
    /// Pre-calculated base URL.
    pub base_url: Url,
    pub registered_at_ms: u64,

    status: AtomicU8,
    active_requests: AtomicUsize,
    last_heartbeat_ms: AtomicU64,
    unhealthy_since: Mutex<Option<Instant>>,
    stats: Mutex<ResponseStats>,
}

impl ServiceInstance {
    pub fn new(service_name: &str, spec: InstanceSpec, default_max_requests: usize) -> FabricResult<Self> {
        let base_url = Url::parse(&format!("http://{}:{}", spec.host, spec.port)).map_err(|e| {
            FabricError::Config(format!(
                "instance '{}' has an invalid address {}:{}: {}",
                spec.instance_id, spec.host, spec.port, e
            ))
        })?;
        let max_requests = spec.max_requests.unwrap_or(default_max_requests);
        if max_requests == 0 {
            return Err(FabricError::Config(format!(
                "instance '{}' must allow at least one request",
                spec.instance_id
            )));
        }
        let now = now_ms();
        Ok(Self {
            id: spec.instance_id,
            service_name: service_name.to_string(),
            host: spec.host,
            port: spec.port,
            health_check_path: spec.health_check_path,
            priority: spec.priority,
            weight: spec.weight,
            max_requests,
            metadata: spec.metadata,
            base_url,
            registered_at_ms: now,
            status: AtomicU8::new(InstanceStatus::Healthy as u8),
            active_requests: AtomicUsize::new(0),
            last_heartbeat_ms: AtomicU64::new(now),
            unhealthy_since: Mutex::new(None),
            stats: Mutex::new(ResponseStats::default()),
        })
    }

    /// URL for `path` on this instance.
    pub fn url(&self, path: &str) -> FabricResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| FabricError::Config(format!("invalid path '{}': {}", path, e)))
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus::from(self.status.load(Ordering::Relaxed))
    }

    /// Set the status, returning the previous one.
    pub fn set_status(&self, status: InstanceStatus) -> InstanceStatus {
        let previous = InstanceStatus::from(self.status.swap(status as u8, Ordering::Relaxed));
        if status != InstanceStatus::Unhealthy {
            *self.unhealthy_since.lock().expect("unhealthy_since mutex poisoned") = None;
        }
        previous
    }

    /// Record a successful probe or an explicit heartbeat.
    pub fn mark_healthy(&self) -> InstanceStatus {
        self.heartbeat();
        self.set_status(InstanceStatus::Healthy)
    }

    pub fn mark_degraded(&self) -> InstanceStatus {
        self.heartbeat();
        self.set_status(InstanceStatus::Degraded)
    }

    /// Record a failed probe. Returns the previous status and how long the
    /// instance has been continuously unhealthy.
    pub fn mark_unhealthy(&self, now: Instant) -> (InstanceStatus, Duration) {
        let previous = InstanceStatus::from(
            self.status
                .swap(InstanceStatus::Unhealthy as u8, Ordering::Relaxed),
        );
        let mut since = self.unhealthy_since.lock().expect("unhealthy_since mutex poisoned");
        let started = *since.get_or_insert(now);
        (previous, now.saturating_duration_since(started))
    }

    pub fn heartbeat(&self) {
        self.last_heartbeat_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        self.last_heartbeat_ms.load(Ordering::Relaxed)
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn has_capacity(&self) -> bool {
        self.active_requests() < self.max_requests
    }

    /// Active requests over the configured maximum.
    pub fn load_factor(&self) -> f64 {
        self.active_requests() as f64 / self.max_requests as f64
    }

    /// Healthy and below `max_requests`.
    pub fn is_selectable(&self) -> bool {
        self.status() == InstanceStatus::Healthy && self.has_capacity()
    }

    /// Reserve one request slot. `None` when the instance is at capacity.
    pub fn try_acquire(self: &Arc<Self>) -> Option<RequestGuard> {
        let mut prev = self.active_requests.load(Ordering::Relaxed);
        loop {
            if prev >= self.max_requests {
                return None;
            }
            match self.active_requests.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        Some(RequestGuard {
            instance: self.clone(),
        })
    }

    /// Fold one call outcome into the rolling statistics.
    pub fn record_response(&self, elapsed: Duration, success: bool) {
        let mut stats = self.stats.lock().expect("response stats mutex poisoned");
        stats.calls += 1;
        if success {
            stats.successes += 1;
        }
        let sample = elapsed.as_secs_f64() * 1000.0;
        stats.avg_response_ms = Some(match stats.avg_response_ms {
            Some(avg) => avg + RESPONSE_EWMA_ALPHA * (sample - avg),
            None => sample,
        });
    }

    pub fn avg_response_time(&self) -> Option<Duration> {
        self.stats
            .lock()
            .expect("response stats mutex poisoned")
            .avg_response_ms
            .map(|ms| Duration::from_secs_f64(ms / 1000.0))
    }

    /// Fraction of successful calls; 1.0 before the first call.
    pub fn success_rate(&self) -> f64 {
        let stats = self.stats.lock().expect("response stats mutex poisoned");
        if stats.calls == 0 {
            1.0
        } else {
            stats.successes as f64 / stats.calls as f64
        }
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let (calls, avg_response_ms) = {
            let stats = self.stats.lock().expect("response stats mutex poisoned");
            (stats.calls, stats.avg_response_ms)
        };
        InstanceSnapshot {
            instance_id: self.id.clone(),
            service_name: self.service_name.clone(),
            host: self.host.clone(),
            port: self.port,
            health_check_path: self.health_check_path.clone(),
            status: self.status(),
            priority: self.priority,
            weight: self.weight,
            active_requests: self.active_requests(),
            max_requests: self.max_requests,
            load_factor: self.load_factor(),
            last_heartbeat_ms: self.last_heartbeat_ms(),
            calls,
            success_rate: self.success_rate(),
            avg_response_ms,
            metadata: self.metadata.clone(),
        }
    }
}

/// Serializable view of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub health_check_path: String,
    pub status: InstanceStatus,
    pub priority: u8,
    pub weight: u32,
    pub active_requests: usize,
    pub max_requests: usize,
    pub load_factor: f64,
    pub last_heartbeat_ms: u64,
    pub calls: u64,
    pub success_rate: f64,
    pub avg_response_ms: Option<f64>,
    pub metadata: HashMap<String, String>,
}

/// A RAII guard that holds one request slot on an instance.
#[derive(Debug)]
pub struct RequestGuard {
    instance: Arc<ServiceInstance>,
}

impl RequestGuard {
    pub fn instance(&self) -> &Arc<ServiceInstance> {
        &self.instance
    }
}

impl Deref for RequestGuard {
    type Target = ServiceInstance;
    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.instance.active_requests.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
pub(crate) fn test_instance(id: &str, max_requests: usize) -> Arc<ServiceInstance> {
    Arc::new(
        ServiceInstance::new(
            "svc",
            InstanceSpec::new(id, "127.0.0.1", 8080).max_requests(max_requests),
            100,
        )
        .unwrap(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_enforces_max_requests() {
        let instance = test_instance("a", 2);
        let g1 = instance.try_acquire().unwrap();
        let g2 = instance.try_acquire().unwrap();
        assert!(instance.try_acquire().is_none());
        assert_eq!(instance.load_factor(), 1.0);
        assert!(!instance.is_selectable());

        drop(g1);
        assert_eq!(instance.active_requests(), 1);
        assert!(instance.is_selectable());
        drop(g2);
        assert_eq!(instance.load_factor(), 0.0);
    }

    #[test]
    fn test_status_transitions() {
        let instance = test_instance("a", 10);
        assert_eq!(instance.status(), InstanceStatus::Healthy);

        let t0 = Instant::now();
        let (previous, unhealthy_for) = instance.mark_unhealthy(t0);
        assert_eq!(previous, InstanceStatus::Healthy);
        assert_eq!(unhealthy_for, Duration::ZERO);

        let (_, unhealthy_for) = instance.mark_unhealthy(t0 + Duration::from_secs(30));
        assert_eq!(unhealthy_for, Duration::from_secs(30));

        assert_eq!(instance.mark_healthy(), InstanceStatus::Unhealthy);
        let (_, unhealthy_for) = instance.mark_unhealthy(t0 + Duration::from_secs(40));
        assert_eq!(unhealthy_for, Duration::ZERO);

        instance.set_status(InstanceStatus::Maintenance);
        assert!(!instance.is_selectable());
    }

    #[test]
    fn test_response_stats() {
        let instance = test_instance("a", 10);
        assert_eq!(instance.success_rate(), 1.0);
        assert!(instance.avg_response_time().is_none());

        instance.record_response(Duration::from_millis(100), true);
        instance.record_response(Duration::from_millis(200), false);
        assert_eq!(instance.success_rate(), 0.5);
        let avg = instance.avg_response_time().unwrap();
        assert!(avg > Duration::from_millis(100) && avg < Duration::from_millis(200));

        let snapshot = instance.snapshot();
        assert_eq!(snapshot.calls, 2);
        assert_eq!(snapshot.status, InstanceStatus::Healthy);
    }

    #[test]
    fn test_urls() {
        let instance = test_instance("a", 10);
        assert_eq!(
            instance.url("/process").unwrap().as_str(),
            "http://127.0.0.1:8080/process"
        );
    }

    #[test]
    fn test_invalid_address_rejected() {
        let spec = InstanceSpec::new("bad", "not a host", 80);
        assert!(ServiceInstance::new("svc", spec, 10).is_err());
    }
}
