//! Circuit breaker for dependency protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - Half-Open: a bounded number of trial calls test whether the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= failure_threshold
//! Open → Half-Open: now - last_failure_time >= open_timeout
//! Half-Open → Closed: success_count >= success_threshold
//! Half-Open → Open: any failure
//! ```
//!
//! # Design Decisions
//! - One breaker per named dependency, state behind its own lock
//! - Fail fast in Open state without invoking the operation
//! - A retried call is one outcome for the state machine
//! - Half-Open trials run a single attempt, at most `half_open_max_calls` at once
//! - A call dropped before it settles counts as a timeout failure
//! - Metrics snapshots are persisted in the background and never fail a call

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::validation::{ensure_valid, validate_circuit_breaker};
use crate::config::CircuitBreakerConfig;
use crate::error::{FabricError, FabricResult, FailureKind};
use crate::observability::metrics;
use crate::resilience::retries::{retry_with_backoff, RetryPolicy};
use crate::state::DistributedStateStore;

/// Store component segment for breaker snapshots.
pub const STORE_COMPONENT: &str = "circuit_breaker";

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Circuit breaker states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Aggregate call metrics of one breaker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerMetrics {
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Calls refused while open.
    pub total_rejections: u64,
    /// Extra attempts spent on retries.
    pub total_retries: u64,
    pub state_transitions: u64,
    pub avg_latency_ms: f64,
    pub failures_by_kind: BTreeMap<String, u64>,
}

impl BreakerMetrics {
    fn record_latency(&mut self, latency: Duration) {
        let completed = (self.total_successes + self.total_failures) as f64;
        let sample = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms += (sample - self.avg_latency_ms) / completed.max(1.0);
    }
}

/// Point-in-time view of a breaker. Reading it never changes the breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
    pub last_failure_at_ms: Option<u64>,
    pub last_state_change_at_ms: u64,
    /// Remaining open time, only while open.
    pub retry_after_ms: Option<u64>,
    /// Outcomes currently in the sliding window.
    pub window_len: usize,
    pub window_success_rate: f64,
    pub metrics: BreakerMetrics,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    last_failure_at_ms: Option<u64>,
    last_state_change_at_ms: u64,
    /// Recent outcomes, `true` = success.
    window: VecDeque<bool>,
    /// Trial calls currently running in Half-Open.
    half_open_in_flight: u32,
    metrics: BreakerMetrics,
}

/// Admission for one protected call.
///
/// Dropping a permit that was never settled records a timeout failure, so a
/// caller abandoning the call under its own deadline still trips the breaker.
/// Trial permits give their Half-Open slot back on drop.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    start: std::time::Instant,
    /// Transition count at admission, set for Half-Open trials.
    trial_epoch: Option<u64>,
    settled: bool,
}

impl CallPermit<'_> {
    fn is_trial(&self) -> bool {
        self.trial_epoch.is_some()
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let elapsed = self.start.elapsed();
            tracing::warn!(
                breaker = %self.breaker.name,
                elapsed_ms = elapsed.as_millis() as u64,
                "Protected call abandoned before completion"
            );
            self.breaker.record_failure(FailureKind::Timeout, elapsed, 1);
            metrics::record_breaker_call(&self.breaker.name, "cancelled", self.start);
        }
        if let Some(epoch) = self.trial_epoch {
            self.breaker.release_trial(epoch);
        }
    }
}

/// A named circuit breaker wrapping calls with retry, timeout and fail-fast.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    policy: RetryPolicy,
    trial_policy: RetryPolicy,
    inner: Mutex<BreakerInner>,
    store: Option<Arc<DistributedStateStore>>,
}

impl CircuitBreaker {
    /// Create a breaker, validating its configuration.
    pub fn new(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        store: Option<Arc<DistributedStateStore>>,
    ) -> FabricResult<Self> {
        ensure_valid(&config, validate_circuit_breaker)?;
        Ok(Self::from_validated(name.into(), config, store))
    }

    pub(crate) fn from_validated(
        name: String,
        config: CircuitBreakerConfig,
        store: Option<Arc<DistributedStateStore>>,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config);
        let trial_policy = RetryPolicy {
            max_attempts: 1,
            ..policy.clone()
        };
        let window = VecDeque::with_capacity(config.window_size);
        Self {
            name,
            config,
            policy,
            trial_policy,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
                last_failure_at_ms: None,
                last_state_change_at_ms: now_ms(),
                window,
                half_open_in_flight: 0,
                metrics: BreakerMetrics::default(),
            }),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state without evaluating the open timeout.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().expect("circuit breaker mutex poisoned")
    }

    /// Execute `operation` through the breaker.
    ///
    /// Fails with `CircuitOpen` without invoking `operation` while the circuit is
    /// open and the open timeout has not elapsed, or while every Half-Open trial
    /// slot is taken. Otherwise retries per policy, each attempt bounded by
    /// `timeout` (or the configured call timeout). Half-Open trials get one attempt.
    pub async fn call<T, F, Fut>(&self, operation: F, timeout: Option<Duration>) -> FabricResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, crate::error::CallFailure>>,
    {
        let start = std::time::Instant::now();
        let permit = match self.acquire_permission(start) {
            Ok(permit) => permit,
            Err(e) => {
                metrics::record_breaker_call(&self.name, "rejected", start);
                return Err(e);
            }
        };

        let attempt_timeout = timeout.unwrap_or_else(|| self.config.call_timeout());
        let policy = if permit.is_trial() {
            &self.trial_policy
        } else {
            &self.policy
        };
        let outcome = retry_with_backoff(&self.name, policy, attempt_timeout, operation).await;
        let latency = start.elapsed();

        let result = match outcome.result {
            Ok(value) => {
                self.record_success(latency, outcome.attempts);
                metrics::record_breaker_call(&self.name, "success", start);
                Ok(value)
            }
            Err(failure) => {
                tracing::debug!(
                    breaker = %self.name,
                    kind = %failure.kind,
                    attempts = outcome.attempts,
                    error = %failure.message,
                    "Protected call failed"
                );
                self.record_failure(failure.kind, latency, outcome.attempts);
                metrics::record_breaker_call(&self.name, "failure", start);
                Err(FabricError::Call(failure))
            }
        };
        permit.settle();

        self.persist_metrics();
        result
    }

    /// Admit or reject a call, moving Open → Half-Open once the timeout elapsed.
    ///
    /// The call that performs that transition takes the first trial slot.
    fn acquire_permission(&self, start: std::time::Instant) -> FabricResult<CallPermit<'_>> {
        let mut inner = self.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_calls {
                    inner.metrics.total_rejections += 1;
                    tracing::debug!(
                        breaker = %self.name,
                        in_flight = inner.half_open_in_flight,
                        "Half-open trial slots taken, rejecting call"
                    );
                    return Err(FabricError::CircuitOpen {
                        name: self.name.clone(),
                        retry_after: Duration::ZERO,
                    });
                }
                true
            }
            CircuitState::Open => {
                let open_timeout = self.config.open_timeout();
                let elapsed = inner
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(open_timeout);
                if elapsed < open_timeout {
                    inner.metrics.total_rejections += 1;
                    return Err(FabricError::CircuitOpen {
                        name: self.name.clone(),
                        retry_after: open_timeout - elapsed,
                    });
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                true
            }
        };

        let trial_epoch = trial.then(|| {
            inner.half_open_in_flight += 1;
            inner.metrics.state_transitions
        });
        Ok(CallPermit {
            breaker: self,
            start,
            trial_epoch,
            settled: false,
        })
    }

    /// Free a Half-Open slot taken at `epoch`. Slots from an earlier
    /// Half-Open period were already cleared by the transition.
    fn release_trial(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.metrics.state_transitions == epoch {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    fn push_outcome(&self, inner: &mut BreakerInner, success: bool) {
        if inner.window.len() >= self.config.window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(success);
    }

    fn record_success(&self, latency: Duration, attempts: u32) {
        let mut inner = self.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.total_successes += 1;
        inner.metrics.total_retries += u64::from(attempts.saturating_sub(1));
        inner.metrics.record_latency(latency);
        self.push_outcome(&mut inner, true);

        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // Opened by a concurrent call while this one was in flight.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, kind: FailureKind, latency: Duration, attempts: u32) {
        let mut inner = self.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.total_failures += 1;
        inner.metrics.total_retries += u64::from(attempts.saturating_sub(1));
        inner.metrics.record_latency(latency);
        *inner
            .metrics
            .failures_by_kind
            .entry(kind.as_str().to_string())
            .or_insert(0) += 1;
        self.push_outcome(&mut inner, false);

        inner.failure_count += 1;
        inner.last_failure_time = Some(Instant::now());
        inner.last_failure_at_ms = Some(now_ms());

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.last_state_change_at_ms = now_ms();
        inner.metrics.state_transitions += 1;

        match to {
            CircuitState::Open => {
                inner.success_count = 0;
                tracing::warn!(
                    breaker = %self.name,
                    from = from.as_str(),
                    failures = inner.failure_count,
                    "Circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_in_flight = 0;
                tracing::info!(breaker = %self.name, "Circuit half-open, admitting trial calls");
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                tracing::info!(breaker = %self.name, from = from.as_str(), "Circuit closed");
            }
        }
        metrics::record_breaker_state(&self.name, to as u8);
    }

    /// Snapshot of state and metrics.
    pub fn get_status(&self) -> CircuitBreakerStatus {
        let inner = self.lock();
        let retry_after_ms = match (inner.state, inner.last_failure_time) {
            (CircuitState::Open, Some(t)) => Some(
                self.config
                    .open_timeout()
                    .saturating_sub(t.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };
        let successes = inner.window.iter().filter(|ok| **ok).count();
        let window_success_rate = if inner.window.is_empty() {
            1.0
        } else {
            successes as f64 / inner.window.len() as f64
        };

        CircuitBreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            open_timeout_ms: self.config.open_timeout_ms,
            last_failure_at_ms: inner.last_failure_at_ms,
            last_state_change_at_ms: inner.last_state_change_at_ms,
            retry_after_ms,
            window_len: inner.window.len(),
            window_success_rate,
            metrics: inner.metrics.clone(),
        }
    }

    /// Force the circuit closed and clear counters and the window.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure_time = None;
        inner.window.clear();
        tracing::info!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Force the circuit open for a full open timeout.
    pub fn force_open(&self) {
        let mut inner = self.lock();
        inner.last_failure_time = Some(Instant::now());
        inner.last_failure_at_ms = Some(now_ms());
        self.transition(&mut inner, CircuitState::Open);
    }

    /// Write the current snapshot to the store in the background.
    ///
    /// Skipped while the store reports unhealthy. Failures are logged and counted.
    pub fn persist_metrics(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if !store.is_healthy() {
            tracing::trace!(breaker = %self.name, "Store unhealthy, skipping metrics snapshot");
            return;
        }
        let status = self.get_status();
        let key = store.key(STORE_COMPONENT, &self.name);
        let ttl = self.config.metrics_ttl();
        tokio::spawn(async move {
            if let Err(e) = store.set(&key, &status, Some(ttl), false).await {
                tracing::warn!(key = %key, error = %e, "Failed to persist circuit breaker metrics");
                metrics::record_persistence_failure(STORE_COMPONENT);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateStoreConfig;
    use crate::error::CallFailure;
    use crate::state::MemoryBackend;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(failure_threshold: u32, success_threshold: u32, open_timeout_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            open_timeout_ms,
            max_attempts: 1,
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter_ratio: 0.0,
            ..Default::default()
        }
    }

    async fn fail(cb: &CircuitBreaker) -> FabricResult<()> {
        cb.call(
            || async { Err::<(), _>(CallFailure::new(FailureKind::Unavailable, "down")) },
            None,
        )
        .await
    }

    async fn succeed(cb: &CircuitBreaker) -> FabricResult<u32> {
        cb.call(|| async { Ok(1) }, None).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = CircuitBreaker::new("pricing", config(3, 2, 1_000), None).unwrap();
        for _ in 0..3 {
            assert!(matches!(fail(&cb).await, Err(FabricError::Call(_))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = cb
            .call(
                || {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                None,
            )
            .await;
        assert!(matches!(result, Err(FabricError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.get_status().metrics.total_rejections, 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let result = cb
            .call(
                || {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                None,
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_success_threshold() {
        let cb = CircuitBreaker::new("svc", config(1, 3, 500), None).unwrap();
        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(600)).await;

        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.get_status().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("svc", config(2, 3, 500), None).unwrap();
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(600)).await;

        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.get_status().success_count, 0);
        assert!(matches!(succeed(&cb).await, Err(FabricError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_success_resets_failures_in_closed() {
        let cb = CircuitBreaker::new("svc", config(3, 1, 500), None).unwrap();
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        succeed(&cb).await.unwrap();
        fail(&cb).await.unwrap_err();
        fail(&cb).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.get_status().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_status_is_idempotent() {
        let cb = CircuitBreaker::new("svc", config(1, 1, 100), None).unwrap();
        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let first = cb.get_status();
        let second = cb.get_status();
        assert_eq!(first.state, CircuitState::Open);
        assert_eq!(first.failure_count, second.failure_count);
        assert_eq!(first.metrics, second.metrics);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_count_as_one_outcome() {
        let mut cfg = config(2, 1, 1_000);
        cfg.max_attempts = 3;
        let cb = CircuitBreaker::new("svc", cfg, None).unwrap();
        let calls = AtomicU32::new(0);

        let result: FabricResult<()> = cb
            .call(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(CallFailure::new(FailureKind::Network, "reset")) }
                },
                None,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cb.state(), CircuitState::Closed);

        let status = cb.get_status();
        assert_eq!(status.failure_count, 1);
        assert_eq!(status.metrics.total_retries, 2);
        assert_eq!(status.metrics.failures_by_kind.get("network"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new("slow", config(1, 1, 1_000), None).unwrap();
        let result: FabricResult<()> = cb
            .call(
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                },
                Some(Duration::from_millis(50)),
            )
            .await;
        match result {
            Err(FabricError::Call(failure)) => assert_eq!(failure.kind, FailureKind::Timeout),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_counts_as_timeout() {
        let cb = CircuitBreaker::new("abandoned", config(2, 1, 1_000), None).unwrap();
        for expected in 1..=2u64 {
            let outer = tokio::time::timeout(
                Duration::from_millis(50),
                cb.call(
                    || async {
                        tokio::time::sleep(Duration::from_secs(3_600)).await;
                        Ok(())
                    },
                    Some(Duration::from_secs(3_600)),
                ),
            )
            .await;
            assert!(outer.is_err(), "outer deadline fires first");
            let status = cb.get_status();
            assert_eq!(status.metrics.total_failures, expected);
            assert_eq!(status.metrics.failures_by_kind.get("timeout"), Some(&expected));
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_limited_trials() {
        let cb = Arc::new(CircuitBreaker::new("svc", config(1, 2, 500), None).unwrap());
        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let gate = Arc::new(tokio::sync::Notify::new());
        let trial = {
            let (cb, gate) = (cb.clone(), gate.clone());
            tokio::spawn(async move {
                cb.call(
                    || {
                        let gate = gate.clone();
                        async move {
                            gate.notified().await;
                            Ok::<_, CallFailure>(7)
                        }
                    },
                    Some(Duration::from_secs(60)),
                )
                .await
            })
        };
        while cb.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }

        match succeed(&cb).await {
            Err(FabricError::CircuitOpen { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::ZERO)
            }
            other => panic!("second trial admitted: {:?}", other),
        }
        assert_eq!(cb.get_status().metrics.total_rejections, 1);

        gate.notify_one();
        assert_eq!(trial.await.unwrap().unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // The finished trial freed its slot.
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_is_not_retried() {
        let mut cfg = config(1, 1, 500);
        cfg.max_attempts = 3;
        let cb = CircuitBreaker::new("svc", cfg, None).unwrap();
        fail(&cb).await.unwrap_err();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let calls = AtomicU32::new(0);
        let result: FabricResult<()> = cb
            .call(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(CallFailure::new(FailureKind::Network, "reset")) }
                },
                None,
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_reset_and_force_open() {
        let cb = CircuitBreaker::new("svc", config(5, 1, 60_000), None).unwrap();
        cb.force_open();
        assert!(matches!(succeed(&cb).await, Err(FabricError::CircuitOpen { .. })));

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(succeed(&cb).await.unwrap(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = CircuitBreaker::new("svc", config(0, 1, 10), None).unwrap_err();
        assert!(matches!(err, FabricError::Config(_)));
    }

    #[tokio::test]
    async fn test_metrics_persisted_to_store() {
        let store = Arc::new(
            DistributedStateStore::new("app", StateStoreConfig::default(), Arc::new(MemoryBackend::new()))
                .unwrap(),
        );
        let cb = CircuitBreaker::new("persisted", config(3, 1, 1_000), Some(store.clone())).unwrap();
        succeed(&cb).await.unwrap();

        let key = store.key(STORE_COMPONENT, "persisted");
        let mut snapshot = None;
        for _ in 0..50 {
            snapshot = store.try_get::<CircuitBreakerStatus>(&key).await.unwrap();
            if snapshot.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot = snapshot.expect("snapshot persisted");
        assert_eq!(snapshot.metrics.total_successes, 1);
        assert_eq!(snapshot.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_store_outage_does_not_fail_calls() {
        let backend = Arc::new(MemoryBackend::new());
        let store = Arc::new(
            DistributedStateStore::new("app", StateStoreConfig::default(), backend.clone()).unwrap(),
        );
        backend.set_available(false);
        let cb = CircuitBreaker::new("svc", config(3, 1, 1_000), Some(store)).unwrap();
        assert_eq!(succeed(&cb).await.unwrap(), 1);
    }
}
