//! Primary/backup failover.
//!
//! # Responsibilities
//! - Route each call to the active path of a service
//! - Fail over after repeated primary failures; fail back after repeated
//!   successful recovery probes
//! - Serve cached results when both paths fail
//!
//! # Design Decisions
//! - In-memory flags are authoritative; the store only holds advisory snapshots
//!   and the result cache
//! - A primary failure below the threshold still falls through to the backup
//!   for that call, without switching modes
//! - In backup mode the primary is probed at most once per
//!   `recovery_check_interval`

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::validation::{ensure_valid, validate_failover};
use crate::config::{FailoverConfig, FailoverStrategy};
use crate::error::{CallFailure, FabricError, FabricResult};
use crate::observability::metrics;
use crate::resilience::circuit_breaker::now_ms;
use crate::resilience::timeouts::with_timeout;
use crate::resilience::CircuitBreakerManager;
use crate::state::DistributedStateStore;
use crate::status::CallStatus;

/// Store component for cached results.
pub const RESULT_COMPONENT: &str = "failover";
/// Store component for state snapshots.
pub const STATE_COMPONENT: &str = "failover_state";

/// Breaker name used by the circuit-breaker strategy.
pub fn breaker_name(service: &str) -> String {
    format!("failover:{}", service)
}

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Primary,
    Backup,
    Cache,
    None,
}

/// Structured outcome of `execute_with_failover`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverResult<T> {
    pub status: CallStatus,
    pub source: ResultSource,
    pub result: Option<T>,
    pub error: Option<String>,
}

impl<T> FailoverResult<T> {
    fn success(source: ResultSource, value: T) -> Self {
        Self {
            status: CallStatus::Success,
            source,
            result: Some(value),
            error: None,
        }
    }
}

/// Snapshot of one service's failover state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverStatus {
    pub service: String,
    pub strategy: FailoverStrategy,
    pub primary_active: bool,
    pub backup_active: bool,
    pub failure_count: u32,
    pub recovery_count: u32,
    pub failovers: u64,
    pub failbacks: u64,
    pub last_failover_at_ms: Option<u64>,
    pub last_failback_at_ms: Option<u64>,
}

#[derive(Debug)]
struct FailoverState {
    primary_active: bool,
    failure_count: u32,
    recovery_count: u32,
    failovers: u64,
    failbacks: u64,
    last_failover_at_ms: Option<u64>,
    last_failback_at_ms: Option<u64>,
    /// Start of the current recovery probe interval.
    last_probe: Option<Instant>,
}

impl Default for FailoverState {
    fn default() -> Self {
        Self {
            primary_active: true,
            failure_count: 0,
            recovery_count: 0,
            failovers: 0,
            failbacks: 0,
            last_failover_at_ms: None,
            last_failback_at_ms: None,
            last_probe: None,
        }
    }
}

enum Route {
    Primary,
    Probe,
    Backup,
}

#[derive(Debug)]
pub struct FailoverManager {
    config: FailoverConfig,
    states: DashMap<String, Arc<Mutex<FailoverState>>>,
    breakers: Arc<CircuitBreakerManager>,
    store: Option<Arc<DistributedStateStore>>,
}

impl FailoverManager {
    pub fn new(
        config: FailoverConfig,
        breakers: Arc<CircuitBreakerManager>,
        store: Option<Arc<DistributedStateStore>>,
    ) -> FabricResult<Self> {
        ensure_valid(&config, validate_failover)?;
        Ok(Self {
            config,
            states: DashMap::new(),
            breakers,
            store,
        })
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    fn state(&self, service: &str) -> Arc<Mutex<FailoverState>> {
        if let Some(state) = self.states.get(service) {
            return state.value().clone();
        }
        self.states
            .entry(service.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn lock(state: &Mutex<FailoverState>) -> MutexGuard<'_, FailoverState> {
        state.lock().expect("failover state mutex poisoned")
    }

    /// Run `primary` or `backup` for `service` according to its current mode.
    ///
    /// Fails with `FailoverExhausted` only when both paths failed and partial
    /// results are disabled; otherwise degradation is reported in the result.
    pub async fn execute_with_failover<T, P, PF, B, BF>(
        &self,
        service: &str,
        mut primary: P,
        backup: B,
    ) -> FabricResult<FailoverResult<T>>
    where
        T: Serialize + DeserializeOwned,
        P: FnMut() -> PF,
        PF: Future<Output = Result<T, CallFailure>>,
        B: FnOnce() -> BF,
        BF: Future<Output = Result<T, CallFailure>>,
    {
        let state = self.state(service);
        let route = self.route(&state);

        let primary_error = match route {
            Route::Backup => None,
            Route::Primary | Route::Probe => match self.run_primary(service, &mut primary).await {
                Ok(value) => {
                    self.on_primary_success(service, &state, matches!(route, Route::Probe));
                    self.cache_result(service, &value);
                    return Ok(FailoverResult::success(ResultSource::Primary, value));
                }
                Err(e) => {
                    self.on_primary_failure(service, &state, &e, matches!(route, Route::Probe));
                    Some(e.to_string())
                }
            },
        };

        match with_timeout(self.config.backup_timeout(), backup()).await {
            Ok(value) => {
                metrics::record_failover_event(service, "backup");
                self.cache_result(service, &value);
                Ok(FailoverResult::success(ResultSource::Backup, value))
            }
            Err(backup_error) => {
                let primary_error =
                    primary_error.unwrap_or_else(|| "not attempted (backup mode)".to_string());
                tracing::warn!(
                    service = %service,
                    primary_error = %primary_error,
                    backup_error = %backup_error,
                    "Primary and backup both failed"
                );
                self.degrade(service, primary_error, backup_error.to_string())
                    .await
            }
        }
    }

    fn route(&self, state: &Mutex<FailoverState>) -> Route {
        let mut s = Self::lock(state);
        if s.primary_active {
            return Route::Primary;
        }
        let now = Instant::now();
        let due = s.last_probe.map_or(true, |t| {
            now.saturating_duration_since(t) >= self.config.recovery_check_interval()
        });
        if due {
            s.last_probe = Some(now);
            Route::Probe
        } else {
            Route::Backup
        }
    }

    async fn run_primary<T, P, PF>(&self, service: &str, primary: &mut P) -> FabricResult<T>
    where
        P: FnMut() -> PF,
        PF: Future<Output = Result<T, CallFailure>>,
    {
        let timeout = self.config.primary_timeout();
        match self.config.strategy {
            FailoverStrategy::CircuitBreaker => {
                let breaker = self.breakers.get_or_create(&breaker_name(service));
                breaker.call(|| primary(), Some(timeout)).await
            }
            FailoverStrategy::Threshold | FailoverStrategy::Immediate => {
                Ok(with_timeout(timeout, primary()).await?)
            }
        }
    }

    fn on_primary_success(&self, service: &str, state: &Mutex<FailoverState>, probe: bool) {
        let mut s = Self::lock(state);
        s.failure_count = 0;
        if !probe || s.primary_active {
            return;
        }

        s.recovery_count += 1;
        tracing::info!(
            service = %service,
            recovery_count = s.recovery_count,
            recovery_threshold = self.config.recovery_threshold,
            "Primary recovery probe succeeded"
        );
        if s.recovery_count >= self.config.recovery_threshold {
            self.switch(service, &mut s, true);
        }
    }

    fn on_primary_failure(
        &self,
        service: &str,
        state: &Mutex<FailoverState>,
        error: &FabricError,
        probe: bool,
    ) {
        let mut s = Self::lock(state);
        if probe {
            s.recovery_count = 0;
            tracing::debug!(service = %service, error = %error, "Primary recovery probe failed");
            return;
        }
        if !s.primary_active {
            return;
        }

        s.failure_count += 1;
        let trip = match self.config.strategy {
            FailoverStrategy::Immediate => true,
            FailoverStrategy::CircuitBreaker => error.is_circuit_open(),
            FailoverStrategy::Threshold => false,
        } || s.failure_count >= self.config.failure_threshold;

        tracing::debug!(
            service = %service,
            failure_count = s.failure_count,
            error = %error,
            "Primary failed"
        );
        if trip {
            self.switch(service, &mut s, false);
        }
    }

    /// Flip modes. `to_primary` selects failback over failover.
    fn switch(&self, service: &str, s: &mut FailoverState, to_primary: bool) {
        s.primary_active = to_primary;
        s.failure_count = 0;
        s.recovery_count = 0;
        if to_primary {
            s.failbacks += 1;
            s.last_failback_at_ms = Some(now_ms());
            s.last_probe = None;
            tracing::info!(service = %service, "Failed back to primary");
            metrics::record_failover_event(service, "failback");
        } else {
            s.failovers += 1;
            s.last_failover_at_ms = Some(now_ms());
            // The next recovery probe waits a full interval.
            s.last_probe = Some(Instant::now());
            tracing::warn!(service = %service, "Failed over to backup");
            metrics::record_failover_event(service, "failover");
        }
        self.persist_state(self.status_of(service, s));
    }

    async fn degrade<T: DeserializeOwned>(
        &self,
        service: &str,
        primary_error: String,
        backup_error: String,
    ) -> FabricResult<FailoverResult<T>> {
        if !self.config.enable_partial_results {
            metrics::record_failover_event(service, "exhausted");
            return Err(FabricError::FailoverExhausted {
                service: service.to_string(),
                primary: primary_error,
                backup: backup_error,
            });
        }

        let error = format!("primary: {}; backup: {}", primary_error, backup_error);
        match self.cached_result(service).await {
            Some(value) => {
                metrics::record_failover_event(service, "partial");
                Ok(FailoverResult {
                    status: CallStatus::Partial,
                    source: ResultSource::Cache,
                    result: Some(value),
                    error: Some(error),
                })
            }
            None => {
                metrics::record_failover_event(service, "failed");
                Ok(FailoverResult {
                    status: CallStatus::Failed,
                    source: ResultSource::None,
                    result: None,
                    error: Some(error),
                })
            }
        }
    }

    async fn cached_result<T: DeserializeOwned>(&self, service: &str) -> Option<T> {
        let store = self.store.as_ref()?;
        let key = store.key(RESULT_COMPONENT, service);
        match store.try_get(&key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to read cached result");
                None
            }
        }
    }

    fn cache_result<T: Serialize>(&self, service: &str, value: &T) {
        if !self.config.enable_partial_results {
            return;
        }
        let encoded = match serde_json::to_value(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::debug!(service = %service, error = %e, "Result not cacheable");
                return;
            }
        };
        self.persist(RESULT_COMPONENT, service, encoded, self.config.partial_result_ttl());
    }

    fn persist_state(&self, status: FailoverStatus) {
        if let Ok(encoded) = serde_json::to_value(&status) {
            self.persist(STATE_COMPONENT, &status.service, encoded, self.config.partial_result_ttl());
        }
    }

    /// Advisory write in the background.
    fn persist(&self, component: &'static str, id: &str, value: serde_json::Value, ttl: Duration) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if !store.is_healthy() {
            return;
        }
        let key = store.key(component, id);
        tokio::spawn(async move {
            if let Err(e) = store.set(&key, &value, Some(ttl), false).await {
                tracing::warn!(key = %key, error = %e, "Failed to persist failover data");
                metrics::record_persistence_failure(component);
            }
        });
    }

    fn status_of(&self, service: &str, s: &FailoverState) -> FailoverStatus {
        FailoverStatus {
            service: service.to_string(),
            strategy: self.config.strategy,
            primary_active: s.primary_active,
            backup_active: !s.primary_active,
            failure_count: s.failure_count,
            recovery_count: s.recovery_count,
            failovers: s.failovers,
            failbacks: s.failbacks,
            last_failover_at_ms: s.last_failover_at_ms,
            last_failback_at_ms: s.last_failback_at_ms,
        }
    }

    /// Status of `service`. Unknown services report primary mode.
    pub fn get_status(&self, service: &str) -> FailoverStatus {
        match self.states.get(service) {
            Some(state) => self.status_of(service, &Self::lock(state.value())),
            None => self.status_of(service, &FailoverState::default()),
        }
    }

    pub fn all_statuses(&self) -> Vec<FailoverStatus> {
        let mut services: Vec<String> = self.states.iter().map(|s| s.key().clone()).collect();
        services.sort();
        services.iter().map(|s| self.get_status(s)).collect()
    }

    /// Switch `service` to backup now.
    pub fn force_failover(&self, service: &str) {
        let state = self.state(service);
        let mut s = Self::lock(&state);
        if s.primary_active {
            self.switch(service, &mut s, false);
        }
    }

    /// Switch `service` back to primary now.
    pub fn force_failback(&self, service: &str) {
        let state = self.state(service);
        let mut s = Self::lock(&state);
        if !s.primary_active {
            self.switch(service, &mut s, true);
        }
    }

    /// Forget everything about `service`.
    pub fn reset(&self, service: &str) {
        if self.states.remove(service).is_some() {
            tracing::info!(service = %service, "Failover state reset");
        }
        if let Some(breaker) = self.breakers.get(&breaker_name(service)) {
            breaker.reset();
        }
    }
}
