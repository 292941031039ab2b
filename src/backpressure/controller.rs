//! Watermark-based admission control for one queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::validation::{ensure_valid, validate_backpressure};
use crate::config::BackpressureConfig;
use crate::error::{FabricError, FabricResult};
use crate::observability::metrics;
use crate::state::DistributedStateStore;
use crate::status::CallStatus;

/// Store component segment for controller snapshots.
pub const STORE_COMPONENT: &str = "backpressure";

/// Admission decision for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionDecision {
    /// Enqueued immediately.
    Accept,
    /// Enqueued after a producer delay.
    Delay,
    /// Discarded above the drop watermark.
    Drop,
    /// Refused because the controller is closed.
    Reject,
}

impl AdmissionDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionDecision::Accept => "accept",
            AdmissionDecision::Delay => "delay",
            AdmissionDecision::Drop => "drop",
            AdmissionDecision::Reject => "reject",
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Accept | AdmissionDecision::Delay)
    }

    pub fn status(&self) -> CallStatus {
        match self {
            AdmissionDecision::Accept | AdmissionDecision::Delay => CallStatus::Success,
            AdmissionDecision::Drop => CallStatus::Dropped,
            AdmissionDecision::Reject => CallStatus::Failed,
        }
    }

    /// Load-shedding decisions as errors, for callers that propagate with `?`.
    pub fn into_result(self, controller: &str) -> FabricResult<()> {
        match self {
            AdmissionDecision::Accept | AdmissionDecision::Delay => Ok(()),
            AdmissionDecision::Drop => Err(FabricError::Dropped(controller.to_string())),
            AdmissionDecision::Reject => {
                Err(FabricError::BackpressureRejected(controller.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpressureCounters {
    pub accepted: u64,
    pub delayed: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub dequeued: u64,
}

/// Snapshot of a controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressureMetrics {
    pub name: String,
    pub queue_length: usize,
    pub max_size: usize,
    pub occupancy: f64,
    pub under_pressure: bool,
    pub closed: bool,
    pub counters: BackpressureCounters,
}

#[derive(Debug)]
struct QueueState<T> {
    queue: VecDeque<T>,
    under_pressure: bool,
    counters: BackpressureCounters,
}

/// Bounded FIFO with watermark admission.
///
/// The lock is held for each decision and queue mutation but released during a
/// producer delay, so one delayed producer does not stall consumers.
#[derive(Debug)]
pub struct BackpressureController<T> {
    name: String,
    config: BackpressureConfig,
    state: Mutex<QueueState<T>>,
    closed: AtomicBool,
    store: Option<Arc<DistributedStateStore>>,
}

impl<T: Send> BackpressureController<T> {
    pub fn new(
        name: impl Into<String>,
        config: BackpressureConfig,
        store: Option<Arc<DistributedStateStore>>,
    ) -> FabricResult<Self> {
        ensure_valid(&config, validate_backpressure)?;
        Ok(Self {
            name: name.into(),
            state: Mutex::new(QueueState {
                queue: VecDeque::with_capacity(config.max_queue_size),
                under_pressure: false,
                counters: BackpressureCounters::default(),
            }),
            config,
            closed: AtomicBool::new(false),
            store,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BackpressureConfig {
        &self.config
    }

    fn occupancy(&self, len: usize) -> f64 {
        len as f64 / self.config.max_queue_size as f64
    }

    /// Producer delay for the given occupancy, proportional to it and capped.
    fn delay_for(&self, occupancy: f64) -> Duration {
        self.config.max_delay().mul_f64(occupancy.clamp(0.0, 1.0))
    }

    /// Update the pressure flag with hysteresis. Returns true on change.
    fn update_pressure(&self, state: &mut QueueState<T>) -> bool {
        let occupancy = self.occupancy(state.queue.len());
        if !state.under_pressure && occupancy >= self.config.high_watermark {
            state.under_pressure = true;
            tracing::warn!(queue = %self.name, occupancy, "Queue above high watermark");
            true
        } else if state.under_pressure && occupancy <= self.config.low_watermark {
            state.under_pressure = false;
            tracing::info!(queue = %self.name, occupancy, "Queue pressure relieved");
            true
        } else {
            false
        }
    }

    fn finish(&self, state: &mut QueueState<T>, decision: AdmissionDecision) -> AdmissionDecision {
        let pressure_changed = self.update_pressure(state);
        metrics::record_backpressure_decision(&self.name, decision.as_str());
        metrics::record_queue_depth(&self.name, state.queue.len());
        if pressure_changed || !matches!(decision, AdmissionDecision::Accept) {
            self.persist(self.snapshot(state));
        }
        decision
    }

    /// Admit `item` according to the current occupancy.
    pub async fn add_request(&self, item: T) -> AdmissionDecision {
        let delay = {
            let mut state = self.state.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                state.counters.rejected += 1;
                return self.finish(&mut state, AdmissionDecision::Reject);
            }

            let occupancy = self.occupancy(state.queue.len());
            if occupancy >= self.config.drop_threshold {
                state.counters.dropped += 1;
                tracing::debug!(queue = %self.name, occupancy, "Dropping item");
                return self.finish(&mut state, AdmissionDecision::Drop);
            }
            if occupancy < self.config.delay_threshold {
                state.queue.push_back(item);
                state.counters.accepted += 1;
                return self.finish(&mut state, AdmissionDecision::Accept);
            }
            self.delay_for(occupancy)
        };

        tracing::debug!(queue = %self.name, delay_ms = delay.as_millis() as u64, "Delaying producer");
        tokio::time::sleep(delay).await;

        let mut state = self.state.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            state.counters.rejected += 1;
            return self.finish(&mut state, AdmissionDecision::Reject);
        }
        if state.queue.len() >= self.config.max_queue_size {
            state.counters.dropped += 1;
            return self.finish(&mut state, AdmissionDecision::Drop);
        }
        state.queue.push_back(item);
        state.counters.delayed += 1;
        self.finish(&mut state, AdmissionDecision::Delay)
    }

    /// Dequeue the oldest item.
    pub async fn get_request(&self) -> Option<T> {
        let mut state = self.state.lock().await;
        let item = state.queue.pop_front()?;
        state.counters.dequeued += 1;
        if self.update_pressure(&mut state) {
            self.persist(self.snapshot(&state));
        }
        metrics::record_queue_depth(&self.name, state.queue.len());
        Some(item)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.queue.is_empty()
    }

    pub async fn is_under_pressure(&self) -> bool {
        self.state.lock().await.under_pressure
    }

    /// Stop admitting; queued items can still be drained.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!(queue = %self.name, "Backpressure controller closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn snapshot(&self, state: &QueueState<T>) -> BackpressureMetrics {
        BackpressureMetrics {
            name: self.name.clone(),
            queue_length: state.queue.len(),
            max_size: self.config.max_queue_size,
            occupancy: self.occupancy(state.queue.len()),
            under_pressure: state.under_pressure,
            closed: self.is_closed(),
            counters: state.counters.clone(),
        }
    }

    pub async fn get_metrics(&self) -> BackpressureMetrics {
        let state = self.state.lock().await;
        self.snapshot(&state)
    }

    /// Write a snapshot to the store in the background.
    fn persist(&self, snapshot: BackpressureMetrics) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if !store.is_healthy() {
            return;
        }
        let key = store.key(STORE_COMPONENT, &self.name);
        let ttl = Duration::from_secs(self.config.metrics_ttl_secs);
        tokio::spawn(async move {
            if let Err(e) = store.set(&key, &snapshot, Some(ttl), false).await {
                tracing::warn!(key = %key, error = %e, "Failed to persist backpressure counters");
                metrics::record_persistence_failure(STORE_COMPONENT);
            }
        });
    }
}
