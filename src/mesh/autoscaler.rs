//! Auto-scaling decisions.
//!
//! The fabric never provisions compute. Scale-up is delivered as an intent for
//! an external orchestrator; scale-down also removes the least loaded instance
//! from the registry.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::ServiceMeshConfig;
use crate::resilience::circuit_breaker::now_ms;

/// Store component segment for intents.
pub const STORE_COMPONENT: &str = "autoscaler";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDirection {
    Up,
    Down,
}

impl ScalingDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingDirection::Up => "up",
            ScalingDirection::Down => "down",
        }
    }
}

/// A scaling decision for the external orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingIntent {
    pub service: String,
    pub direction: ScalingDirection,
    pub current_instances: usize,
    pub desired_instances: usize,
    pub average_load: f64,
    /// Instance removed by a scale-down.
    pub instance_id: Option<String>,
    pub issued_at_ms: u64,
}

impl ScalingIntent {
    pub fn new(
        service: &str,
        direction: ScalingDirection,
        current_instances: usize,
        average_load: f64,
    ) -> Self {
        let desired_instances = match direction {
            ScalingDirection::Up => current_instances + 1,
            ScalingDirection::Down => current_instances.saturating_sub(1),
        };
        Self {
            service: service.to_string(),
            direction,
            current_instances,
            desired_instances,
            average_load,
            instance_id: None,
            issued_at_ms: now_ms(),
        }
    }
}

/// Thresholds and cooldowns from the mesh config.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub min_instances: usize,
    pub max_instances: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_cooldown: Duration,
    pub scale_down_cooldown: Duration,
}

impl ScalingPolicy {
    pub fn from_config(config: &ServiceMeshConfig) -> Self {
        Self {
            min_instances: config.min_instances,
            max_instances: config.max_instances,
            scale_up_threshold: config.scale_up_threshold,
            scale_down_threshold: config.scale_down_threshold,
            scale_up_cooldown: Duration::from_secs(config.scale_up_cooldown_secs),
            scale_down_cooldown: Duration::from_secs(config.scale_down_cooldown_secs),
        }
    }

    /// Direction to scale, if any, given the instance load factors.
    pub fn decide(&self, loads: &[f64], state: &ScalingState, now: Instant) -> Option<ScalingDirection> {
        if loads.is_empty() {
            return None;
        }
        let count = loads.len();
        let average = average_load(loads);

        if average > self.scale_up_threshold
            && count < self.max_instances
            && cooled_down(state.last_scale_up, self.scale_up_cooldown, now)
        {
            return Some(ScalingDirection::Up);
        }
        if average < self.scale_down_threshold
            && count > self.min_instances
            && cooled_down(state.last_scale_down, self.scale_down_cooldown, now)
        {
            return Some(ScalingDirection::Down);
        }
        None
    }
}

/// When each direction last fired. Cooldowns are independent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScalingState {
    pub last_scale_up: Option<Instant>,
    pub last_scale_down: Option<Instant>,
}

impl ScalingState {
    pub fn record(&mut self, direction: ScalingDirection, now: Instant) {
        match direction {
            ScalingDirection::Up => self.last_scale_up = Some(now),
            ScalingDirection::Down => self.last_scale_down = Some(now),
        }
    }
}

pub fn average_load(loads: &[f64]) -> f64 {
    if loads.is_empty() {
        0.0
    } else {
        loads.iter().sum::<f64>() / loads.len() as f64
    }
}

fn cooled_down(last: Option<Instant>, cooldown: Duration, now: Instant) -> bool {
    last.map_or(true, |t| now.saturating_duration_since(t) >= cooldown)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ScalingPolicy {
        ScalingPolicy {
            min_instances: 1,
            max_instances: 3,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_up_cooldown: Duration::from_secs(300),
            scale_down_cooldown: Duration::from_secs(600),
        }
    }

    #[test]
    fn test_thresholds_and_bounds() {
        let policy = policy();
        let state = ScalingState::default();
        let now = Instant::now();

        assert_eq!(policy.decide(&[0.9, 0.9], &state, now), Some(ScalingDirection::Up));
        assert_eq!(policy.decide(&[0.9, 0.9, 0.9], &state, now), None);
        assert_eq!(policy.decide(&[0.1, 0.0], &state, now), Some(ScalingDirection::Down));
        assert_eq!(policy.decide(&[0.1], &state, now), None);
        assert_eq!(policy.decide(&[0.5, 0.5], &state, now), None);
        assert_eq!(policy.decide(&[], &state, now), None);
    }

    #[test]
    fn test_independent_cooldowns() {
        let policy = policy();
        let mut state = ScalingState::default();
        let t0 = Instant::now();

        state.record(ScalingDirection::Up, t0);
        assert_eq!(policy.decide(&[0.9], &state, t0 + Duration::from_secs(10)), None);
        // Scale-down is not blocked by a recent scale-up.
        assert_eq!(
            policy.decide(&[0.0, 0.0], &state, t0 + Duration::from_secs(10)),
            Some(ScalingDirection::Down)
        );
        assert_eq!(
            policy.decide(&[0.9], &state, t0 + Duration::from_secs(300)),
            Some(ScalingDirection::Up)
        );

        state.record(ScalingDirection::Down, t0);
        assert_eq!(policy.decide(&[0.0, 0.0], &state, t0 + Duration::from_secs(599)), None);
    }

    #[test]
    fn test_intent_counts() {
        let up = ScalingIntent::new("svc", ScalingDirection::Up, 2, 0.9);
        assert_eq!(up.desired_instances, 3);
        let down = ScalingIntent::new("svc", ScalingDirection::Down, 2, 0.1);
        assert_eq!(down.desired_instances, 1);
    }
}
