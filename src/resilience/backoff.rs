//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::CircuitBreakerConfig;

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    pub base: f64,
    /// Symmetric jitter as a fraction of the capped delay.
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            base: config.backoff_base,
            jitter_ratio: config.jitter_ratio,
        }
    }

    /// Delay before retry number `attempt` (0 = first retry):
    /// `base_delay * base^attempt`, capped at `max_delay`, then ±jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.base.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);

        let jitter_span = capped * self.jitter_ratio;
        let jitter = if jitter_span > 0.0 {
            rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter_ratio: f64) -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            base: 2.0,
            jitter_ratio,
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let p = policy(0.0);
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(800));
        assert_eq!(p.delay(4), Duration::from_millis(1_000));
        assert_eq!(p.delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let p = policy(0.1);
        for _ in 0..100 {
            let d = p.delay(1).as_millis();
            assert!((180..=220).contains(&d), "delay {} outside jitter band", d);
        }
    }
}
