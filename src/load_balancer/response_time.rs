//! Response-time weighted random selection.
//!
//! weight = (1 / avg_response_secs) * success_rate. Instances without samples
//! are weighted as if they answered in one second.

use std::sync::Arc;

use rand::Rng;

use crate::load_balancer::{instance::ServiceInstance, LoadBalancer};

/// Floor on the response time to keep weights finite.
const MIN_RESPONSE_SECS: f64 = 0.001;
const UNSAMPLED_RESPONSE_SECS: f64 = 1.0;

#[derive(Debug, Default)]
pub struct ResponseTimeWeighted;

impl ResponseTimeWeighted {
    pub fn new() -> Self {
        Self
    }

    pub fn weight_of(instance: &ServiceInstance) -> f64 {
        let avg_secs = instance
            .avg_response_time()
            .map(|d| d.as_secs_f64())
            .unwrap_or(UNSAMPLED_RESPONSE_SECS)
            .max(MIN_RESPONSE_SECS);
        instance.success_rate() / avg_secs
    }
}

impl LoadBalancer for ResponseTimeWeighted {
    fn name(&self) -> &'static str {
        "response_time"
    }

    fn select_instance(&self, instances: &[Arc<ServiceInstance>]) -> Option<Arc<ServiceInstance>> {
        let candidates: Vec<&Arc<ServiceInstance>> =
            instances.iter().filter(|i| i.is_selectable()).collect();
        if candidates.is_empty() {
            return None;
        }

        let weights: Vec<f64> = candidates.iter().map(|i| Self::weight_of(i)).collect();
        let total: f64 = weights.iter().sum();
        let mut rng = rand::thread_rng();

        if total <= 0.0 {
            return Some(candidates[rng.gen_range(0..candidates.len())].clone());
        }

        let mut draw = rng.gen_range(0.0..total);
        for (instance, weight) in candidates.iter().zip(&weights) {
            if draw < *weight {
                return Some((*instance).clone());
            }
            draw -= weight;
        }
        // Float rounding can leave a sliver past the last bucket.
        candidates
            .iter()
            .zip(&weights)
            .rev()
            .find(|(_, w)| **w > 0.0)
            .map(|(i, _)| (*i).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::instance::test_instance;
    use std::time::Duration;

    #[test]
    fn test_weight_formula() {
        let instance = test_instance("a", 10);
        instance.record_response(Duration::from_millis(100), true);
        let weight = ResponseTimeWeighted::weight_of(&instance);
        assert!((weight - 10.0).abs() < 1e-6);

        instance.record_response(Duration::from_millis(100), false);
        let weight = ResponseTimeWeighted::weight_of(&instance);
        assert!((weight - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_weight_never_chosen() {
        let lb = ResponseTimeWeighted::new();
        let failing = test_instance("failing", 10);
        failing.record_response(Duration::from_millis(5), false);
        let ok = test_instance("ok", 10);
        ok.record_response(Duration::from_millis(500), true);

        let instances = vec![failing, ok];
        for _ in 0..50 {
            assert_eq!(lb.select_instance(&instances).unwrap().id, "ok");
        }
    }

    #[test]
    fn test_all_zero_falls_back_to_uniform() {
        let lb = ResponseTimeWeighted::new();
        let a = test_instance("a", 10);
        let b = test_instance("b", 10);
        a.record_response(Duration::from_millis(5), false);
        b.record_response(Duration::from_millis(5), false);

        let instances = vec![a, b];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(lb.select_instance(&instances).unwrap().id.clone());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_prefers_faster_instance() {
        let lb = ResponseTimeWeighted::new();
        let fast = test_instance("fast", 10);
        fast.record_response(Duration::from_millis(10), true);
        let slow = test_instance("slow", 10);
        slow.record_response(Duration::from_millis(1000), true);

        let instances = vec![fast, slow];
        let fast_picks = (0..1000)
            .filter(|_| lb.select_instance(&instances).unwrap().id == "fast")
            .count();
        assert!(fast_picks > 900, "fast picked {} times", fast_picks);
    }
}
