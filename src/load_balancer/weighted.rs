//! Smooth weighted round-robin.
//!
//! Each pick adds every candidate's weight to its running score, takes the
//! highest score and subtracts the total weight from it. Over one cycle each
//! instance is picked `weight` times, interleaved rather than in bursts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::load_balancer::{instance::ServiceInstance, LoadBalancer};

#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    scores: Mutex<HashMap<String, i64>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }

    fn select_instance(&self, instances: &[Arc<ServiceInstance>]) -> Option<Arc<ServiceInstance>> {
        let candidates: Vec<&Arc<ServiceInstance>> =
            instances.iter().filter(|i| i.is_selectable()).collect();
        if candidates.is_empty() {
            return None;
        }

        let mut scores = self.scores.lock().expect("weighted scores mutex poisoned");

        let mut total = 0i64;
        let mut best: Option<(&Arc<ServiceInstance>, i64)> = None;
        for instance in candidates {
            let weight = instance.weight.max(1) as i64;
            total += weight;
            let score = scores.entry(instance.id.clone()).or_insert(0);
            *score += weight;
            if best.map_or(true, |(_, s)| *score > s) {
                best = Some((instance, *score));
            }
        }

        let (chosen, _) = best?;
        if let Some(score) = scores.get_mut(&chosen.id) {
            *score -= total;
        }
        Some(chosen.clone())
    }

    fn forget(&self, instance_id: &str) {
        self.scores
            .lock()
            .expect("weighted scores mutex poisoned")
            .remove(instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::instance::InstanceSpec;

    fn weighted(id: &str, weight: u32) -> Arc<ServiceInstance> {
        Arc::new(
            ServiceInstance::new("svc", InstanceSpec::new(id, "127.0.0.1", 9000).weight(weight), 10)
                .unwrap(),
        )
    }

    #[test]
    fn test_distribution_follows_weights() {
        let lb = WeightedRoundRobin::new();
        let instances = vec![weighted("a", 5), weighted("b", 1), weighted("c", 1)];

        let picks: Vec<String> = (0..7)
            .map(|_| lb.select_instance(&instances).unwrap().id.clone())
            .collect();
        assert_eq!(picks.iter().filter(|id| *id == "a").count(), 5);
        assert_eq!(picks.iter().filter(|id| *id == "b").count(), 1);
        assert_eq!(picks.iter().filter(|id| *id == "c").count(), 1);
        // Smooth: the heavy instance is not picked five times in a row.
        assert_eq!(picks, vec!["a", "a", "b", "a", "c", "a", "a"]);
    }

    #[test]
    fn test_tier_pick_keeps_other_scores() {
        let lb = WeightedRoundRobin::new();
        let (a, b, c) = (weighted("a", 5), weighted("b", 1), weighted("c", 1));
        let all = vec![a.clone(), b.clone(), c.clone()];

        assert_eq!(lb.select_instance(&all).unwrap().id, "a");
        assert_eq!(lb.select_instance(&all).unwrap().id, "a");
        assert_eq!(lb.select_instance(&[b.clone()]).unwrap().id, "b");

        {
            let scores = lb.scores.lock().unwrap();
            assert_eq!(scores.get("a"), Some(&-4));
            assert_eq!(scores.get("b"), Some(&2));
            assert_eq!(scores.get("c"), Some(&2));
        }

        // The full rotation resumes from the kept scores: a=1, b=3, c=3.
        assert_eq!(lb.select_instance(&all).unwrap().id, "b");

        lb.forget("c");
        assert!(!lb.scores.lock().unwrap().contains_key("c"));
    }

    #[test]
    fn test_skips_saturated() {
        let lb = WeightedRoundRobin::new();
        let heavy = Arc::new(
            ServiceInstance::new(
                "svc",
                InstanceSpec::new("heavy", "127.0.0.1", 9000).weight(10).max_requests(1),
                10,
            )
            .unwrap(),
        );
        let light = weighted("light", 1);
        let _held = heavy.try_acquire().unwrap();

        for _ in 0..3 {
            assert_eq!(
                lb.select_instance(&[heavy.clone(), light.clone()]).unwrap().id,
                "light"
            );
        }
    }
}
