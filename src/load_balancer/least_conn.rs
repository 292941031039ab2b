//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::load_balancer::{instance::ServiceInstance, LoadBalancer};

/// Least connections selector.
/// Selects the instance with the fewest in-flight requests.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for LeastConnections {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn select_instance(&self, instances: &[Arc<ServiceInstance>]) -> Option<Arc<ServiceInstance>> {
        // In case of tie, the first one is selected (stability)
        instances
            .iter()
            .filter(|instance| instance.is_selectable())
            .min_by_key(|instance| instance.active_requests())
            .cloned()
    }
}
