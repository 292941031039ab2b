//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! call_service(name)
//!     → registry snapshot of the service's instances
//!     → optional priority-tier filter
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (rotate through instances)
//!         - weighted.rs (smooth weighted round-robin)
//!         - least_conn.rs (fewest in-flight requests)
//!         - response_time.rs (weighted random by speed and success)
//!     → instance.rs (reserve a request slot)
//! ```
//!
//! # Design Decisions
//! - Balancers only read instances; the instance tracks its own slots
//! - Only Healthy instances below `max_requests` are eligible
//! - Slot reservation is a CAS, so capacity holds under concurrent picks

pub mod instance;
pub mod least_conn;
pub mod response_time;
pub mod round_robin;
pub mod weighted;

use std::fmt::Debug;
use std::sync::Arc;

use crate::config::LoadBalancingStrategy;

pub use instance::{InstanceSnapshot, InstanceSpec, InstanceStatus, RequestGuard, ServiceInstance};

/// Picks one instance from a snapshot.
pub trait LoadBalancer: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Never returns an instance that is not Healthy or is at `max_requests`.
    ///
    /// `instances` may be a subset of the pool (one priority tier), so
    /// per-instance state outside it must be kept.
    fn select_instance(&self, instances: &[Arc<ServiceInstance>]) -> Option<Arc<ServiceInstance>>;

    /// Drop any state held for an instance that left the pool.
    fn forget(&self, _instance_id: &str) {}
}

/// Balancer for a configured strategy.
pub fn build(strategy: LoadBalancingStrategy) -> Box<dyn LoadBalancer> {
    match strategy {
        LoadBalancingStrategy::RoundRobin => Box::new(round_robin::RoundRobin::new()),
        LoadBalancingStrategy::WeightedRoundRobin => Box::new(weighted::WeightedRoundRobin::new()),
        LoadBalancingStrategy::LeastConnections => Box::new(least_conn::LeastConnections::new()),
        LoadBalancingStrategy::ResponseTime => Box::new(response_time::ResponseTimeWeighted::new()),
    }
}
