//! Resilience and orchestration fabric.
//!
//! Circuit breakers, a shared TTL state store, a service registry with load
//! balancing and auto-scaling, backpressure admission control and
//! primary/backup failover, wired together by a [`RuntimeContext`].

pub mod backpressure;
pub mod config;
pub mod error;
pub mod failover;
pub mod health;
pub mod lifecycle;
pub mod load_balancer;
pub mod mesh;
pub mod observability;
pub mod resilience;
pub mod runtime;
pub mod state;
pub mod status;

pub use backpressure::{AdmissionDecision, BackpressureController};
pub use config::FabricConfig;
pub use error::{CallFailure, FabricError, FabricResult, FailureKind};
pub use failover::{FailoverManager, FailoverResult};
pub use lifecycle::Shutdown;
pub use mesh::{HttpTransport, ScalingIntent, ServiceRegistry};
pub use resilience::{CircuitBreaker, CircuitBreakerManager, CircuitState};
pub use runtime::RuntimeContext;
pub use state::{DistributedStateStore, MemoryBackend};
pub use status::CallStatus;
