//! Service mesh: registry, transport, discovery and auto-scaling.
//!
//! # Data Flow
//! ```text
//! register_service ──▶ registry.rs ──▶ discovery.rs (agent, optional)
//!                          │
//!                          ├── health loop ──▶ health::HealthChecker ──▶ transport.rs (GET health path)
//!                          └── autoscale loop ──▶ autoscaler.rs ──▶ ScalingIntent channel
//!
//! call_service ──▶ load_balancer ──▶ CircuitBreaker("service:<name>") ──▶ transport.rs (POST /process)
//! ```
//!
//! # Design Decisions
//! - The registry never provisions compute; scale-up is an intent only
//! - Transport and discovery failures are classified, logged and counted; they
//!   never panic or abort a loop
//! - Membership snapshots in the store are advisory

pub mod autoscaler;
pub mod discovery;
pub mod registry;
pub mod transport;

pub use autoscaler::{ScalingDirection, ScalingIntent};
pub use discovery::DiscoveryClient;
pub use registry::{RegistryStatus, ServiceRegistry, ServiceStatus};
pub use transport::{HttpTransport, ProbeOutcome, ServiceTransport};
