//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Per-service health loop (mesh registry):
//!     Periodic timer
//!     → snapshot of the service's instances
//!     → active.rs probes each one concurrently
//!     → instance status + heartbeat updated
//!     → expired instances handed back for deregistration
//! ```
//!
//! # Design Decisions
//! - Maintenance instances are never probed
//! - One failed probe marks an instance Unhealthy; one success restores it
//! - Deregistration requires continuous unhealthiness for `deregister_after`

pub mod active;

pub use active::{HealthChecker, HealthReport};
