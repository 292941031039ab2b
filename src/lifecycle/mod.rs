//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Component start:
//!     TaskGroup::spawn(name, |shutdown_rx| loop)   (health, auto-scaling, metrics flush)
//!
//! Component stop:
//!     TaskGroup::stop() → Shutdown::trigger() → loops observe signal and return
//!         → handles awaited with deadline → stragglers aborted
//! ```
//!
//! # Design Decisions
//! - Every background loop belongs to exactly one TaskGroup
//! - No loop outlives its owning component
//! - Shutdown has timeout: forced abort after deadline

pub mod shutdown;
pub mod tasks;

pub use shutdown::Shutdown;
pub use tasks::TaskGroup;
