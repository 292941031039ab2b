//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Protected call:
//!     → circuit_breaker.rs (fail fast while open)
//!     → retries.rs (attempt loop, retry eligibility by failure kind)
//!         → timeouts.rs (deadline per attempt)
//!         → backoff.rs (delay between attempts)
//!     → circuit_breaker.rs (record one outcome, persist snapshot)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Failure kinds are explicit values, never parsed from messages
//! - Circuit breaker prevents retry storms against a failing dependency
//! - manager.rs owns breakers by name; no global registry

pub mod backoff;
pub mod circuit_breaker;
pub mod manager;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStatus, CircuitState};
pub use manager::CircuitBreakerManager;
