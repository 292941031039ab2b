//! Backpressure.
//!
//! # Data Flow
//! ```text
//! producer ──add_request──▶ occupancy check ──▶ Accept | Delay | Drop | Reject
//!                                                  │
//!                                                  ▼
//! consumer ◀──get_request── FIFO queue ──▶ pressure flag (high/low watermark)
//! ```
//!
//! # Design Decisions
//! - Occupancy is `len / max_queue_size`, evaluated before the enqueue
//! - Delay grows with occupancy and is capped by `max_delay_ms`
//! - Reject is reserved for a closed controller

pub mod controller;

pub use controller::{AdmissionDecision, BackpressureController, BackpressureCounters, BackpressureMetrics};
