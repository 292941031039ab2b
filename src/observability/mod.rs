//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges, histograms via `metrics`)
//!
//! Consumers:
//!     → Log aggregation (stdout, JSON lines)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields for breaker, service, instance and queue names
//! - Metrics are cheap; recording never fails the business path
//! - Store snapshots are separate from metrics and strictly advisory

pub mod logging;
pub mod metrics;
