//! Failover subsystem.
//!
//! # Data Flow
//! ```text
//! execute_with_failover(service, primary, backup)
//!     primary mode ──▶ primary ──ok──▶ Success (cached)
//!                         └─fail──▶ failure_count++ ──(threshold)──▶ backup mode
//!                         └──────▶ backup ──ok──▶ Success
//!     backup mode ──(probe due)──▶ primary probe ──ok──▶ recovery_count++ ──(threshold)──▶ primary mode
//!                 └─────────────▶ backup
//!     both failed ──▶ cache hit: Partial | no data: Failed | partial disabled: FailoverExhausted
//! ```

pub mod manager;

pub use manager::{FailoverManager, FailoverResult, FailoverStatus, ResultSource};
