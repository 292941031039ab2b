//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → FabricConfig (validated, immutable)
//!     → each section handed to its component, which re-validates on construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::{
    BackpressureConfig, CircuitBreakerConfig, DiscoveryConfig, FabricConfig, FailoverConfig,
    FailoverStrategy, LoadBalancingStrategy, ObservabilityConfig, ServiceMeshConfig,
    StateStoreConfig, StoreBackendKind,
};
