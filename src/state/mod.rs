//! Distributed state subsystem.
//!
//! # Data Flow
//! ```text
//! circuit breakers / backpressure / registry / failover
//!     → store.rs (namespace key, encode JSON, apply default TTL, deadline)
//!     → backend.rs (StoreBackend trait, in-process MemoryBackend)
//!     → redis_backend.rs (shared Redis server or cluster proxy)
//!
//! Health loop (store.rs):
//!     interval → ping + info → healthy flag read by writers
//! ```
//!
//! # Design Decisions
//! - The store is the only state shared across process replicas
//! - Everything written by other components is an advisory snapshot
//! - TTL is the only garbage collection

pub mod backend;
pub mod redis_backend;
pub mod store;
pub mod types;

use std::sync::Arc;

use crate::config::{StateStoreConfig, StoreBackendKind};

pub use backend::{MemoryBackend, StoreBackend};
pub use redis_backend::RedisBackend;
pub use store::DistributedStateStore;
pub use types::{BackendInfo, BatchReply, StateError, StateOp, StateResult, StoreHealth, StoreStats};

/// Build the backend selected by `config`.
pub async fn connect_backend(config: &StateStoreConfig) -> StateResult<Arc<dyn StoreBackend>> {
    match config.backend {
        StoreBackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        StoreBackendKind::Redis => Ok(Arc::new(RedisBackend::connect(&config.url).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_backend_by_kind() {
        let memory = connect_backend(&StateStoreConfig::default()).await.unwrap();
        assert_eq!(memory.info().await.unwrap().backend, "memory");

        // An unparsable URL fails before any connection attempt.
        let config = StateStoreConfig {
            backend: StoreBackendKind::Redis,
            url: "::not-a-url::".into(),
            ..Default::default()
        };
        assert!(matches!(
            connect_backend(&config).await,
            Err(StateError::Unavailable(_))
        ));
    }
}
