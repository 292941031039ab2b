//! Distributed state store.
//!
//! # Responsibilities
//! - Namespaced, TTL-bounded JSON values over a pluggable backend
//! - All-or-nothing batches
//! - Health polling with a cheap healthy/unhealthy flag for other components
//! - Eviction of expired entries on each health tick, for backends that need it
//!
//! # Design Decisions
//! - Last write wins; no versioning
//! - Every backend call carries a deadline
//! - Callers treat an outage as degraded mode, never as fatal

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::validation::{ensure_valid, validate_state_store};
use crate::config::StateStoreConfig;
use crate::error::FabricResult;
use crate::observability::metrics;
use crate::state::backend::StoreBackend;
use crate::state::types::{BatchReply, StateError, StateOp, StateResult, StoreHealth, StoreStats};

#[derive(Debug, Default)]
struct StatCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    transactions: AtomicU64,
    errors: AtomicU64,
}

/// Shared key/value state for every fabric component.
#[derive(Debug)]
pub struct DistributedStateStore {
    app_name: String,
    config: StateStoreConfig,
    backend: Arc<dyn StoreBackend>,
    healthy: AtomicBool,
    stats: StatCounters,
}

impl DistributedStateStore {
    pub fn new(
        app_name: impl Into<String>,
        config: StateStoreConfig,
        backend: Arc<dyn StoreBackend>,
    ) -> FabricResult<Self> {
        ensure_valid(&config, validate_state_store)?;
        Ok(Self {
            app_name: app_name.into(),
            config,
            backend,
            healthy: AtomicBool::new(true),
            stats: StatCounters::default(),
        })
    }

    /// Namespaced key: `<app>:<component>:<id>`.
    pub fn key(&self, component: &str, id: &str) -> String {
        format!("{}:{}:{}", self.app_name, component, id)
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Last observed backend health.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn guarded<T, Fut>(&self, operation: &'static str, fut: Fut) -> StateResult<T>
    where
        Fut: Future<Output = StateResult<T>>,
    {
        let deadline = self.config.operation_timeout();
        let result = match time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(StateError::Timeout {
                operation,
                timeout_ms: deadline.as_millis() as u64,
            }),
        };
        if let Err(e) = &result {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(operation, error = %e, "State store operation failed");
        }
        metrics::record_store_operation(operation, result.is_ok());
        result
    }

    /// Store `value` as JSON under `key`.
    ///
    /// `ttl = None` applies the configured default. With `atomic` the write goes
    /// through the batch path.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        atomic: bool,
    ) -> StateResult<()> {
        let ttl = ttl.or_else(|| self.config.default_ttl());
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        if atomic {
            let op = StateOp::set(key, value, ttl)?;
            self.atomic_transaction(vec![op]).await.map(|_| ())
        } else {
            let encoded = serde_json::to_string(value)?;
            self.guarded("set", self.backend.set(key, encoded, ttl)).await
        }
    }

    /// Read and decode `key`. `Ok(None)` when absent or expired.
    pub async fn try_get<T: DeserializeOwned>(&self, key: &str) -> StateResult<Option<T>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        match self.guarded("get", self.backend.get(key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Read `key`, returning `default` when absent, expired, undecodable or the
    /// backend fails.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.try_get(key).await {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(e) => {
                tracing::warn!(key, error = %e, "State read failed, using default");
                default
            }
        }
    }

    pub async fn delete(&self, key: &str) -> StateResult<bool> {
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        self.guarded("delete", self.backend.delete(key)).await
    }

    pub async fn exists(&self, key: &str) -> StateResult<bool> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.guarded("exists", self.backend.exists(key)).await
    }

    pub async fn keys(&self, prefix: &str) -> StateResult<Vec<String>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.guarded("keys", self.backend.keys(prefix)).await
    }

    /// Add `by` to the integer at `key` (missing counts as 0).
    pub async fn increment(&self, key: &str, by: i64) -> StateResult<i64> {
        match self
            .atomic_transaction(vec![StateOp::increment(key, by)])
            .await?
            .first()
        {
            Some(BatchReply::Integer(value)) => Ok(*value),
            other => Err(StateError::TransactionAborted(format!(
                "unexpected increment reply: {:?}",
                other
            ))),
        }
    }

    pub async fn get_fields(&self, key: &str) -> StateResult<HashMap<String, String>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.guarded("get_fields", self.backend.get_fields(key)).await
    }

    /// Apply `ops` in order as one batch. On any failure none of it is applied.
    pub async fn atomic_transaction(&self, ops: Vec<StateOp>) -> StateResult<Vec<BatchReply>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        self.stats.transactions.fetch_add(1, Ordering::Relaxed);
        let count = ops.len();
        let replies = self
            .guarded("transaction", self.backend.execute_batch(ops))
            .await?;
        tracing::trace!(ops = count, "State transaction committed");
        Ok(replies)
    }

    /// Probe the backend and update the health flag.
    pub async fn health_check(&self) -> StoreHealth {
        let start = Instant::now();
        let result = async {
            self.guarded("ping", self.backend.ping()).await?;
            self.guarded("info", self.backend.info()).await
        }
        .await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let health = match result {
            Ok(info) => StoreHealth {
                healthy: true,
                latency_ms,
                backend: Some(info),
                error: None,
            },
            Err(e) => StoreHealth {
                healthy: false,
                latency_ms,
                backend: None,
                error: Some(e.to_string()),
            },
        };

        let was_healthy = self.healthy.swap(health.healthy, Ordering::Relaxed);
        if was_healthy != health.healthy {
            if health.healthy {
                tracing::info!(latency_ms, "State store recovered");
            } else {
                tracing::warn!(error = ?health.error, "State store unhealthy, running degraded");
            }
        }
        health
    }

    /// Ask the backend to drop expired entries.
    pub async fn evict_expired(&self) -> StateResult<usize> {
        self.guarded("evict", self.backend.evict_expired()).await
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.stats.reads.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
            transactions: self.stats.transactions.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }

    /// Poll health until shutdown.
    pub async fn run_health_monitor(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(self.config.health_check_interval());
        tracing::info!(
            interval_secs = self.config.health_check_interval_secs,
            "State store health monitor starting"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.health_check().await.healthy {
                        continue;
                    }
                    match self.evict_expired().await {
                        Ok(0) | Err(_) => {}
                        Ok(evicted) => tracing::debug!(evicted, "Evicted expired state entries"),
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("State store health monitor received shutdown signal");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::backend::MemoryBackend;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        name: String,
        values: Vec<u32>,
        ratio: f64,
    }

    fn store_with(backend: Arc<MemoryBackend>) -> DistributedStateStore {
        DistributedStateStore::new("test", StateStoreConfig::default(), backend).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_get_until_ttl() {
        let store = store_with(Arc::new(MemoryBackend::new()));
        let key = store.key("agents", "a1");
        assert_eq!(key, "test:agents:a1");

        let value = Snapshot {
            name: "alpha".into(),
            values: vec![1, 2, 3],
            ratio: 0.25,
        };
        store
            .set(&key, &value, Some(Duration::from_secs(60)), false)
            .await
            .unwrap();

        let read: Option<Snapshot> = store.try_get(&key).await.unwrap();
        assert_eq!(read, Some(value));

        tokio::time::advance(Duration::from_secs(61)).await;
        let fallback = Snapshot {
            name: "default".into(),
            values: vec![],
            ratio: 0.0,
        };
        assert_eq!(store.get(&key, fallback.clone()).await, fallback);
    }

    #[tokio::test]
    async fn test_atomic_set_and_increment() {
        let store = store_with(Arc::new(MemoryBackend::new()));
        store.set("k", &42u32, None, true).await.unwrap();
        assert_eq!(store.get("k", 0u32).await, 42);

        assert_eq!(store.increment("hits", 2).await.unwrap(), 2);
        assert_eq!(store.increment("hits", 3).await.unwrap(), 5);

        let stats = store.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.transactions, 3);
    }

    #[tokio::test]
    async fn test_transaction_failure_applies_nothing() {
        let store = store_with(Arc::new(MemoryBackend::new()));
        store.set("text", &"hello", None, false).await.unwrap();

        let result = store
            .atomic_transaction(vec![
                StateOp::set("a", &1, None).unwrap(),
                StateOp::increment("text", 1),
            ])
            .await;
        assert!(result.is_err());
        assert!(!store.exists("a").await.unwrap());
        assert_eq!(store.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_outage_degrades_to_default() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_with(backend.clone());
        store.set("k", &7, None, false).await.unwrap();

        backend.set_available(false);
        let health = store.health_check().await;
        assert!(!health.healthy);
        assert!(!store.is_healthy());
        assert_eq!(store.get("k", -1).await, -1);
        assert!(matches!(
            store.set("k", &8, None, false).await,
            Err(StateError::Unavailable(_))
        ));

        backend.set_available(true);
        let health = store.health_check().await;
        assert!(health.healthy);
        assert_eq!(health.backend.unwrap().backend, "memory");
        assert!(store.is_healthy());
        assert_eq!(store.get("k", -1).await, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_tracks_outage_and_evicts() {
        let backend = Arc::new(MemoryBackend::new());
        let config = StateStoreConfig {
            health_check_interval_secs: 1,
            ..Default::default()
        };
        let store = Arc::new(DistributedStateStore::new("test", config, backend.clone()).unwrap());
        store
            .set("test:cb:old", &1, Some(Duration::from_millis(500)), false)
            .await
            .unwrap();
        store.set("test:cb:kept", &2, None, false).await.unwrap();

        let (tx, rx) = broadcast::channel(1);
        let monitor = tokio::spawn(store.clone().run_health_monitor(rx));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(backend.stored_entries(), 1);

        backend.set_available(false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!store.is_healthy());

        backend.set_available(true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.is_healthy());

        tx.send(()).unwrap();
        monitor.await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_and_keys() {
        let store = store_with(Arc::new(MemoryBackend::new()));
        store.set(&store.key("cb", "a"), &1, None, false).await.unwrap();
        store.set(&store.key("cb", "b"), &2, None, false).await.unwrap();
        store.set(&store.key("bp", "q"), &3, None, false).await.unwrap();

        assert_eq!(
            store.keys("test:cb:").await.unwrap(),
            vec!["test:cb:a".to_string(), "test:cb:b".to_string()]
        );
        assert!(store.delete("test:cb:a").await.unwrap());
        assert!(!store.delete("test:cb:a").await.unwrap());
    }
}
