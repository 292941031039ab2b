//! Registry of named circuit breakers.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time;

use crate::config::validation::{ensure_valid, validate_circuit_breaker};
use crate::config::CircuitBreakerConfig;
use crate::error::FabricResult;
use crate::observability::metrics;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerStatus, STORE_COMPONENT};
use crate::state::DistributedStateStore;

/// Creates breakers on demand and owns them for the process lifetime.
#[derive(Debug)]
pub struct CircuitBreakerManager {
    defaults: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    store: Option<Arc<DistributedStateStore>>,
}

impl CircuitBreakerManager {
    pub fn new(
        defaults: CircuitBreakerConfig,
        store: Option<Arc<DistributedStateStore>>,
    ) -> FabricResult<Self> {
        ensure_valid(&defaults, validate_circuit_breaker)?;
        Ok(Self {
            defaults,
            breakers: DashMap::new(),
            store,
        })
    }

    /// Breaker for `name`, created with the default config on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.value().clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = %name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::from_validated(
                    name.to_string(),
                    self.defaults.clone(),
                    self.store.clone(),
                ))
            })
            .value()
            .clone()
    }

    /// Breaker for `name` with a dedicated config. An existing breaker is returned
    /// unchanged.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> FabricResult<Arc<CircuitBreaker>> {
        if let Some(existing) = self.breakers.get(name) {
            return Ok(existing.value().clone());
        }
        let breaker = Arc::new(CircuitBreaker::new(name, config, self.store.clone())?);
        Ok(self
            .breakers
            .entry(name.to_string())
            .or_insert(breaker)
            .value()
            .clone())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.remove(name).map(|(_, b)| b)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.iter().map(|b| b.value().clone()).collect()
    }

    /// Status of every breaker, sorted by name.
    pub fn all_statuses(&self) -> Vec<CircuitBreakerStatus> {
        let mut statuses: Vec<_> = self.snapshot().iter().map(|b| b.get_status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn reset_all(&self) {
        for breaker in self.snapshot() {
            breaker.reset();
        }
    }

    /// Persist every breaker's snapshot and wait for the writes. Returns how many
    /// were written.
    pub async fn flush_metrics(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        if !store.is_healthy() {
            tracing::debug!("Store unhealthy, skipping circuit breaker flush");
            return 0;
        }

        let mut written = 0;
        for breaker in self.snapshot() {
            let status = breaker.get_status();
            let key = store.key(STORE_COMPONENT, breaker.name());
            match store
                .set(&key, &status, Some(breaker.config().metrics_ttl()), false)
                .await
            {
                Ok(()) => written += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to flush circuit breaker metrics");
                    metrics::record_persistence_failure(STORE_COMPONENT);
                }
            }
        }
        written
    }

    /// Flush snapshots every `interval` until shutdown.
    pub async fn run_metrics_flush(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let written = self.flush_metrics().await;
                    tracing::trace!(written, "Circuit breaker metrics flushed");
                }
                _ = shutdown.recv() => {
                    self.flush_metrics().await;
                    tracing::info!("Circuit breaker metrics flush stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateStoreConfig;
    use crate::lifecycle::TaskGroup;
    use crate::resilience::circuit_breaker::CircuitState;
    use crate::state::MemoryBackend;

    #[test]
    fn test_get_or_create_returns_same_breaker() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::default(), None).unwrap();
        let a = manager.get_or_create("orders");
        let b = manager.get_or_create("orders");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.names(), vec!["orders".to_string()]);
    }

    #[test]
    fn test_dedicated_config() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::default(), None).unwrap();
        let custom = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let cb = manager.get_or_create_with("fragile", custom).unwrap();
        assert_eq!(cb.config().failure_threshold, 1);

        let invalid = CircuitBreakerConfig {
            success_threshold: 0,
            ..Default::default()
        };
        assert!(manager.get_or_create_with("broken", invalid).is_err());
        assert!(manager.get("broken").is_none());
    }

    #[test]
    fn test_reset_all_and_remove() {
        let manager = CircuitBreakerManager::new(CircuitBreakerConfig::default(), None).unwrap();
        manager.get_or_create("a").force_open();
        manager.get_or_create("b").force_open();

        manager.reset_all();
        assert!(manager
            .all_statuses()
            .iter()
            .all(|s| s.state == CircuitState::Closed));

        assert!(manager.remove("a").is_some());
        assert_eq!(manager.names(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_flush_metrics() {
        let store = Arc::new(
            DistributedStateStore::new("app", StateStoreConfig::default(), Arc::new(MemoryBackend::new()))
                .unwrap(),
        );
        let manager =
            CircuitBreakerManager::new(CircuitBreakerConfig::default(), Some(store.clone())).unwrap();
        manager.get_or_create("x");
        manager.get_or_create("y");

        assert_eq!(manager.flush_metrics().await, 2);
        assert_eq!(
            store.keys("app:circuit_breaker:").await.unwrap(),
            vec![
                "app:circuit_breaker:x".to_string(),
                "app:circuit_breaker:y".to_string()
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_loop_writes_on_tick_and_on_stop() {
        let store = Arc::new(
            DistributedStateStore::new("app", StateStoreConfig::default(), Arc::new(MemoryBackend::new()))
                .unwrap(),
        );
        let manager = Arc::new(
            CircuitBreakerManager::new(CircuitBreakerConfig::default(), Some(store.clone())).unwrap(),
        );
        let mut tasks = TaskGroup::new();
        let flushed = manager.clone();
        tasks.spawn("breaker-flush", move |shutdown| {
            flushed.run_metrics_flush(Duration::from_secs(1), shutdown)
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.get_or_create("late");
        assert!(!store.exists("app:circuit_breaker:late").await.unwrap());
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert!(store.exists("app:circuit_breaker:late").await.unwrap());

        manager.get_or_create("last");
        tasks.stop(Duration::from_secs(1)).await;
        assert!(store.exists("app:circuit_breaker:last").await.unwrap());
    }
}
