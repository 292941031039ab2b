//! Resilience fabric runtime.
//!
//! # Architecture Overview
//!
//! ```text
//!   caller ──▶ failover ──▶ registry.call_service ──▶ load_balancer ──▶ circuit breaker ──▶ instance
//!     │                          │                                          │
//!     └─▶ backpressure           ├── health loop (per service)              │
//!                                └── autoscale loop ──▶ ScalingIntent        │
//!                                                                           ▼
//!                        state store ◀── advisory snapshots (breakers, queues, failover, registry)
//! ```
//!
//! Reads its configuration from the TOML file named by `FABRIC_CONFIG`
//! (defaults otherwise), runs until Ctrl-C, then shuts down gracefully.

use std::path::Path;
use std::sync::Arc;

use resilience_fabric::config::loader::load_config;
use resilience_fabric::observability::{logging, metrics};
use resilience_fabric::state::connect_backend;
use resilience_fabric::{FabricConfig, HttpTransport, RuntimeContext};

const CONFIG_ENV: &str = "FABRIC_CONFIG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::var(CONFIG_ENV) {
        Ok(path) => load_config(Path::new(&path))?,
        Err(_) => FabricConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "resilience-fabric starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let backend = connect_backend(&config.state_store).await?;
    tracing::info!(backend = ?config.state_store.backend, "State backend ready");
    let transport = Arc::new(HttpTransport::new()?);
    let (runtime, mut intents) = RuntimeContext::start(config, backend, transport).await?;

    let orchestrator = tokio::spawn(async move {
        while let Some(intent) = intents.recv().await {
            tracing::info!(
                service = %intent.service,
                direction = intent.direction.as_str(),
                desired = intent.desired_instances,
                "Scaling intent awaiting orchestrator"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    runtime.shutdown().await;
    orchestrator.abort();
    tracing::info!("Shutdown complete");
    Ok(())
}
