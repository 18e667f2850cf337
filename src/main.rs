//! ==============================================================================
//! main.rs - sensor host entry point
//! ==============================================================================
//!
//! purpose:
//!     wires the library together and runs until ctrl-c.
//!
//! startup:
//!     1. load host.toml (or defaults)
//!     2. init tracing (RUST_LOG wins over [logging] level)
//!     3. pick storage: mysql when database_url is set, in-memory otherwise
//!     4. bootstrap sessions, start the discovery refresh
//!     5. serve the operator api
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                    rust host (this file)                     │
//!     │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────────┐  │
//!     │  │ refresh     │  │ web api     │  │ session tasks        │  │
//!     │  │ (udp scan)  │  │ (port 3000) │  │ (tcp 5505, 1/device) │  │
//!     │  └──────┬──────┘  └──────┬──────┘  └──────────┬───────────┘  │
//!     │         └────────────────┼────────────────────┘              │
//!     │                    ┌─────┴─────┐                             │
//!     │                    │  manager  │ <- manager.rs               │
//!     │                    └─────┬─────┘                             │
//!     └──────────────────────────┼───────────────────────────────────┘
//!                                │
//!                    ┌───────────┴───────────┐
//!                    ▼                       ▼
//!             ┌─────────────┐         ┌─────────────┐
//!             │   mysql /   │         │ notification│
//!             │   memory    │         │     hub     │
//!             └─────────────┘         └─────────────┘
//!
//! ==============================================================================

use anyhow::{Context, Result};
use sensor_host::api::{self, ApiState};
use sensor_host::config::HostConfig;
use sensor_host::manager::SessionManager;
use sensor_host::notify::NotificationHub;
use sensor_host::persistence::{MemoryGateway, MySqlGateway, PersistenceGateway};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: configuration
    let (config, source) = HostConfig::load_or_default()?;

    // step 2: logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("===========================================================");
    tracing::info!("  Sensor Host - telemetry ingestion");
    tracing::info!("===========================================================");
    match &source {
        Some(path) => tracing::info!(path = %path.display(), "Loaded configuration"),
        None => tracing::info!("No host.toml found, using defaults"),
    }
    config.log_summary();

    // step 3: storage
    let gateway: Arc<dyn PersistenceGateway> = match &config.storage.database_url {
        Some(url) => Arc::new(
            MySqlGateway::connect(url)
                .await
                .context("Failed to connect to MySQL")?,
        ),
        None => {
            tracing::warn!("No database_url configured, readings are kept in memory only");
            Arc::new(MemoryGateway::with_devices(config.seed_devices()))
        }
    };

    // step 4: sessions
    let hub = Arc::new(NotificationHub::default());
    let api_bind = config.api.bind;
    let manager = Arc::new(SessionManager::new(config, gateway, hub.clone()));
    manager
        .bootstrap()
        .await
        .context("Failed to bootstrap sensor sessions")?;
    manager.spawn_refresh().await;

    // step 5: api
    let app = api::router(ApiState {
        manager: manager.clone(),
        hub,
    });
    let listener = tokio::net::TcpListener::bind(api_bind)
        .await
        .with_context(|| format!("Failed to bind api on {}", api_bind))?;
    tracing::info!(address = %api_bind, "Operator api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl-c");
            }
            tracing::info!("Shutdown requested");
        })
        .await
        .context("Api server error")?;

    manager.shutdown().await;
    tracing::info!("Sensor host stopped");
    Ok(())
}
