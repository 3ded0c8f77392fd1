//! Tally Service - subscription and credit ledger engine.
//!
//! This is the main entry point for the tally service.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tally_service::{create_router, jobs, AppState, ServiceConfig};
use tally_store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tally=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Tally Service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        payments_configured = %config.payment_api_key.is_some(),
        audit_webhook_configured = %config.audit_webhook_url.is_some(),
        balance_ceiling = config.engine.balance_ceiling,
        rollover_factor_percent = config.engine.rollover_factor_percent,
        "Service configuration loaded"
    );

    let store = open_store(&config)?;

    // Build app state and start background jobs
    let state = AppState::new(store, config.clone());
    let _jobs = jobs::spawn(&Arc::new(state.clone()));

    // Create the router
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(feature = "rocksdb-backend")]
fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    Ok(Arc::new(tally_store::RocksStore::open(&config.data_dir)?))
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_store(_config: &ServiceConfig) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::warn!("Built without rocksdb-backend - using the in-memory store, data is not persisted");
    Ok(Arc::new(tally_store::MemoryStore::new()))
}
