// =============================================================================
// UNIT LIFECYCLE SERVICE - Main Entry Point
// =============================================================================
// Boots the lifecycle core against PostgreSQL and serves its operational
// endpoints.
//
// WHAT THIS BINARY DOES:
// - Loads configuration from the environment (.env supported)
// - Connects the pool and creates the schema if missing
// - Wires the unit repository over the Postgres store
// - Serves /health, /ready and /metrics
// =============================================================================

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use unit_lifecycle_service::config::Config;
use unit_lifecycle_service::db::Database;
use unit_lifecycle_service::handlers;
use unit_lifecycle_service::metrics::setup_metrics;
use unit_lifecycle_service::{AppState, UnitRepository};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Load environment variables
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok();

    // -------------------------------------------------------------------------
    // STEP 2: Initialize logging/tracing
    // -------------------------------------------------------------------------
    // RUST_LOG overrides, e.g. RUST_LOG=info,unit_lifecycle_service=trace
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,unit_lifecycle_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Unit Lifecycle Service...");

    // -------------------------------------------------------------------------
    // STEP 3: Load configuration
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(
        port = config.port,
        db_max_connections = config.db_max_connections,
        sku_max_attempts = config.sku_max_attempts,
        "Configuration loaded"
    );

    // -------------------------------------------------------------------------
    // STEP 4: Set up Prometheus metrics
    // -------------------------------------------------------------------------
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 5: Connect to PostgreSQL database
    // -------------------------------------------------------------------------
    let db = Database::connect(&config).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    // -------------------------------------------------------------------------
    // STEP 6: Create application state
    // -------------------------------------------------------------------------
    let units = UnitRepository::from_config(Arc::new(db), &config);
    let state = Arc::new(AppState {
        units,
        metrics_handle,
    });

    // -------------------------------------------------------------------------
    // STEP 7: Define routes
    // -------------------------------------------------------------------------
    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // -------------------------------------------------------------------------
    // STEP 8: Start the HTTP server
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Unit Lifecycle Service is listening");

    axum::serve(listener, app).await?;

    Ok(())
}
