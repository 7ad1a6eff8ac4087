// API server clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! creditsync API Server
//!
//! Receives Polar webhooks and reconciles them into credit grants.

use std::net::SocketAddr;

use creditsync_api::{create_router, AppState, Config};
use creditsync_billing::{BillingService, GrantStore};
use creditsync_shared::{create_migration_pool, create_pool, run_migrations};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,creditsync_api=debug,creditsync_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting creditsync API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Create database pool (using pooler URL for regular queries)
    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    tracing::info!("Database connection established");

    // Run migrations using direct URL (bypasses PgBouncer which doesn't support prepared statements)
    if config.run_migrations {
        tracing::info!("Running database migrations...");
        let migration_url = config
            .database_direct_url
            .as_deref()
            .unwrap_or(&config.database_url);
        let migration_pool = create_migration_pool(migration_url).await?;
        run_migrations(&migration_pool).await?;
        migration_pool.close().await;
        tracing::info!("Database migrations complete");
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS=false)");
    }

    // Billing service probes optional columns before the first delivery
    let billing = BillingService::from_env(pool.clone()).await?;
    tracing::info!(
        capabilities = ?billing.store.capabilities(),
        "Billing service initialized"
    );

    let public_url = config.public_url.clone();
    let addr: SocketAddr = config.bind_address.parse()?;
    let state = AppState::new(pool, config, billing.webhooks)?;

    let app = create_router(state).layer(TraceLayer::new_for_http());

    tracing::info!(
        webhook_url = %format!("{}/webhooks/polar", public_url.trim_end_matches('/')),
        "Starting server on {}",
        addr
    );

    // Start the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
