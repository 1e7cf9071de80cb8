//! Shepherd API server

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use shepherd_api::clusters::client::KubeConnector;
use shepherd_api::clusters::store::CredentialStore;
use shepherd_api::config::ShepherdConfig;
use shepherd_api::db::Database;
use shepherd_api::shutdown::{ShutdownCoordinator, TaskShutdown};
use shepherd_api::AppState;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::args().nth(1).as_deref() == Some("--sample-config") {
        print!("{}", ShepherdConfig::generate_sample());
        return Ok(());
    }

    // Load configuration
    let config = ShepherdConfig::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let _log_guard = config
        .logging
        .init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Shepherd API");

    if config.accounts.is_empty() {
        warn!("No accounts configured; every API request will be rejected");
    }

    // Initialize database
    let database = match &config.database.url {
        Some(url) => {
            let database = Database::new(url, config.database.max_connections)
                .await
                .context("Failed to connect to database")?;
            database.migrate().await.context("Failed to run migrations")?;
            info!("Database initialized");
            Some(Arc::new(database))
        }
        None => {
            warn!("No database configured; registered clusters are kept in memory only");
            None
        }
    };

    let store = Arc::new(match &database {
        Some(database) => CredentialStore::with_database(database.clone()),
        None => CredentialStore::new(),
    });
    let loaded = store.load().await.context("Failed to load registered clusters")?;
    info!(clusters = loaded, "Credential store ready");

    let connector = Arc::new(KubeConnector::new(Duration::from_secs(config.rbac.timeout_secs)));
    let state = AppState::build(config, store, connector, database.clone());

    if state.config.in_cluster.enabled {
        match state.registry.ensure_in_cluster().await {
            Ok(cluster) => info!(server = %cluster.server, "In-cluster entry present"),
            Err(e) => error!(error = %e, "Failed to register in-cluster entry"),
        }
    }

    // Background probing and shutdown wiring
    let coordinator = ShutdownCoordinator::new();
    let mut tasks = TaskShutdown::new();
    tasks.register(
        "probe-sweep",
        state
            .registry
            .start_probe_sweep(state.config.probe_interval(), coordinator.subscribe()),
    );

    let signals = coordinator.clone();
    tokio::spawn(async move { signals.wait_for_signal().await });

    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Shepherd API listening on {}", addr);

    let app = shepherd_api::router(state.clone());
    let server_shutdown = coordinator.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.wait().await })
        .await
        .context("Server error")?;

    // Run cleanup after server stops
    info!("Server stopped, running cleanup");
    coordinator.shutdown();
    tasks.join_all(coordinator.timeout()).await;

    if let Some(database) = &state.database {
        database.close().await;
    }

    info!("Cleanup complete, exiting");
    Ok(())
}
