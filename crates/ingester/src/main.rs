use std::sync::Arc;

use anyhow::Context;
use infoset_db::registry::Registry;
use infoset_db::store::PgAssociationStore;
use infoset_ingester::admission::AdmissionController;
use infoset_ingester::config::IngesterConfig;
use infoset_ingester::coordinator::IngestionCoordinator;
use infoset_ingester::ingest::CacheDirIngestor;
use infoset_ingester::logging;
use infoset_ingester::service::{self, ServiceOptions};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = IngesterConfig::from_env().context("Invalid ingester configuration")?;

    // --- Tracing ---
    logging::init(config.log_format);
    tracing::info!(
        pool_size = config.ingest_pool_size,
        interval_secs = config.interval_secs,
        cache_dir = %config.ingest_cache_directory.display(),
        "Loaded ingester configuration",
    );

    // --- Database ---
    let pool = infoset_db::create_pool(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    infoset_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database health check passed");

    infoset_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    // --- Ingest cache ---
    tokio::fs::create_dir_all(&config.ingest_cache_directory)
        .await
        .with_context(|| {
            format!(
                "Failed to create ingest cache directory {}",
                config.ingest_cache_directory.display()
            )
        })?;

    // --- Coordinator ---
    let registry = Registry::new(Arc::new(PgAssociationStore::new(pool.clone())));
    let admission = Arc::new(AdmissionController::new(config.admission()));
    let cache = Arc::new(CacheDirIngestor::new(&config.ingest_cache_directory));
    let coordinator = IngestionCoordinator::new(registry, admission, cache.clone());

    // --- Shutdown signal ---
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let options = ServiceOptions {
        interval: config.interval(),
        drain_timeout: config.drain_timeout(),
        store_failure_limit: config.store_failure_limit,
    };
    let result = service::run(&coordinator, &cache, options, cancel).await;

    for (agent_id, failures) in coordinator.failure_counts() {
        tracing::info!(agent_id, failures, "Agent ingest failures this run");
    }

    pool.close().await;
    tracing::info!("Ingester stopped");

    result.context("Ingester stopped on a fatal error")
}

/// Wait for SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
