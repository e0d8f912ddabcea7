//! Ingester daemon loop.
//!
//! Scans the ingest cache directory every `interval`, runs a coordinator
//! cycle over the pairs with staged batches, and drains the admission pool on
//! shutdown. Runs on a fixed interval using `tokio::time::interval`.

use std::time::Duration;

use infoset_db::store::StoreError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::coordinator::{CoordinatorError, IngestRequest, IngestionCoordinator};
use crate::ingest::CacheDirIngestor;

/// Loop parameters.
#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    pub interval: Duration,
    pub drain_timeout: Duration,
    pub store_failure_limit: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Association store unavailable for {cycles} consecutive cycles: {source}")]
    StoreUnavailable {
        cycles: u32,
        #[source]
        source: StoreError,
    },
}

/// Run the ingest loop until `cancel` fires or the store stays down.
pub async fn run(
    coordinator: &IngestionCoordinator,
    cache: &CacheDirIngestor,
    options: ServiceOptions,
    cancel: CancellationToken,
) -> Result<(), ServiceError> {
    tracing::info!(
        interval_secs = options.interval.as_secs(),
        cache_dir = %cache.dir().display(),
        pool_size = coordinator.admission().config().pool_size,
        "Ingester loop started",
    );

    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive_store_failures = 0u32;

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Ingester loop shutting down");
                break Ok(());
            }
            _ = ticker.tick() => {}
        }

        let pairs = match cache.pending_pairs().await {
            Ok(pairs) => pairs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to scan ingest cache");
                continue;
            }
        };
        if pairs.is_empty() {
            tracing::debug!("No staged batches");
            continue;
        }

        let requests: Vec<IngestRequest> = pairs.into_iter().map(IngestRequest::receive).collect();
        match coordinator.run_cycle(&requests).await {
            Ok(report) => {
                consecutive_store_failures = 0;
                tracing::info!(
                    submitted = report.submitted,
                    committed = report.committed,
                    empty = report.empty,
                    failed = report.failed,
                    skipped_disabled = report.skipped_disabled,
                    rejected = report.rejected,
                    "Ingest cycle complete",
                );
            }
            Err(CoordinatorError::Store(e)) => {
                consecutive_store_failures += 1;
                tracing::error!(
                    error = %e,
                    consecutive = consecutive_store_failures,
                    limit = options.store_failure_limit,
                    "Ingest cycle aborted: association store unavailable",
                );
                if consecutive_store_failures >= options.store_failure_limit {
                    break Err(ServiceError::StoreUnavailable {
                        cycles: consecutive_store_failures,
                        source: e,
                    });
                }
            }
        }
    };

    let report = coordinator.admission().drain(options.drain_timeout).await;
    if !report.is_clean() {
        tracing::warn!(
            unresolved = report.unresolved.len(),
            pairs = ?report.unresolved,
            "Shutdown left ingestion work unresolved",
        );
    }

    outcome
}
