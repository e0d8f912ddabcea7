//! Ingestion coordinator.
//!
//! For each pair that is due, consults the registry, submits eligible work to
//! the [`AdmissionController`], and records the resulting watermark. The
//! watermark upsert runs inside the unit of work, so it executes while the
//! pair's key is held and never races another write to the same association.
//! The ingestor is acked only after the upsert commits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use infoset_core::device_agent::{valid_pair, PairKey};
use infoset_core::types::{DbId, EpochSecs};
use infoset_db::registry::Registry;
use infoset_db::store::StoreError;

use crate::admission::{AdmissionController, AdmissionError, Ticket};
use crate::ingest::{IngestError, Ingestor};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How the pair came to be due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Scheduled pull. Only known, enabled associations are ingested.
    ///
    /// For pull-based ingestors driven from the registry's own listings.
    /// [`service::run`](crate::service::run) works from staged batches and
    /// only issues `Receive`.
    Poll,
    /// The agent was seen reporting. Unknown pairs are admitted so the first
    /// ingestion creates the association; disabled ones are still skipped.
    Receive,
}

/// One "ingest now" request from the scheduling trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestRequest {
    pub pair: PairKey,
    pub mode: IngestMode,
}

impl IngestRequest {
    pub fn poll(pair: PairKey) -> Self {
        Self {
            pair,
            mode: IngestMode::Poll,
        }
    }

    pub fn receive(pair: PairKey) -> Self {
        Self {
            pair,
            mode: IngestMode::Receive,
        }
    }
}

/// Registry verdict for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Missing,
    Disabled,
}

/// Watermark written by a successful unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub association_id: DbId,
    pub timestamp: EpochSecs,
}

/// Tallies for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub submitted: usize,
    pub committed: usize,
    /// Units that succeeded with nothing pending.
    pub empty: usize,
    pub failed: usize,
    pub skipped_missing: usize,
    pub skipped_disabled: usize,
    pub rejected: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a unit hands back: the ingest result, with a store failure kept
/// separate so it is not mistaken for an isolated task failure.
type UnitOutput = Result<Option<Committed>, StoreError>;

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct IngestionCoordinator {
    registry: Registry,
    admission: Arc<AdmissionController<PairKey>>,
    ingestor: Arc<dyn Ingestor>,
    failures: Mutex<HashMap<DbId, u64>>,
}

impl std::fmt::Debug for IngestionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionCoordinator")
            .field("admission", &self.admission)
            .finish_non_exhaustive()
    }
}

impl IngestionCoordinator {
    pub fn new(
        registry: Registry,
        admission: Arc<AdmissionController<PairKey>>,
        ingestor: Arc<dyn Ingestor>,
    ) -> Self {
        Self {
            registry,
            admission,
            ingestor,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn admission(&self) -> &Arc<AdmissionController<PairKey>> {
        &self.admission
    }

    /// Failed units per agent id since startup.
    pub fn failure_counts(&self) -> HashMap<DbId, u64> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Decide whether a request may be submitted.
    ///
    /// A pair whose ids cannot name an association is `Missing` in either
    /// mode.
    pub async fn eligibility(&self, request: &IngestRequest) -> Result<Eligibility, StoreError> {
        let pair = request.pair;
        if valid_pair(Some(pair.device_id), Some(pair.agent_id)).is_none() {
            return Ok(Eligibility::Missing);
        }
        let record = self
            .registry
            .device_agent(Some(pair.device_id), Some(pair.agent_id))
            .await?;

        Ok(match (record.exists(), record.enabled(), request.mode) {
            (true, Some(true), _) => Eligibility::Eligible,
            (true, _, _) => Eligibility::Disabled,
            (false, _, IngestMode::Receive) => Eligibility::Eligible,
            (false, _, IngestMode::Poll) => Eligibility::Missing,
        })
    }

    /// Submit one request. Returns `None` when the registry rules it out.
    async fn dispatch(
        &self,
        request: &IngestRequest,
        report: &mut CycleReport,
    ) -> Result<Option<Ticket<UnitOutput>>, StoreError> {
        let pair = request.pair;
        match self.eligibility(request).await? {
            Eligibility::Eligible => {}
            Eligibility::Missing => {
                tracing::debug!(
                    device_id = pair.device_id,
                    agent_id = pair.agent_id,
                    "Skipping unknown association",
                );
                report.skipped_missing += 1;
                return Ok(None);
            }
            Eligibility::Disabled => {
                tracing::debug!(
                    device_id = pair.device_id,
                    agent_id = pair.agent_id,
                    "Skipping disabled association",
                );
                report.skipped_disabled += 1;
                return Ok(None);
            }
        }

        let registry = self.registry.clone();
        let ingestor = Arc::clone(&self.ingestor);
        let unit = async move {
            let Some(timestamp) = ingestor.ingest(pair).await? else {
                return Ok::<UnitOutput, IngestError>(Ok(None));
            };
            let association_id = match registry
                .record_ingest(pair.device_id, pair.agent_id, timestamp)
                .await
            {
                Ok(id) => id,
                Err(e) => return Ok(Err(e)),
            };
            // A failed ack leaves the input staged; re-reading it is harmless
            // because the watermark never moves backward.
            ingestor.ack(pair, timestamp).await?;
            Ok(Ok(Some(Committed {
                association_id,
                timestamp,
            })))
        };

        match self.admission.submit(pair, unit).await {
            Ok(ticket) => {
                report.submitted += 1;
                Ok(Some(ticket))
            }
            Err(AdmissionError::Rejected) => {
                tracing::warn!(
                    device_id = pair.device_id,
                    agent_id = pair.agent_id,
                    "Admission rejected, ingester is shutting down",
                );
                report.rejected += 1;
                Ok(None)
            }
        }
    }

    /// Run one scheduling cycle over `requests`.
    ///
    /// A failing unit is logged and counted against its agent; the rest of
    /// the cycle continues. A store failure stops further dispatch and is
    /// returned after every already-submitted unit has been collected.
    pub async fn run_cycle(
        &self,
        requests: &[IngestRequest],
    ) -> Result<CycleReport, CoordinatorError> {
        let mut report = CycleReport::default();
        let mut in_flight = Vec::with_capacity(requests.len());
        let mut store_error = None;

        for request in requests {
            match self.dispatch(request, &mut report).await {
                Ok(Some(ticket)) => in_flight.push((request.pair, ticket)),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        device_id = request.pair.device_id,
                        agent_id = request.pair.agent_id,
                        error = %e,
                        in_flight = in_flight.len(),
                        "Registry lookup failed, stopping dispatch",
                    );
                    store_error = Some(e);
                    break;
                }
            }
        }

        for (pair, ticket) in in_flight {
            match ticket.outcome().await {
                Ok(Ok(Some(committed))) => {
                    tracing::info!(
                        association_id = committed.association_id,
                        device_id = pair.device_id,
                        agent_id = pair.agent_id,
                        timestamp = committed.timestamp,
                        "Ingested",
                    );
                    report.committed += 1;
                }
                Ok(Ok(None)) => {
                    report.empty += 1;
                }
                Ok(Err(e)) => {
                    tracing::error!(
                        device_id = pair.device_id,
                        agent_id = pair.agent_id,
                        error = %e,
                        "Watermark update failed",
                    );
                    report.failed += 1;
                    store_error.get_or_insert(e);
                }
                Err(e) => {
                    tracing::warn!(
                        device_id = pair.device_id,
                        agent_id = pair.agent_id,
                        error = %e,
                        "Ingestion task failed",
                    );
                    report.failed += 1;
                    self.record_failure(pair.agent_id);
                }
            }
        }

        match store_error {
            Some(e) => Err(e.into()),
            None => Ok(report),
        }
    }

    fn record_failure(&self, agent_id: DbId) {
        *self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(agent_id)
            .or_default() += 1;
    }
}
