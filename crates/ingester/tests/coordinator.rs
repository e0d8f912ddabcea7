//! Integration tests for the ingestion coordinator.
//!
//! Uses the in-memory association store and a scripted ingestor to verify
//! eligibility rules, watermark commits, failure isolation and store-failure
//! propagation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use infoset_core::device_agent::PairKey;
use infoset_core::types::{DbId, EpochSecs};
use infoset_db::models::device_agent::DeviceAgent;
use infoset_db::registry::Registry;
use infoset_db::store::{AssociationStore, MemoryAssociationStore, StoreError};
use infoset_ingester::admission::{AdmissionConfig, AdmissionController};
use infoset_ingester::coordinator::{
    CoordinatorError, CycleReport, Eligibility, IngestRequest, IngestionCoordinator,
};
use infoset_ingester::ingest::{CacheDirIngestor, IngestError, Ingestor};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Ingestor that replays a fixed answer per pair and records every call.
#[derive(Default)]
struct ScriptedIngestor {
    answers: Mutex<HashMap<PairKey, Result<Option<EpochSecs>, String>>>,
    calls: Mutex<Vec<PairKey>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedIngestor {
    fn answer(&self, pair: PairKey, answer: Result<Option<EpochSecs>, &str>) {
        self.answers
            .lock()
            .unwrap()
            .insert(pair, answer.map_err(str::to_string));
    }

    fn calls(&self) -> Vec<PairKey> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Ingestor for ScriptedIngestor {
    async fn ingest(&self, pair: PairKey) -> Result<Option<EpochSecs>, IngestError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.lock().unwrap().push(pair);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let answer = self
            .answers
            .lock()
            .unwrap()
            .get(&pair)
            .cloned()
            .unwrap_or(Ok(None));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        answer.map_err(IngestError::Other)
    }
}

struct Harness {
    store: Arc<MemoryAssociationStore>,
    ingestor: Arc<ScriptedIngestor>,
    coordinator: IngestionCoordinator,
}

fn harness_with(ingestor: ScriptedIngestor, pool_size: usize) -> Harness {
    let store = Arc::new(MemoryAssociationStore::new());
    let ingestor = Arc::new(ingestor);
    let admission = Arc::new(AdmissionController::new(AdmissionConfig {
        pool_size,
        queue_capacity: pool_size * 4,
    }));
    let coordinator =
        IngestionCoordinator::new(Registry::new(store.clone()), admission, ingestor.clone());
    Harness {
        store,
        ingestor,
        coordinator,
    }
}

fn harness() -> Harness {
    harness_with(ScriptedIngestor::default(), 4)
}

fn coordinator_over(
    store: Arc<dyn AssociationStore>,
    ingestor: Arc<dyn Ingestor>,
) -> IngestionCoordinator {
    let admission = Arc::new(AdmissionController::new(AdmissionConfig {
        pool_size: 4,
        queue_capacity: 16,
    }));
    IngestionCoordinator::new(Registry::new(store), admission, ingestor)
}

/// Memory store with injectable faults: lookups for one device id, or every
/// upsert, fail as if the database went away.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryAssociationStore,
    failing_device: Option<DbId>,
    fail_upserts: AtomicBool,
}

impl FaultyStore {
    fn down() -> StoreError {
        StoreError::Unavailable("down".into())
    }
}

#[async_trait]
impl AssociationStore for FaultyStore {
    async fn find_by_pair(
        &self,
        device_id: Option<DbId>,
        agent_id: Option<DbId>,
    ) -> Result<Option<DeviceAgent>, StoreError> {
        if device_id.is_some() && device_id == self.failing_device {
            return Err(Self::down());
        }
        self.inner.find_by_pair(device_id, agent_id).await
    }

    async fn find_by_id(&self, id: Option<DbId>) -> Result<Option<DeviceAgent>, StoreError> {
        self.inner.find_by_id(id).await
    }

    async fn exists(
        &self,
        device_id: Option<DbId>,
        agent_id: Option<DbId>,
    ) -> Result<bool, StoreError> {
        self.inner.exists(device_id, agent_id).await
    }

    async fn upsert(
        &self,
        device_id: DbId,
        agent_id: DbId,
        ts: EpochSecs,
    ) -> Result<DbId, StoreError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(Self::down());
        }
        self.inner.upsert(device_id, agent_id, ts).await
    }

    async fn set_enabled(&self, id: DbId, enabled: bool) -> Result<bool, StoreError> {
        self.inner.set_enabled(id, enabled).await
    }

    async fn list_device_ids(&self) -> Result<Vec<DbId>, StoreError> {
        self.inner.list_device_ids().await
    }

    async fn list_device_ids_for_agent(
        &self,
        agent_id: Option<DbId>,
    ) -> Result<Vec<DbId>, StoreError> {
        self.inner.list_device_ids_for_agent(agent_id).await
    }

    async fn list_agent_ids_for_device(
        &self,
        device_id: Option<DbId>,
    ) -> Result<Vec<DbId>, StoreError> {
        self.inner.list_agent_ids_for_device(device_id).await
    }

    async fn list_all(&self) -> Result<Vec<DeviceAgent>, StoreError> {
        self.inner.list_all().await
    }
}

// ---------------------------------------------------------------------------
// Eligibility
// ---------------------------------------------------------------------------

#[tokio::test]
async fn poll_requires_existing_enabled_association() {
    let h = harness();
    let known = PairKey::new(1, 1);
    let disabled = PairKey::new(2, 1);
    h.store.upsert(1, 1, 100).await.unwrap();
    let id = h.store.upsert(2, 1, 100).await.unwrap();
    h.store.set_enabled(id, false).await.unwrap();

    let c = &h.coordinator;
    assert_eq!(
        c.eligibility(&IngestRequest::poll(known)).await.unwrap(),
        Eligibility::Eligible
    );
    assert_eq!(
        c.eligibility(&IngestRequest::poll(disabled)).await.unwrap(),
        Eligibility::Disabled
    );
    assert_eq!(
        c.eligibility(&IngestRequest::poll(PairKey::new(3, 3))).await.unwrap(),
        Eligibility::Missing
    );
}

#[tokio::test]
async fn receive_admits_unknown_but_not_disabled() {
    let h = harness();
    let id = h.store.upsert(2, 1, 100).await.unwrap();
    h.store.set_enabled(id, false).await.unwrap();

    let c = &h.coordinator;
    assert_eq!(
        c.eligibility(&IngestRequest::receive(PairKey::new(3, 3))).await.unwrap(),
        Eligibility::Eligible
    );
    assert_eq!(
        c.eligibility(&IngestRequest::receive(PairKey::new(2, 1))).await.unwrap(),
        Eligibility::Disabled
    );
}

#[tokio::test]
async fn invalid_pair_is_never_submitted() {
    let h = harness();
    let pair = PairKey::new(0, 1);
    h.ingestor.answer(pair, Ok(Some(100)));

    let c = &h.coordinator;
    for request in [IngestRequest::receive(pair), IngestRequest::poll(pair)] {
        assert_eq!(c.eligibility(&request).await.unwrap(), Eligibility::Missing);
    }

    let report = c.run_cycle(&[IngestRequest::receive(pair)]).await.unwrap();
    assert_eq!(report.skipped_missing, 1);
    assert_eq!(report.submitted, 0);
    assert!(h.ingestor.calls().is_empty());
    assert!(h.store.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn disabled_association_is_never_submitted() {
    let h = harness();
    let pair = PairKey::new(5, 6);
    let id = h.store.upsert(5, 6, 100).await.unwrap();
    h.store.set_enabled(id, false).await.unwrap();
    h.ingestor.answer(pair, Ok(Some(500)));

    let report = h
        .coordinator
        .run_cycle(&[IngestRequest::poll(pair), IngestRequest::receive(pair)])
        .await
        .unwrap();

    assert_eq!(report.skipped_disabled, 2);
    assert_eq!(report.submitted, 0);
    assert!(h.ingestor.calls().is_empty());
    let row = h.store.find_by_id(Some(id)).await.unwrap().unwrap();
    assert_eq!(row.last_timestamp, 100);
    assert!(!row.enabled);
}

// ---------------------------------------------------------------------------
// Watermarks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_poll_advances_watermark() {
    let h = harness();
    let pair = PairKey::new(1, 1);
    h.store.upsert(1, 1, 1000).await.unwrap();
    h.ingestor.answer(pair, Ok(Some(1300)));

    let report = h.coordinator.run_cycle(&[IngestRequest::poll(pair)]).await.unwrap();
    assert_eq!(
        report,
        CycleReport {
            submitted: 1,
            committed: 1,
            ..CycleReport::default()
        }
    );

    let record = h.coordinator.registry().device_agent(Some(1), Some(1)).await.unwrap();
    assert_eq!(record.last_timestamp(), Some(1300));
    assert_eq!(record.enabled(), Some(true));
}

#[tokio::test]
async fn receive_creates_association_on_first_sight() {
    let h = harness();
    let pair = PairKey::new(8, 2);
    h.ingestor.answer(pair, Ok(Some(1000)));

    let report = h.coordinator.run_cycle(&[IngestRequest::receive(pair)]).await.unwrap();
    assert_eq!(report.committed, 1);

    let record = h.coordinator.registry().device_agent(Some(8), Some(2)).await.unwrap();
    assert!(record.exists());
    assert_eq!(record.enabled(), Some(true));
    assert_eq!(record.last_timestamp(), Some(1000));
}

#[tokio::test]
async fn older_batch_does_not_move_watermark_back() {
    let h = harness();
    let pair = PairKey::new(1, 1);
    h.store.upsert(1, 1, 1000).await.unwrap();
    h.ingestor.answer(pair, Ok(Some(900)));

    let report = h.coordinator.run_cycle(&[IngestRequest::poll(pair)]).await.unwrap();
    assert_eq!(report.committed, 1);
    let record = h.coordinator.registry().device_agent(Some(1), Some(1)).await.unwrap();
    assert_eq!(record.last_timestamp(), Some(1000));
}

#[tokio::test]
async fn nothing_pending_leaves_store_untouched() {
    let h = harness();
    let pair = PairKey::new(4, 4);

    let report = h.coordinator.run_cycle(&[IngestRequest::receive(pair)]).await.unwrap();
    assert_eq!(report.empty, 1);
    assert_eq!(report.committed, 0);
    assert!(!h.store.exists(Some(4), Some(4)).await.unwrap());
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_failing_agent_does_not_block_others() {
    let h = harness();
    let bad = PairKey::new(1, 7);
    let good = PairKey::new(2, 8);
    h.store.upsert(1, 7, 100).await.unwrap();
    h.store.upsert(2, 8, 100).await.unwrap();
    h.ingestor.answer(bad, Err("agent unreachable"));
    h.ingestor.answer(good, Ok(Some(200)));

    let requests = [IngestRequest::poll(bad), IngestRequest::poll(good)];
    let report = h.coordinator.run_cycle(&requests).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.committed, 1);

    let report = h.coordinator.run_cycle(&requests).await.unwrap();
    assert_eq!(report.failed, 1);

    assert_eq!(h.coordinator.failure_counts().get(&7), Some(&2));
    assert_eq!(h.coordinator.failure_counts().get(&8), None);

    let bad_row = h.store.find_by_pair(Some(1), Some(7)).await.unwrap().unwrap();
    assert_eq!(bad_row.last_timestamp, 100);
    let good_row = h.store.find_by_pair(Some(2), Some(8)).await.unwrap().unwrap();
    assert_eq!(good_row.last_timestamp, 200);
}

#[tokio::test]
async fn store_outage_propagates() {
    let h = harness();
    h.store.upsert(1, 1, 100).await.unwrap();
    h.store.set_available(false);

    let result = h
        .coordinator
        .run_cycle(&[IngestRequest::poll(PairKey::new(1, 1))])
        .await;
    assert_matches!(result, Err(CoordinatorError::Store(StoreError::Unavailable(_))));
    assert!(h.ingestor.calls().is_empty());
}

#[tokio::test]
async fn lookup_failure_still_collects_submitted_units() {
    let store = Arc::new(FaultyStore {
        failing_device: Some(2),
        ..FaultyStore::default()
    });
    store.inner.upsert(1, 7, 100).await.unwrap();
    store.inner.upsert(2, 8, 100).await.unwrap();

    let ingestor = Arc::new(ScriptedIngestor::default());
    ingestor.answer(PairKey::new(1, 7), Err("agent unreachable"));
    ingestor.answer(PairKey::new(2, 8), Err("agent unreachable"));
    let coordinator = coordinator_over(store, ingestor.clone());

    let result = coordinator
        .run_cycle(&[
            IngestRequest::poll(PairKey::new(1, 7)),
            IngestRequest::poll(PairKey::new(2, 8)),
        ])
        .await;

    assert_matches!(result, Err(CoordinatorError::Store(StoreError::Unavailable(_))));
    assert_eq!(ingestor.calls(), vec![PairKey::new(1, 7)]);
    assert_eq!(coordinator.failure_counts(), HashMap::from([(7, 1)]));
}

#[tokio::test]
async fn failed_commit_keeps_staged_batches() {
    let dir = tempfile::tempdir().unwrap();
    let staged = dir.path().join("1000_5_1.json");
    std::fs::write(&staged, r#"{"cpu": 40}"#).unwrap();

    let store = Arc::new(FaultyStore::default());
    store.fail_upserts.store(true, Ordering::SeqCst);
    let cache = Arc::new(CacheDirIngestor::new(dir.path()));
    let coordinator = coordinator_over(store.clone(), cache.clone());
    let requests = [IngestRequest::receive(PairKey::new(5, 1))];

    let result = coordinator.run_cycle(&requests).await;
    assert_matches!(result, Err(CoordinatorError::Store(StoreError::Unavailable(_))));
    assert!(staged.exists());
    assert_eq!(cache.pending_pairs().await.unwrap(), vec![PairKey::new(5, 1)]);
    assert!(!store.exists(Some(5), Some(1)).await.unwrap());

    store.fail_upserts.store(false, Ordering::SeqCst);
    let report = coordinator.run_cycle(&requests).await.unwrap();
    assert_eq!(report.committed, 1);
    assert!(!staged.exists());
    let row = store.find_by_pair(Some(5), Some(1)).await.unwrap().unwrap();
    assert_eq!(row.last_timestamp, 1000);
}

#[tokio::test]
async fn rejected_after_drain() {
    let h = harness();
    let pair = PairKey::new(1, 1);
    h.store.upsert(1, 1, 100).await.unwrap();
    h.coordinator.admission().drain(Duration::from_millis(10)).await;

    let report = h.coordinator.run_cycle(&[IngestRequest::poll(pair)]).await.unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(report.submitted, 0);
    assert!(h.ingestor.calls().is_empty());
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_requests_for_one_pair_never_overlap() {
    let h = harness_with(
        ScriptedIngestor {
            delay: Some(Duration::from_millis(10)),
            ..ScriptedIngestor::default()
        },
        4,
    );
    let pair = PairKey::new(3, 3);
    h.ingestor.answer(pair, Ok(Some(10)));

    let requests = vec![IngestRequest::receive(pair); 5];
    let report = h.coordinator.run_cycle(&requests).await.unwrap();
    assert_eq!(report.committed, 5);
    assert_eq!(h.ingestor.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.list_all().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_pairs_respect_pool_ceiling() {
    let h = harness_with(
        ScriptedIngestor {
            delay: Some(Duration::from_millis(20)),
            ..ScriptedIngestor::default()
        },
        2,
    );
    let requests: Vec<IngestRequest> = (1..=6)
        .map(|d| IngestRequest::receive(PairKey::new(d, 1)))
        .collect();
    for request in &requests {
        h.ingestor.answer(request.pair, Ok(Some(50)));
    }

    let report = h.coordinator.run_cycle(&requests).await.unwrap();
    assert_eq!(report.committed, 6);
    assert!(h.ingestor.max_in_flight.load(Ordering::SeqCst) <= 2);
    assert_eq!(
        h.coordinator.registry().all_device_indices().await.unwrap(),
        vec![1, 2, 3, 4, 5, 6]
    );
}
