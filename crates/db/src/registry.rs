//! Registry lookup service over an [`AssociationStore`].
//!
//! Lookups are fail-soft: an absent, malformed or unknown identity produces a
//! [`DeviceAgentLookup`] whose `exists()` is false and whose accessors all
//! return `None`. Only a store failure is reported as an error.

use std::sync::Arc;

use infoset_core::types::{DbId, EpochSecs};

use crate::models::device_agent::{DeviceAgent, DeviceAgentSnapshot};
use crate::store::{AssociationStore, StoreError};

// ---------------------------------------------------------------------------
// Per-association lookup
// ---------------------------------------------------------------------------

/// One association as seen by a single lookup, or its absence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceAgentLookup {
    row: Option<DeviceAgent>,
}

impl DeviceAgentLookup {
    /// Look up by the natural (device, agent) key.
    pub async fn by_pair(
        store: &dyn AssociationStore,
        device_id: Option<DbId>,
        agent_id: Option<DbId>,
    ) -> Result<Self, StoreError> {
        let row = store.find_by_pair(device_id, agent_id).await?;
        Ok(Self { row })
    }

    /// Look up by surrogate association id.
    pub async fn by_id(
        store: &dyn AssociationStore,
        association_id: Option<DbId>,
    ) -> Result<Self, StoreError> {
        let row = store.find_by_id(association_id).await?;
        Ok(Self { row })
    }

    pub fn exists(&self) -> bool {
        self.row.is_some()
    }

    pub fn enabled(&self) -> Option<bool> {
        self.row.as_ref().map(|r| r.enabled)
    }

    pub fn last_timestamp(&self) -> Option<EpochSecs> {
        self.row.as_ref().map(|r| r.last_timestamp)
    }

    pub fn association_id(&self) -> Option<DbId> {
        self.row.as_ref().map(|r| r.id)
    }

    pub fn device_id(&self) -> Option<DbId> {
        self.row.as_ref().map(|r| r.device_id)
    }

    pub fn agent_id(&self) -> Option<DbId> {
        self.row.as_ref().map(|r| r.agent_id)
    }

    /// Full snapshot for serialization.
    pub fn everything(&self) -> DeviceAgentSnapshot {
        self.row
            .as_ref()
            .map(DeviceAgentSnapshot::from)
            .unwrap_or_default()
    }

    /// The underlying row, if any.
    pub fn row(&self) -> Option<&DeviceAgent> {
        self.row.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Shared handle to the association registry.
///
/// Cheap to clone; every clone talks to the same store.
#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn AssociationStore>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(store: Arc<dyn AssociationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &dyn AssociationStore {
        self.store.as_ref()
    }

    // ── Single-association lookups ───────────────────────────────────────

    pub async fn device_agent(
        &self,
        device_id: Option<DbId>,
        agent_id: Option<DbId>,
    ) -> Result<DeviceAgentLookup, StoreError> {
        DeviceAgentLookup::by_pair(self.store(), device_id, agent_id).await
    }

    pub async fn device_agent_by_id(
        &self,
        association_id: Option<DbId>,
    ) -> Result<DeviceAgentLookup, StoreError> {
        DeviceAgentLookup::by_id(self.store(), association_id).await
    }

    /// Existence-only probe; does not fetch the row.
    pub async fn device_agent_exists(
        &self,
        device_id: Option<DbId>,
        agent_id: Option<DbId>,
    ) -> Result<bool, StoreError> {
        self.store.exists(device_id, agent_id).await
    }

    // ── Bulk listings ────────────────────────────────────────────────────

    /// Every device id with at least one association.
    pub async fn all_device_indices(&self) -> Result<Vec<DbId>, StoreError> {
        self.store.list_device_ids().await
    }

    /// Device ids the given agent reports on.
    pub async fn device_indices(&self, agent_id: Option<DbId>) -> Result<Vec<DbId>, StoreError> {
        self.store.list_device_ids_for_agent(agent_id).await
    }

    /// Agent ids reporting on the given device.
    pub async fn agent_indices(&self, device_id: Option<DbId>) -> Result<Vec<DbId>, StoreError> {
        self.store.list_agent_ids_for_device(device_id).await
    }

    /// Snapshot of every association, ordered by association id.
    pub async fn get_all_device_agents(&self) -> Result<Vec<DeviceAgentSnapshot>, StoreError> {
        let rows = self.store.list_all().await?;
        Ok(rows.iter().map(DeviceAgentSnapshot::from).collect())
    }

    // ── Ingest bookkeeping ───────────────────────────────────────────────

    /// Record a successful ingestion, creating the association if needed.
    pub async fn record_ingest(
        &self,
        device_id: DbId,
        agent_id: DbId,
        timestamp: EpochSecs,
    ) -> Result<DbId, StoreError> {
        let association_id = self.store.upsert(device_id, agent_id, timestamp).await?;
        tracing::debug!(
            association_id,
            device_id,
            agent_id,
            timestamp,
            "Recorded ingest watermark",
        );
        Ok(association_id)
    }
}
