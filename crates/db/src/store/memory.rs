use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use infoset_core::device_agent::{merge_watermark, normalize_ids, valid_id, valid_pair, PairKey};
use infoset_core::types::{DbId, EpochSecs};
use tokio::sync::RwLock;

use super::{AssociationStore, StoreError};
use crate::models::device_agent::DeviceAgent;

/// In-process [`AssociationStore`] with the same semantics as the Postgres
/// store: surrogate ids start at 1, the pair is unique, and upserts never
/// move a watermark backward.
///
/// [`set_available`](Self::set_available) simulates a lost connection.
#[derive(Debug)]
pub struct MemoryAssociationStore {
    state: RwLock<MemoryState>,
    available: AtomicBool,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: BTreeMap<DbId, DeviceAgent>,
    by_pair: HashMap<PairKey, DbId>,
    next_id: DbId,
}

impl Default for MemoryAssociationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAssociationStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState {
                next_id: 1,
                ..MemoryState::default()
            }),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle whether operations succeed or fail with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store marked offline".into()))
        }
    }
}

#[async_trait]
impl AssociationStore for MemoryAssociationStore {
    async fn find_by_pair(
        &self,
        device_id: Option<DbId>,
        agent_id: Option<DbId>,
    ) -> Result<Option<DeviceAgent>, StoreError> {
        let Some(pair) = valid_pair(device_id, agent_id) else {
            return Ok(None);
        };
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .by_pair
            .get(&pair)
            .and_then(|id| state.rows.get(id))
            .cloned())
    }

    async fn find_by_id(
        &self,
        association_id: Option<DbId>,
    ) -> Result<Option<DeviceAgent>, StoreError> {
        let Some(id) = valid_id(association_id) else {
            return Ok(None);
        };
        self.check_available()?;
        Ok(self.state.read().await.rows.get(&id).cloned())
    }

    async fn exists(
        &self,
        device_id: Option<DbId>,
        agent_id: Option<DbId>,
    ) -> Result<bool, StoreError> {
        let Some(pair) = valid_pair(device_id, agent_id) else {
            return Ok(false);
        };
        self.check_available()?;
        Ok(self.state.read().await.by_pair.contains_key(&pair))
    }

    async fn upsert(
        &self,
        device_id: DbId,
        agent_id: DbId,
        timestamp: EpochSecs,
    ) -> Result<DbId, StoreError> {
        let pair = valid_pair(Some(device_id), Some(agent_id))
            .ok_or(StoreError::InvalidIdentity { device_id, agent_id })?;
        self.check_available()?;
        let mut state = self.state.write().await;
        let now = Utc::now();

        if let Some(&id) = state.by_pair.get(&pair) {
            if let Some(row) = state.rows.get_mut(&id) {
                row.last_timestamp = merge_watermark(row.last_timestamp, timestamp);
                row.updated_at = now;
            }
            return Ok(id);
        }

        let id = state.next_id;
        state.next_id += 1;
        state.by_pair.insert(pair, id);
        state.rows.insert(
            id,
            DeviceAgent {
                id,
                device_id,
                agent_id,
                enabled: true,
                last_timestamp: timestamp,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn set_enabled(&self, association_id: DbId, enabled: bool) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        match state.rows.get_mut(&association_id) {
            Some(row) => {
                row.enabled = enabled;
                row.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_device_ids(&self) -> Result<Vec<DbId>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut ids: Vec<DbId> = state.rows.values().map(|r| r.device_id).collect();
        normalize_ids(&mut ids);
        Ok(ids)
    }

    async fn list_device_ids_for_agent(
        &self,
        agent_id: Option<DbId>,
    ) -> Result<Vec<DbId>, StoreError> {
        let Some(agent_id) = valid_id(agent_id) else {
            return Ok(Vec::new());
        };
        self.check_available()?;
        let state = self.state.read().await;
        let mut ids: Vec<DbId> = state
            .rows
            .values()
            .filter(|r| r.agent_id == agent_id)
            .map(|r| r.device_id)
            .collect();
        normalize_ids(&mut ids);
        Ok(ids)
    }

    async fn list_agent_ids_for_device(
        &self,
        device_id: Option<DbId>,
    ) -> Result<Vec<DbId>, StoreError> {
        let Some(device_id) = valid_id(device_id) else {
            return Ok(Vec::new());
        };
        self.check_available()?;
        let state = self.state.read().await;
        let mut ids: Vec<DbId> = state
            .rows
            .values()
            .filter(|r| r.device_id == device_id)
            .map(|r| r.agent_id)
            .collect();
        normalize_ids(&mut ids);
        Ok(ids)
    }

    async fn list_all(&self) -> Result<Vec<DeviceAgent>, StoreError> {
        self.check_available()?;
        Ok(self.state.read().await.rows.values().cloned().collect())
    }
}
