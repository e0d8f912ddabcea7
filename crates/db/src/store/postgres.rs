use async_trait::async_trait;
use infoset_core::device_agent::{valid_id, valid_pair};
use infoset_core::types::{DbId, EpochSecs};
use sqlx::PgPool;

use super::{AssociationStore, StoreError};
use crate::models::device_agent::DeviceAgent;
use crate::repositories::DeviceAgentRepo;

/// [`AssociationStore`] backed by the `device_agents` table.
#[derive(Debug, Clone)]
pub struct PgAssociationStore {
    pool: PgPool,
}

impl PgAssociationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssociationStore for PgAssociationStore {
    async fn find_by_pair(
        &self,
        device_id: Option<DbId>,
        agent_id: Option<DbId>,
    ) -> Result<Option<DeviceAgent>, StoreError> {
        let Some(pair) = valid_pair(device_id, agent_id) else {
            return Ok(None);
        };
        Ok(DeviceAgentRepo::find_by_pair(&self.pool, pair.device_id, pair.agent_id).await?)
    }

    async fn find_by_id(
        &self,
        association_id: Option<DbId>,
    ) -> Result<Option<DeviceAgent>, StoreError> {
        let Some(id) = valid_id(association_id) else {
            return Ok(None);
        };
        Ok(DeviceAgentRepo::find_by_id(&self.pool, id).await?)
    }

    async fn exists(
        &self,
        device_id: Option<DbId>,
        agent_id: Option<DbId>,
    ) -> Result<bool, StoreError> {
        let Some(pair) = valid_pair(device_id, agent_id) else {
            return Ok(false);
        };
        Ok(DeviceAgentRepo::exists(&self.pool, pair.device_id, pair.agent_id).await?)
    }

    async fn upsert(
        &self,
        device_id: DbId,
        agent_id: DbId,
        timestamp: EpochSecs,
    ) -> Result<DbId, StoreError> {
        let pair = valid_pair(Some(device_id), Some(agent_id))
            .ok_or(StoreError::InvalidIdentity { device_id, agent_id })?;
        Ok(DeviceAgentRepo::upsert(&self.pool, pair.device_id, pair.agent_id, timestamp).await?)
    }

    async fn set_enabled(&self, association_id: DbId, enabled: bool) -> Result<bool, StoreError> {
        Ok(DeviceAgentRepo::set_enabled(&self.pool, association_id, enabled).await?)
    }

    async fn list_device_ids(&self) -> Result<Vec<DbId>, StoreError> {
        Ok(DeviceAgentRepo::list_device_ids(&self.pool).await?)
    }

    async fn list_device_ids_for_agent(
        &self,
        agent_id: Option<DbId>,
    ) -> Result<Vec<DbId>, StoreError> {
        let Some(agent_id) = valid_id(agent_id) else {
            return Ok(Vec::new());
        };
        Ok(DeviceAgentRepo::list_device_ids_for_agent(&self.pool, agent_id).await?)
    }

    async fn list_agent_ids_for_device(
        &self,
        device_id: Option<DbId>,
    ) -> Result<Vec<DbId>, StoreError> {
        let Some(device_id) = valid_id(device_id) else {
            return Ok(Vec::new());
        };
        Ok(DeviceAgentRepo::list_agent_ids_for_device(&self.pool, device_id).await?)
    }

    async fn list_all(&self) -> Result<Vec<DeviceAgent>, StoreError> {
        Ok(DeviceAgentRepo::list_all(&self.pool).await?)
    }
}
