//! The association store contract and its implementations.
//!
//! Callers hold an `Arc<dyn AssociationStore>` instead of a pool so the
//! registry and the ingester never touch process-wide session state, and so
//! tests can swap in [`MemoryAssociationStore`].

use async_trait::async_trait;
use infoset_core::types::{DbId, EpochSecs};

use crate::models::device_agent::DeviceAgent;

mod memory;
mod postgres;

pub use memory::MemoryAssociationStore;
pub use postgres::PgAssociationStore;

/// Failure to reach or use the backing store.
///
/// "Not found" is never an error; lookups return `Option` for that.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Association store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid association identity: device {device_id}, agent {agent_id}")]
    InvalidIdentity { device_id: DbId, agent_id: DbId },
}

/// Persistence for device-agent associations.
///
/// Ids that cannot name a row (absent or non-positive) yield `None`, `false`
/// or an empty listing without touching the backing store. Listings of ids
/// are ascending and duplicate-free.
#[async_trait]
pub trait AssociationStore: Send + Sync {
    async fn find_by_pair(
        &self,
        device_id: Option<DbId>,
        agent_id: Option<DbId>,
    ) -> Result<Option<DeviceAgent>, StoreError>;

    async fn find_by_id(&self, association_id: Option<DbId>)
        -> Result<Option<DeviceAgent>, StoreError>;

    async fn exists(&self, device_id: Option<DbId>, agent_id: Option<DbId>)
        -> Result<bool, StoreError>;

    /// Create the association if absent (enabled), otherwise advance its
    /// watermark to `max(existing, timestamp)`. Returns the association id.
    ///
    /// Ids that cannot name an association are refused with
    /// [`StoreError::InvalidIdentity`] before the backing store is touched.
    async fn upsert(
        &self,
        device_id: DbId,
        agent_id: DbId,
        timestamp: EpochSecs,
    ) -> Result<DbId, StoreError>;

    /// Administrative toggle. Returns `true` if an association was updated.
    async fn set_enabled(&self, association_id: DbId, enabled: bool) -> Result<bool, StoreError>;

    async fn list_device_ids(&self) -> Result<Vec<DbId>, StoreError>;

    async fn list_device_ids_for_agent(&self, agent_id: Option<DbId>)
        -> Result<Vec<DbId>, StoreError>;

    async fn list_agent_ids_for_device(&self, device_id: Option<DbId>)
        -> Result<Vec<DbId>, StoreError>;

    /// Every association ordered by id. Not a consistent snapshot if rows
    /// change during the read.
    async fn list_all(&self) -> Result<Vec<DeviceAgent>, StoreError>;
}
