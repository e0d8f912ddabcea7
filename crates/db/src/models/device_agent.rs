//! Device-agent association models.

use infoset_core::types::{DbId, EpochSecs, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Entity structs (match database tables)
// ---------------------------------------------------------------------------

/// A row from the `device_agents` table.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct DeviceAgent {
    pub id: DbId,
    pub device_id: DbId,
    pub agent_id: DbId,
    pub enabled: bool,
    pub last_timestamp: EpochSecs,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Snapshot DTO
// ---------------------------------------------------------------------------

/// Complete, serializable view of one association as the registry reports it.
///
/// Always carries exactly six keys. When `exists` is false every other field
/// is `None` and serializes as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DeviceAgentSnapshot {
    pub last_timestamp: Option<EpochSecs>,
    pub association_id: Option<DbId>,
    pub agent_id: Option<DbId>,
    pub device_id: Option<DbId>,
    pub enabled: Option<bool>,
    pub exists: bool,
}

impl From<&DeviceAgent> for DeviceAgentSnapshot {
    fn from(row: &DeviceAgent) -> Self {
        Self {
            last_timestamp: Some(row.last_timestamp),
            association_id: Some(row.id),
            agent_id: Some(row.agent_id),
            device_id: Some(row.device_id),
            enabled: Some(row.enabled),
            exists: true,
        }
    }
}
