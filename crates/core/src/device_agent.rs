//! Device-agent pairing primitives shared by the registry and the ingester.
//!
//! Pure functions only: identity validation, the composite pairing key, and
//! the watermark merge rule applied on every upsert.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{DbId, EpochSecs};

// ---------------------------------------------------------------------------
// Identity validation
// ---------------------------------------------------------------------------

/// Return the id if it can possibly name a row.
///
/// BIGSERIAL ids start at 1, so absent, zero and negative ids are
/// definitionally absent and never reach the database.
pub fn valid_id(id: Option<DbId>) -> Option<DbId> {
    id.filter(|id| *id > 0)
}

/// Validate both halves of a device-agent pair at once.
pub fn valid_pair(device_id: Option<DbId>, agent_id: Option<DbId>) -> Option<PairKey> {
    Some(PairKey::new(valid_id(device_id)?, valid_id(agent_id)?))
}

// ---------------------------------------------------------------------------
// Pair key
// ---------------------------------------------------------------------------

/// Natural key of an association: one device reported on by one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub device_id: DbId,
    pub agent_id: DbId,
}

impl PairKey {
    pub fn new(device_id: DbId, agent_id: DbId) -> Self {
        Self {
            device_id,
            agent_id,
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {} / agent {}", self.device_id, self.agent_id)
    }
}

// ---------------------------------------------------------------------------
// Watermark
// ---------------------------------------------------------------------------

/// Merge an incoming ingestion timestamp into an existing watermark.
///
/// The watermark never moves backward.
pub fn merge_watermark(existing: EpochSecs, incoming: EpochSecs) -> EpochSecs {
    existing.max(incoming)
}

/// Sort and deduplicate an id listing in place.
///
/// Every bulk listing the registry hands out is strictly ascending.
pub fn normalize_ids(ids: &mut Vec<DbId>) {
    ids.sort_unstable();
    ids.dedup();
}
