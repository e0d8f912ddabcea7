//! Repository for the `device_agents` table.

use infoset_core::types::{DbId, EpochSecs};
use sqlx::PgPool;

use crate::models::device_agent::DeviceAgent;

/// Column list for `device_agents` queries.
const COLUMNS: &str = "id, device_id, agent_id, enabled, last_timestamp, created_at, updated_at";

/// Provides lookups, listings and the ingest upsert for associations.
pub struct DeviceAgentRepo;

impl DeviceAgentRepo {
    // ── Single-row lookups ───────────────────────────────────────────────

    /// Find an association by its natural (device, agent) key.
    pub async fn find_by_pair(
        pool: &PgPool,
        device_id: DbId,
        agent_id: DbId,
    ) -> Result<Option<DeviceAgent>, sqlx::Error> {
        let query =
            format!("SELECT {COLUMNS} FROM device_agents WHERE device_id = $1 AND agent_id = $2");
        sqlx::query_as::<_, DeviceAgent>(&query)
            .bind(device_id)
            .bind(agent_id)
            .fetch_optional(pool)
            .await
    }

    /// Find an association by its surrogate id.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<DeviceAgent>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM device_agents WHERE id = $1");
        sqlx::query_as::<_, DeviceAgent>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Existence probe that does not fetch the row.
    pub async fn exists(pool: &PgPool, device_id: DbId, agent_id: DbId) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM device_agents WHERE device_id = $1 AND agent_id = $2)",
        )
        .bind(device_id)
        .bind(agent_id)
        .fetch_one(pool)
        .await
    }

    // ── Mutations ────────────────────────────────────────────────────────

    /// Record an ingestion for a pair, creating the association on first sight.
    ///
    /// New rows start enabled. Existing rows keep their `enabled` flag and
    /// only move `last_timestamp` forward. Returns the association id.
    pub async fn upsert(
        pool: &PgPool,
        device_id: DbId,
        agent_id: DbId,
        timestamp: EpochSecs,
    ) -> Result<DbId, sqlx::Error> {
        sqlx::query_scalar::<_, DbId>(
            "INSERT INTO device_agents (device_id, agent_id, last_timestamp)
             VALUES ($1, $2, $3)
             ON CONFLICT (device_id, agent_id) DO UPDATE SET
                last_timestamp = GREATEST(device_agents.last_timestamp, EXCLUDED.last_timestamp)
             RETURNING id",
        )
        .bind(device_id)
        .bind(agent_id)
        .bind(timestamp)
        .fetch_one(pool)
        .await
    }

    /// Enable or disable an association. Returns `true` if a row was updated.
    pub async fn set_enabled(pool: &PgPool, id: DbId, enabled: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE device_agents SET enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Listings ─────────────────────────────────────────────────────────

    /// Distinct device ids with at least one association, ascending.
    pub async fn list_device_ids(pool: &PgPool) -> Result<Vec<DbId>, sqlx::Error> {
        sqlx::query_scalar::<_, DbId>(
            "SELECT DISTINCT device_id FROM device_agents ORDER BY device_id ASC",
        )
        .fetch_all(pool)
        .await
    }

    /// Distinct device ids reported on by one agent, ascending.
    pub async fn list_device_ids_for_agent(
        pool: &PgPool,
        agent_id: DbId,
    ) -> Result<Vec<DbId>, sqlx::Error> {
        sqlx::query_scalar::<_, DbId>(
            "SELECT DISTINCT device_id FROM device_agents \
             WHERE agent_id = $1 ORDER BY device_id ASC",
        )
        .bind(agent_id)
        .fetch_all(pool)
        .await
    }

    /// Distinct agent ids reporting on one device, ascending.
    pub async fn list_agent_ids_for_device(
        pool: &PgPool,
        device_id: DbId,
    ) -> Result<Vec<DbId>, sqlx::Error> {
        sqlx::query_scalar::<_, DbId>(
            "SELECT DISTINCT agent_id FROM device_agents \
             WHERE device_id = $1 ORDER BY agent_id ASC",
        )
        .bind(device_id)
        .fetch_all(pool)
        .await
    }

    /// Every association ordered by id.
    pub async fn list_all(pool: &PgPool) -> Result<Vec<DeviceAgent>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM device_agents ORDER BY id ASC");
        sqlx::query_as::<_, DeviceAgent>(&query)
            .fetch_all(pool)
            .await
    }
}
