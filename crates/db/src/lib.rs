//! Persistence for device-agent associations.
//!
//! [`repositories::DeviceAgentRepo`] holds the SQL. [`store::AssociationStore`]
//! is the narrow contract the rest of the system depends on, and
//! [`registry::Registry`] layers the fail-soft lookup API on top of it.

use sqlx::postgres::PgPoolOptions;

pub mod models;
pub mod registry;
pub mod repositories;
pub mod store;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to confirm the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply all pending migrations from `db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}
