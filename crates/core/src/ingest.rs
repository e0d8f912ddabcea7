//! Ingestion pool constants and validation.
//!
//! Pure functions and constants used by the ingester configuration layer.
//! Lives in `core` to keep the validation rules free of runtime dependencies.

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default number of ingestion tasks allowed to run at once.
pub const DEFAULT_INGEST_POOL_SIZE: usize = 20;

/// Upper bound on the ingestion pool. Each running task may hold a database
/// connection, so an unbounded pool just moves contention into the pool.
pub const MAX_INGEST_POOL_SIZE: usize = 1024;

/// Default seconds between scheduling cycles.
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Queued-plus-running submissions allowed per pool slot before the
/// producer is held back.
pub const QUEUE_SLOTS_PER_WORKER: usize = 4;

/// Default seconds a drain waits for in-flight tasks.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Consecutive store-unavailable cycles tolerated before the ingester exits.
pub const DEFAULT_STORE_FAILURE_LIMIT: u32 = 3;

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

/// Default admission queue capacity for a given pool size.
pub fn default_queue_capacity(pool_size: usize) -> usize {
    pool_size.saturating_mul(QUEUE_SLOTS_PER_WORKER)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate the ingestion pool size.
///
/// Rules:
/// - Must be at least 1.
/// - Must not exceed `MAX_INGEST_POOL_SIZE`.
pub fn validate_pool_size(size: usize) -> Result<(), CoreError> {
    if size == 0 {
        return Err(CoreError::Validation(
            "ingest_pool_size must be a positive integer".into(),
        ));
    }
    if size > MAX_INGEST_POOL_SIZE {
        return Err(CoreError::Validation(format!(
            "ingest_pool_size must not exceed {MAX_INGEST_POOL_SIZE}, got {size}"
        )));
    }
    Ok(())
}

/// Validate the admission queue capacity against the pool size.
///
/// The queue counts running tasks too, so it can never be smaller than
/// the pool.
pub fn validate_queue_capacity(capacity: usize, pool_size: usize) -> Result<(), CoreError> {
    if capacity < pool_size {
        return Err(CoreError::Validation(format!(
            "ingest queue capacity ({capacity}) must be at least ingest_pool_size ({pool_size})"
        )));
    }
    Ok(())
}

/// Validate the scheduling interval in seconds.
pub fn validate_interval(secs: u64) -> Result<(), CoreError> {
    if secs == 0 {
        return Err(CoreError::Validation(
            "interval must be at least 1 second".into(),
        ));
    }
    Ok(())
}

/// Validate the consecutive store failure limit.
pub fn validate_failure_limit(limit: u32) -> Result<(), CoreError> {
    if limit == 0 {
        return Err(CoreError::Validation(
            "store failure limit must be at least 1".into(),
        ));
    }
    Ok(())
}
