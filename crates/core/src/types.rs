/// All database primary keys and foreign ids are PostgreSQL BIGINT.
pub type DbId = i64;

/// Ingestion watermarks are integer epoch seconds.
pub type EpochSecs = i64;

/// Bookkeeping timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
