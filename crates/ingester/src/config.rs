use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use infoset_core::error::CoreError;
use infoset_core::ingest::{
    default_queue_capacity, validate_failure_limit, validate_interval, validate_pool_size,
    validate_queue_capacity, DEFAULT_DRAIN_TIMEOUT_SECS, DEFAULT_INGEST_POOL_SIZE,
    DEFAULT_INTERVAL_SECS, DEFAULT_STORE_FAILURE_LIMIT,
};

use crate::admission::AdmissionConfig;
use crate::logging::LogFormat;

/// Default database pool size for the ingester process.
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Ingester configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    /// Worker ceiling for the admission controller.
    pub ingest_pool_size: usize,
    /// Queued-plus-running ceiling before the dispatch loop is held back.
    pub ingest_queue_capacity: usize,
    /// Seconds between scheduling cycles.
    pub interval_secs: u64,
    /// Staging area agents drop batch files into.
    pub ingest_cache_directory: PathBuf,
    pub drain_timeout_secs: u64,
    /// Consecutive store-unavailable cycles tolerated before exiting.
    pub store_failure_limit: u32,
    pub log_format: LogFormat,
}

impl IngesterConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                  |
    /// |--------------------------|--------------------------|
    /// | `DATABASE_URL`           | required                 |
    /// | `DB_MAX_CONNECTIONS`     | `10`                     |
    /// | `INGEST_POOL_SIZE`       | `20`                     |
    /// | `INGEST_QUEUE_CAPACITY`  | `4 * INGEST_POOL_SIZE`   |
    /// | `INTERVAL`               | `300`                    |
    /// | `INGEST_CACHE_DIRECTORY` | required                 |
    /// | `DRAIN_TIMEOUT_SECS`     | `30`                     |
    /// | `STORE_FAILURE_LIMIT`    | `3`                      |
    /// | `LOG_FORMAT`             | `text`                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(var))
        };

        let database_url = required("DATABASE_URL")?;
        let ingest_cache_directory = PathBuf::from(required("INGEST_CACHE_DIRECTORY")?);

        let db_max_connections = parse_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?;
        let ingest_pool_size = parse_or(&lookup, "INGEST_POOL_SIZE", DEFAULT_INGEST_POOL_SIZE)?;
        let ingest_queue_capacity = parse_or(
            &lookup,
            "INGEST_QUEUE_CAPACITY",
            default_queue_capacity(ingest_pool_size),
        )?;
        let interval_secs = parse_or(&lookup, "INTERVAL", DEFAULT_INTERVAL_SECS)?;
        let drain_timeout_secs = parse_or(&lookup, "DRAIN_TIMEOUT_SECS", DEFAULT_DRAIN_TIMEOUT_SECS)?;
        let store_failure_limit =
            parse_or(&lookup, "STORE_FAILURE_LIMIT", DEFAULT_STORE_FAILURE_LIMIT)?;
        let log_format = parse_or(&lookup, "LOG_FORMAT", LogFormat::Text)?;

        validate_pool_size(ingest_pool_size)?;
        validate_queue_capacity(ingest_queue_capacity, ingest_pool_size)?;
        validate_interval(interval_secs)?;
        validate_failure_limit(store_failure_limit)?;

        Ok(Self {
            database_url,
            db_max_connections,
            ingest_pool_size,
            ingest_queue_capacity,
            interval_secs,
            ingest_cache_directory,
            drain_timeout_secs,
            store_failure_limit,
            log_format,
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn admission(&self) -> AdmissionConfig {
        AdmissionConfig {
            pool_size: self.ingest_pool_size,
            queue_capacity: self.ingest_queue_capacity,
        }
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
