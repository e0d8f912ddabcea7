//! Units of ingestion work.
//!
//! An [`Ingestor`] fetches or processes whatever a device-agent pair has
//! pending and reports the newest measurement timestamp it consumed. The
//! coordinator turns that timestamp into the association's watermark.
//!
//! Ingestion is two-phase: `ingest` reads, `ack` releases what was read once
//! the watermark is committed. Anything not acked is seen again next cycle.
//!
//! [`CacheDirIngestor`] consumes batches that agents stage in the ingest
//! cache directory as `<timestamp>_<device_id>_<agent_id>.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};

use async_trait::async_trait;
use infoset_core::device_agent::{valid_pair, PairKey};
use infoset_core::types::EpochSecs;
use regex::Regex;

/// Staged batch file name: `<timestamp>_<device_id>_<agent_id>.json`.
static BATCH_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)_(\d+)_(\d+)\.json$").expect("valid regex"));

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed payload in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Ingest failed: {0}")]
    Other(String),
}

/// A unit of ingestion work for one device-agent pair.
#[async_trait]
pub trait Ingestor: Send + Sync {
    /// Consume pending measurements for `pair`.
    ///
    /// Returns the newest timestamp consumed, or `None` if nothing was
    /// pending.
    async fn ingest(&self, pair: PairKey) -> Result<Option<EpochSecs>, IngestError>;

    /// Release what the last `ingest` for `pair` read, up to `upto`.
    ///
    /// Called only after the watermark for `upto` has been committed.
    async fn ack(&self, _pair: PairKey, _upto: EpochSecs) -> Result<(), IngestError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cache directory ingestor
// ---------------------------------------------------------------------------

/// One staged batch file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedBatch {
    pub path: PathBuf,
    pub timestamp: EpochSecs,
    pub pair: PairKey,
}

/// Parse a staged batch file name into its timestamp and pair.
///
/// Returns `None` for names that do not follow the staging convention or
/// that carry ids which cannot name an association.
pub fn parse_batch_file_name(name: &str) -> Option<(EpochSecs, PairKey)> {
    let caps = BATCH_FILE_RE.captures(name)?;
    let timestamp: EpochSecs = caps[1].parse().ok()?;
    let device_id = caps[2].parse().ok();
    let agent_id = caps[3].parse().ok();
    Some((timestamp, valid_pair(device_id, agent_id)?))
}

/// Consumes batches staged in the ingest cache directory.
///
/// Files are read by `ingest` and removed by `ack`, so a batch whose
/// watermark never committed stays staged.
#[derive(Debug)]
pub struct CacheDirIngestor {
    dir: PathBuf,
    /// Batches read by the last `ingest` per pair, awaiting `ack`.
    read: Mutex<HashMap<PairKey, Vec<StagedBatch>>>,
}

impl CacheDirIngestor {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            read: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every staged batch, ordered by (pair, timestamp).
    pub async fn staged_batches(&self) -> Result<Vec<StagedBatch>, IngestError> {
        let io_err = |source: std::io::Error| IngestError::Io {
            path: self.dir.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_err)?;
        let mut batches = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match parse_batch_file_name(name) {
                Some((timestamp, pair)) => batches.push(StagedBatch {
                    path: entry.path(),
                    timestamp,
                    pair,
                }),
                None => tracing::trace!(file = name, "Ignoring non-batch file in ingest cache"),
            }
        }

        batches.sort_by(|a, b| (a.pair, a.timestamp, &a.path).cmp(&(b.pair, b.timestamp, &b.path)));
        Ok(batches)
    }

    /// Distinct pairs with at least one staged batch, ascending.
    pub async fn pending_pairs(&self) -> Result<Vec<PairKey>, IngestError> {
        let mut pairs: Vec<PairKey> = self
            .staged_batches()
            .await?
            .into_iter()
            .map(|b| b.pair)
            .collect();
        pairs.dedup();
        Ok(pairs)
    }
}

#[async_trait]
impl Ingestor for CacheDirIngestor {
    /// Validate every staged batch for the pair without removing any.
    ///
    /// A malformed batch fails the whole unit.
    async fn ingest(&self, pair: PairKey) -> Result<Option<EpochSecs>, IngestError> {
        let batches: Vec<StagedBatch> = self
            .staged_batches()
            .await?
            .into_iter()
            .filter(|b| b.pair == pair)
            .collect();

        for batch in &batches {
            let bytes = tokio::fs::read(&batch.path)
                .await
                .map_err(|source| IngestError::Io {
                    path: batch.path.clone(),
                    source,
                })?;
            serde_json::from_slice::<serde_json::Value>(&bytes).map_err(|source| {
                IngestError::Malformed {
                    path: batch.path.clone(),
                    source,
                }
            })?;
        }

        let newest = batches.iter().map(|b| b.timestamp).max();
        if let Some(timestamp) = newest {
            tracing::debug!(
                device_id = pair.device_id,
                agent_id = pair.agent_id,
                batches = batches.len(),
                timestamp,
                "Read staged batches",
            );
        }

        let mut read = self.read.lock().unwrap_or_else(PoisonError::into_inner);
        if batches.is_empty() {
            read.remove(&pair);
        } else {
            read.insert(pair, batches);
        }
        Ok(newest)
    }

    /// Remove the batches read for `pair` that the committed watermark covers.
    async fn ack(&self, pair: PairKey, upto: EpochSecs) -> Result<(), IngestError> {
        let batches = self
            .read
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pair)
            .unwrap_or_default();

        let mut removed = 0usize;
        for batch in batches.iter().filter(|b| b.timestamp <= upto) {
            match tokio::fs::remove_file(&batch.path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(IngestError::Io {
                        path: batch.path.clone(),
                        source,
                    })
                }
            }
        }

        tracing::debug!(
            device_id = pair.device_id,
            agent_id = pair.agent_id,
            removed,
            upto,
            "Released staged batches",
        );
        Ok(())
    }
}
