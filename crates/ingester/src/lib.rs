//! Ingestion admission for device-agent associations.
//!
//! [`coordinator::IngestionCoordinator`] decides which pairs to ingest,
//! [`admission::AdmissionController`] bounds and serializes the work, and
//! [`service::run`] drives both on a fixed interval.

pub mod admission;
pub mod config;
pub mod coordinator;
pub mod ingest;
pub mod logging;
pub mod service;
