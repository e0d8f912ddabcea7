pub mod device_agent;
pub mod error;
pub mod ingest;
pub mod types;
