// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod stats;
pub mod storage;

pub use config::EtlConfig;
pub use error::{EtlError, ExtractionError, StorageError, TransformError};
pub use ingest::{Orchestrator, RunSummary, SourceAdapter, SourceId};
pub use storage::{MemoryStorage, SqliteStorage, Storage};
