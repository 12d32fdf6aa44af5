// src/ingest/mod.rs
//! Incremental multi-source ingestion: per-source rate limiting, retries and
//! circuit breaking around a uniform extract/transform contract, idempotent
//! loading, and resumable checkpoints.

pub mod checkpoint;
pub mod loader;
pub mod normalize;
pub mod orchestrator;
pub mod providers;
pub mod rate_limiter;
pub mod resilience;
pub mod scheduler;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointStatus};
pub use orchestrator::{Orchestrator, RunSummary};
pub use providers::{build_adapters, SourceAdapter};
pub use types::{Coin, EtlRun, RunPhase, RunStatus, SourceId, SourceKind};
