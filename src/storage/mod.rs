// src/storage/mod.rs
//! Persistence seam shared by the loader, the orchestrator and the read side.
//!
//! Coins are written only through [`Storage::upsert_coin`], which must be an
//! atomic conditional write per canonical id. Checkpoints and runs are
//! written only by the task that owns the source.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::ingest::checkpoint::Checkpoint;
use crate::ingest::types::{
    Coin, CoinPage, CoinQuery, EtlRun, RawRecord, RunFilter, SourceId, UpsertOutcome,
};

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Full-row replace keyed by canonical id. A write whose content equals
    /// the stored row is reported as `Unchanged` and leaves the row alone.
    async fn upsert_coin(&self, coin: &Coin) -> Result<UpsertOutcome, StorageError>;

    /// Append-only audit trail.
    async fn append_raw(&self, records: &[RawRecord]) -> Result<(), StorageError>;

    /// The stored checkpoint, or a `never_run` one.
    async fn load_checkpoint(&self, source: SourceId) -> Result<Checkpoint, StorageError>;

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;

    async fn append_run(&self, run: &EtlRun) -> Result<(), StorageError>;

    /// Newest first.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<EtlRun>, StorageError>;

    /// Only sources that have been committed at least once.
    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError>;

    async fn get_coin(&self, canonical_id: &str) -> Result<Option<Coin>, StorageError>;

    /// Paginated read ordered by rank ascending, unranked last.
    async fn query_coins(&self, query: &CoinQuery) -> Result<CoinPage, StorageError>;

    async fn count_raw(&self, source: Option<SourceId>) -> Result<u64, StorageError>;
}
