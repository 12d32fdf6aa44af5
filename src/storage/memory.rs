// src/storage/memory.rs
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::ingest::checkpoint::Checkpoint;
use crate::ingest::types::{
    Coin, CoinPage, CoinQuery, EtlRun, RawRecord, RunFilter, SourceId, UpsertOutcome,
};
use crate::storage::Storage;

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    coins: RwLock<HashMap<String, Coin>>,
    raw: Mutex<Vec<RawRecord>>,
    checkpoints: RwLock<HashMap<SourceId, Checkpoint>>,
    runs: Mutex<Vec<EtlRun>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn coin_count(&self) -> usize {
        self.coins.read().expect("coins lock poisoned").len()
    }
}

/// Rank ascending, unranked last, then id for a stable order.
pub(crate) fn rank_order(a: &Coin, b: &Coin) -> std::cmp::Ordering {
    match (a.market_rank, b.market_rank) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
    .then_with(|| a.canonical_id.cmp(&b.canonical_id))
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn upsert_coin(&self, coin: &Coin) -> Result<UpsertOutcome, StorageError> {
        let mut coins = self.coins.write().expect("coins lock poisoned");
        let outcome = match coins.get(&coin.canonical_id) {
            None => UpsertOutcome::Inserted,
            Some(existing) if existing.same_content(coin) => return Ok(UpsertOutcome::Unchanged),
            Some(_) => UpsertOutcome::Updated,
        };
        coins.insert(coin.canonical_id.clone(), coin.clone());
        Ok(outcome)
    }

    async fn append_raw(&self, records: &[RawRecord]) -> Result<(), StorageError> {
        self.raw
            .lock()
            .expect("raw lock poisoned")
            .extend_from_slice(records);
        Ok(())
    }

    async fn load_checkpoint(&self, source: SourceId) -> Result<Checkpoint, StorageError> {
        Ok(self
            .checkpoints
            .read()
            .expect("checkpoint lock poisoned")
            .get(&source)
            .cloned()
            .unwrap_or_else(|| Checkpoint::never_run(source)))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.checkpoints
            .write()
            .expect("checkpoint lock poisoned")
            .insert(checkpoint.source, checkpoint.clone());
        Ok(())
    }

    async fn append_run(&self, run: &EtlRun) -> Result<(), StorageError> {
        self.runs.lock().expect("runs lock poisoned").push(run.clone());
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<EtlRun>, StorageError> {
        let runs = self.runs.lock().expect("runs lock poisoned");
        let mut out: Vec<EtlRun> = runs
            .iter()
            .rev()
            .filter(|r| filter.source.is_none_or(|s| s == r.source))
            .cloned()
            .collect();
        // appended in completion order; newest start first
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError> {
        let mut out: Vec<Checkpoint> = self
            .checkpoints
            .read()
            .expect("checkpoint lock poisoned")
            .values()
            .cloned()
            .collect();
        out.sort_by_key(|c| c.source);
        Ok(out)
    }

    async fn get_coin(&self, canonical_id: &str) -> Result<Option<Coin>, StorageError> {
        Ok(self
            .coins
            .read()
            .expect("coins lock poisoned")
            .get(canonical_id)
            .cloned())
    }

    async fn query_coins(&self, query: &CoinQuery) -> Result<CoinPage, StorageError> {
        let q = query.normalized();
        let coins = self.coins.read().expect("coins lock poisoned");
        let mut matched: Vec<&Coin> = coins
            .values()
            .filter(|c| q.source.as_deref().is_none_or(|s| c.source.as_str() == s))
            .filter(|c| q.symbol.as_deref().is_none_or(|s| c.symbol == s))
            .collect();
        matched.sort_by(|a, b| rank_order(a, b));
        let total = matched.len() as u64;
        let items = matched
            .into_iter()
            .skip(q.offset() as usize)
            .take(q.page_size as usize)
            .cloned()
            .collect();
        Ok(CoinPage { items, total })
    }

    async fn count_raw(&self, source: Option<SourceId>) -> Result<u64, StorageError> {
        let raw = self.raw.lock().expect("raw lock poisoned");
        Ok(raw
            .iter()
            .filter(|r| source.is_none_or(|s| s == r.source))
            .count() as u64)
    }
}
