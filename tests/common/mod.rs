// tests/common/mod.rs
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::watch;

use crypto_market_etl::config::EtlConfig;
use crypto_market_etl::error::{EtlError, ExtractionError, StorageError, TransformError};
use crypto_market_etl::ingest::checkpoint::Checkpoint;
use crypto_market_etl::ingest::normalize::{transform_records, FieldMap};
use crypto_market_etl::ingest::resilience::{BreakerPolicy, FixedJitter, RetryPolicy};
use crypto_market_etl::ingest::types::{
    BatchRequest, Coin, CoinPage, CoinQuery, EtlRun, RawBatch, RawPayload, RawRecord, RunFilter,
    SourceId, SourceKind, TransformedBatch, UpsertOutcome,
};
use crypto_market_etl::storage::{MemoryStorage, Storage};
use crypto_market_etl::{Orchestrator, SourceAdapter};

pub const FIELDS: FieldMap = FieldMap {
    id: &["/id"],
    symbol: &["/symbol"],
    name: &["/name"],
    price_usd: &["/price"],
    market_cap_usd: &["/market_cap"],
    volume_24h_usd: &["/volume"],
    price_change_24h_pct: &["/change"],
    market_rank: &["/rank"],
};

pub fn coin_json(id: &str, symbol: &str, price: f64) -> Value {
    json!({ "id": id, "symbol": symbol, "name": id, "price": price, "rank": 1 })
}

/// `n` distinct, valid records with ids `<prefix>-0..n`.
pub fn page_of(prefix: &str, n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            json!({
                "id": format!("{prefix}-{i}"),
                "symbol": format!("{prefix}{i}"),
                "name": format!("{prefix} {i}"),
                "price": 1.0 + i as f64,
                "rank": i + 1,
            })
        })
        .collect()
}

/// Behaves like a repeatable upstream: page `n` always returns the same
/// records unless a failure is queued for it.
pub struct ScriptedAdapter {
    source: SourceId,
    kind: SourceKind,
    pages: Mutex<Vec<Vec<Value>>>,
    failures: Mutex<HashMap<u32, VecDeque<ExtractionError>>>,
    always_fail: Mutex<Option<ExtractionError>>,
    delay: Option<Duration>,
    fetches: Mutex<Vec<u32>>,
}

impl ScriptedAdapter {
    pub fn new(source: SourceId, kind: SourceKind, pages: Vec<Vec<Value>>) -> Self {
        Self {
            source,
            kind,
            pages: Mutex::new(pages),
            failures: Mutex::new(HashMap::new()),
            always_fail: Mutex::new(None),
            delay: None,
            fetches: Mutex::new(Vec::new()),
        }
    }

    pub fn paginated(source: SourceId, pages: Vec<Vec<Value>>) -> Self {
        Self::new(source, SourceKind::PaginatedApi, pages)
    }

    pub fn single(source: SourceId, records: Vec<Value>) -> Self {
        Self::new(source, SourceKind::SimpleApi, vec![records])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next fetch of `page` once with `err`.
    pub fn fail_page(&self, page: u32, err: ExtractionError) {
        self.failures
            .lock()
            .unwrap()
            .entry(page)
            .or_default()
            .push_back(err);
    }

    pub fn set_always_fail(&self, err: Option<ExtractionError>) {
        *self.always_fail.lock().unwrap() = err;
    }

    pub fn set_pages(&self, pages: Vec<Vec<Value>>) {
        *self.pages.lock().unwrap() = pages;
    }

    /// Pages requested so far, in call order.
    pub fn fetch_log(&self) -> Vec<u32> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn source(&self) -> SourceId {
        self.source
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self, request: BatchRequest) -> Result<Option<RawBatch>, EtlError> {
        self.fetches.lock().unwrap().push(request.page);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if let Some(err) = self.always_fail.lock().unwrap().clone() {
            return Err(err.into());
        }
        let queued = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&request.page)
            .and_then(|q| q.pop_front());
        if let Some(err) = queued {
            return Err(err.into());
        }
        let records = {
            let pages = self.pages.lock().unwrap();
            match pages.get(request.page as usize - 1) {
                Some(records) => records.clone(),
                None => return Ok(None),
            }
        };
        Ok(Some(RawBatch {
            source: self.source,
            page: request.page,
            fetched_at: Utc::now(),
            payload: RawPayload::Json(Value::Array(records).to_string()),
        }))
    }

    fn next(&self, request: BatchRequest, _batch: &RawBatch) -> Option<BatchRequest> {
        (self.kind == SourceKind::PaginatedApi).then(|| request.next())
    }

    fn transform(&self, batch: &RawBatch) -> Result<TransformedBatch, TransformError> {
        let RawPayload::Json(body) = &batch.payload else {
            return Err(TransformError("expected json".into()));
        };
        let records: Vec<Value> =
            serde_json::from_str(body).map_err(|e| TransformError(e.to_string()))?;
        Ok(transform_records(self.source, records, &FIELDS, batch.fetched_at))
    }
}

/// Memory storage with switchable faults.
#[derive(Default)]
pub struct FaultyStorage {
    pub inner: MemoryStorage,
    pub fail_checkpoint_load: AtomicBool,
    pub fail_audit: AtomicBool,
    /// Canonical ids whose upsert always fails.
    pub poisoned: Mutex<HashSet<String>>,
}

impl FaultyStorage {
    pub fn poison(&self, canonical_id: &str) {
        self.poisoned.lock().unwrap().insert(canonical_id.to_string());
    }

    pub fn heal(&self) {
        self.poisoned.lock().unwrap().clear();
    }
}

fn injected() -> StorageError {
    StorageError::Corrupt("injected fault".into())
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn upsert_coin(&self, coin: &Coin) -> Result<UpsertOutcome, StorageError> {
        if self.poisoned.lock().unwrap().contains(&coin.canonical_id) {
            return Err(injected());
        }
        self.inner.upsert_coin(coin).await
    }

    async fn append_raw(&self, records: &[RawRecord]) -> Result<(), StorageError> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.append_raw(records).await
    }

    async fn load_checkpoint(&self, source: SourceId) -> Result<Checkpoint, StorageError> {
        if self.fail_checkpoint_load.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.load_checkpoint(source).await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.inner.save_checkpoint(checkpoint).await
    }

    async fn append_run(&self, run: &EtlRun) -> Result<(), StorageError> {
        self.inner.append_run(run).await
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<EtlRun>, StorageError> {
        self.inner.list_runs(filter).await
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, StorageError> {
        self.inner.list_checkpoints().await
    }

    async fn get_coin(&self, canonical_id: &str) -> Result<Option<Coin>, StorageError> {
        self.inner.get_coin(canonical_id).await
    }

    async fn query_coins(&self, query: &CoinQuery) -> Result<CoinPage, StorageError> {
        self.inner.query_coins(query).await
    }

    async fn count_raw(&self, source: Option<SourceId>) -> Result<u64, StorageError> {
        self.inner.count_raw(source).await
    }
}

/// Fast retries, no rate limiting, and the given breaker on every source.
pub fn test_config(failure_threshold: u32, cooldown_secs: u64) -> EtlConfig {
    let mut cfg = EtlConfig::default();
    for src in cfg.sources.values_mut() {
        src.rate_limit = None;
        src.retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_ratio: 0.0,
        };
        src.breaker = BreakerPolicy {
            failure_threshold,
            cooldown_secs,
        };
    }
    cfg
}

pub fn build(
    cfg: &EtlConfig,
    storage: Arc<dyn Storage>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
) -> (Arc<Orchestrator>, watch::Sender<bool>) {
    let (tx, rx) = watch::channel(false);
    let orch = Orchestrator::new(cfg, storage, adapters, Arc::new(FixedJitter(0.0)), rx);
    (Arc::new(orch), tx)
}
