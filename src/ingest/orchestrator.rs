// src/ingest/orchestrator.rs
//! Drives one run per source: extract → transform → load, then commits the
//! checkpoint and appends exactly one terminal [`EtlRun`].
//!
//! Runs for different sources are independent and may overlap. Runs for the
//! same source never overlap: a second `run_one` while one is in flight
//! returns [`EtlError::AlreadyRunning`] instead of queueing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::{EtlConfig, SourceConfig};
use crate::error::EtlError;
use crate::ingest::checkpoint::Checkpoint;
use crate::ingest::loader::{LoadProgress, Loader};
use crate::ingest::providers::{Extraction, SourceAdapter};
use crate::ingest::rate_limiter::TokenBucket;
use crate::ingest::resilience::{
    Admission, BreakerState, CircuitBreaker, Jitter, Retrier, RetryPolicy,
};
use crate::ingest::types::{EtlRun, LoadCounts, RunFilter, RunPhase, RunStatus, SourceId, SourceKind};
use crate::stats::{EtlStats, HealthReport};
use crate::storage::Storage;

pub const INTERRUPTED: &str = "interrupted by shutdown";
const MAX_SUMMARY_ERRORS: usize = 5;

/// Everything the orchestrator owns for one source.
struct SourceSlot {
    adapter: Arc<dyn SourceAdapter>,
    bucket: Option<TokenBucket>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    running: tokio::sync::Mutex<()>,
    phase: Mutex<Option<RunPhase>>,
}

impl SourceSlot {
    fn set_phase(&self, phase: RunPhase) {
        *self.phase.lock().expect("phase mutex poisoned") = Some(phase);
    }
}

/// Clears the observable phase when a run ends, however it ends.
struct PhaseGuard<'a>(&'a SourceSlot);

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut p) = self.0.phase.lock() {
            *p = None;
        }
    }
}

/// Per-run accumulator.
#[derive(Default)]
struct Tally {
    extracted: u64,
    counts: LoadCounts,
    batches_loaded: u32,
    batches_failed: u32,
    errors: Vec<String>,
    cursor: Option<String>,
    interrupted: bool,
}

impl Tally {
    fn fail(&mut self, page: Option<u32>, err: &EtlError) {
        self.batches_failed += 1;
        self.errors.push(match page {
            Some(p) => format!("page {p}: {err}"),
            None => err.to_string(),
        });
    }

    fn status(&self) -> RunStatus {
        let loaded = self.batches_loaded > 0;
        if self.interrupted {
            return if loaded {
                RunStatus::PartialFailure
            } else {
                RunStatus::Failure
            };
        }
        match (loaded, self.errors.is_empty()) {
            (_, true) => RunStatus::Success,
            (true, false) => RunStatus::PartialFailure,
            (false, false) => RunStatus::Failure,
        }
    }

    fn summary(&self) -> Option<String> {
        let mut parts: Vec<String> = self.errors.iter().take(MAX_SUMMARY_ERRORS).cloned().collect();
        let more = self.errors.len().saturating_sub(MAX_SUMMARY_ERRORS);
        if more > 0 {
            parts.push(format!("and {more} more"));
        }
        if self.interrupted {
            parts.push(INTERRUPTED.to_string());
        }
        (!parts.is_empty()).then(|| parts.join("; "))
    }
}

/// Process-wide outcome of one `run_all`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub runs: Vec<EtlRun>,
    /// Sources that could not produce a run record at all.
    pub errors: BTreeMap<SourceId, String>,
}

impl RunSummary {
    pub fn count(&self, status: RunStatus) -> usize {
        self.runs.iter().filter(|r| r.status == status).count()
    }

    pub fn records_loaded(&self) -> u64 {
        self.runs.iter().map(|r| r.records_loaded).sum()
    }

    /// True when nothing succeeded, even partially.
    pub fn all_failed(&self) -> bool {
        !self.runs.iter().any(|r| r.status.advances_checkpoint())
            && (self.count(RunStatus::Failure) > 0 || !self.errors.is_empty())
    }
}

pub struct Orchestrator {
    storage: Arc<dyn Storage>,
    loader: Loader,
    slots: BTreeMap<SourceId, SourceSlot>,
    jitter: Arc<dyn Jitter>,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    /// One slot per adapter; policies come from the matching source config
    /// (built-in defaults when the config has no entry).
    pub fn new(
        config: &EtlConfig,
        storage: Arc<dyn Storage>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        jitter: Arc<dyn Jitter>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        crate::metrics::ensure_described();
        let slots = adapters
            .into_iter()
            .map(|adapter| {
                let id = adapter.source();
                let src = config
                    .source(id)
                    .cloned()
                    .unwrap_or_else(|| SourceConfig::defaults_for(id));
                let bucket = src
                    .rate_limit
                    .clone()
                    .filter(|_| adapter.kind().is_remote())
                    .map(|policy| TokenBucket::new(id, policy));
                let slot = SourceSlot {
                    breaker: CircuitBreaker::new(id, src.breaker.clone()),
                    retry: src.retry.clone(),
                    bucket,
                    adapter,
                    running: tokio::sync::Mutex::new(()),
                    phase: Mutex::new(None),
                };
                (id, slot)
            })
            .collect();
        Self {
            loader: Loader::new(Arc::clone(&storage)),
            storage,
            slots,
            jitter,
            shutdown,
        }
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.slots.keys().copied().collect()
    }

    /// In-flight phase of a source, `None` while idle.
    pub fn phase(&self, source: SourceId) -> Option<RunPhase> {
        self.slots
            .get(&source)
            .and_then(|s| *s.phase.lock().expect("phase mutex poisoned"))
    }

    pub fn breaker_state(&self, source: SourceId) -> Option<BreakerState> {
        self.slots.get(&source).map(|s| s.breaker.state())
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run every configured source concurrently and collect the outcomes.
    pub async fn run_all(self: &Arc<Self>) -> RunSummary {
        let mut set = JoinSet::new();
        for id in self.sources() {
            let this = Arc::clone(self);
            set.spawn(async move { (id, this.run_one(id).await) });
        }

        let mut summary = RunSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(run))) => summary.runs.push(run),
                Ok((id, Err(e))) => {
                    warn!(source = %id, error = %e, "source produced no run");
                    summary.errors.insert(id, e.to_string());
                }
                Err(e) => error!(error = %e, "etl task panicked"),
            }
        }
        summary.runs.sort_by_key(|r| r.source);
        info!(
            runs = summary.runs.len(),
            success = summary.count(RunStatus::Success),
            partial = summary.count(RunStatus::PartialFailure),
            failure = summary.count(RunStatus::Failure),
            skipped = summary.count(RunStatus::Skipped),
            loaded = summary.records_loaded(),
            "etl cycle finished"
        );
        summary
    }

    /// Run a single source once and return its terminal run record.
    pub async fn run_one(&self, source: SourceId) -> Result<EtlRun, EtlError> {
        let slot = self
            .slots
            .get(&source)
            .ok_or_else(|| EtlError::UnknownSource(source.to_string()))?;
        let Ok(_running) = slot.running.try_lock() else {
            debug!(source = %source, "run already in progress, skipping");
            return Err(EtlError::AlreadyRunning(source));
        };

        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("etl_run", source = %source, run_id = %run_id);
        self.run_admitted(slot, source, run_id).instrument(span).await
    }

    async fn run_admitted(
        &self,
        slot: &SourceSlot,
        source: SourceId,
        run_id: String,
    ) -> Result<EtlRun, EtlError> {
        let started_at = Utc::now();

        let trial = match slot.breaker.admit() {
            Admission::Allowed => false,
            Admission::Trial => true,
            Admission::Rejected { retry_in } => {
                let reason = EtlError::CircuitOpen {
                    source_id: source,
                    retry_in,
                };
                info!(retry_in_secs = retry_in.as_secs(), "circuit open, skipping run");
                let run = EtlRun {
                    run_id,
                    source,
                    started_at,
                    ended_at: Utc::now(),
                    status: RunStatus::Skipped,
                    records_extracted: 0,
                    records_loaded: 0,
                    records_unchanged: 0,
                    records_rejected: 0,
                    batches_loaded: 0,
                    batches_failed: 0,
                    error_summary: Some(reason.to_string()),
                };
                self.storage.append_run(&run).await?;
                record_metrics(&run);
                return Ok(run);
            }
        };

        let _phase = PhaseGuard(slot);
        slot.set_phase(RunPhase::Pending);

        let checkpoint = match self.storage.load_checkpoint(source).await {
            Ok(cp) => Some(cp),
            Err(e) => {
                error!(error = %e, "loading checkpoint failed");
                None
            }
        };

        let mut tally = Tally::default();
        match &checkpoint {
            Some(cp) => self.pipeline(slot, cp, &mut tally).await,
            None => tally.errors.push("checkpoint unavailable".to_string()),
        }

        let status = tally.status();
        let run = EtlRun {
            run_id,
            source,
            started_at,
            ended_at: Utc::now(),
            status,
            records_extracted: tally.extracted,
            records_loaded: tally.counts.loaded(),
            records_unchanged: tally.counts.unchanged,
            records_rejected: tally.counts.rejected,
            batches_loaded: tally.batches_loaded,
            batches_failed: tally.batches_failed,
            error_summary: tally.summary(),
        };

        if tally.interrupted {
            if trial {
                slot.breaker.release_trial();
            }
        } else if status.advances_checkpoint() {
            slot.breaker.record_success();
        } else if status == RunStatus::Failure {
            slot.breaker.record_failure();
        }

        let cursor = tally
            .cursor
            .filter(|_| slot.adapter.kind() == SourceKind::PaginatedApi);
        let committed = match checkpoint.and_then(|cp| cp.commit(&run, cursor)) {
            Some(next) => self.storage.save_checkpoint(&next).await,
            None => Ok(()),
        };
        if let Err(e) = &committed {
            error!(error = %e, "saving checkpoint failed");
        }
        self.storage.append_run(&run).await?;
        committed?;

        record_metrics(&run);
        info!(
            status = %run.status,
            extracted = run.records_extracted,
            loaded = run.records_loaded,
            unchanged = run.records_unchanged,
            rejected = run.records_rejected,
            batches_failed = run.batches_failed,
            duration_ms = run.duration_ms(),
            "etl run finished"
        );
        Ok(run)
    }

    /// Sequential batch loop for one run. Never returns an error: every
    /// failure lands in the tally.
    async fn pipeline(&self, slot: &SourceSlot, checkpoint: &Checkpoint, tally: &mut Tally) {
        let source = slot.adapter.source();
        let jitter: &dyn Jitter = self.jitter.as_ref();
        let mut extraction = Extraction::new(slot.adapter.as_ref(), slot.bucket.as_ref(), checkpoint);

        loop {
            if extraction.pending().is_none() {
                break;
            }
            if self.shutting_down() {
                tally.interrupted = true;
                break;
            }
            let page = extraction.pending().map(|r| r.page);

            slot.set_phase(RunPhase::Extracting);
            let mut retrier = Retrier::new(&slot.retry, jitter, source, "extract");
            let fetched = loop {
                match extraction.next_batch().await {
                    Some(Err(e)) if retrier.should_retry(&e).await => continue,
                    other => break other,
                }
            };
            let batch = match fetched {
                None => break,
                Some(Ok(batch)) => batch,
                Some(Err(e)) => {
                    warn!(page = ?page, error = %e, "extraction failed");
                    tally.fail(page, &e);
                    extraction.stop();
                    break;
                }
            };

            slot.set_phase(RunPhase::Transforming);
            let transformed = match slot.adapter.transform(&batch) {
                Ok(t) => t,
                Err(e) => {
                    warn!(page = batch.page, error = %e, "batch could not be parsed");
                    tally.fail(Some(batch.page), &EtlError::from(e));
                    continue;
                }
            };
            tally.extracted += transformed.extracted() as u64;
            tally.counts.rejected += transformed.rejections.len() as u64;
            if !transformed.rejections.is_empty() {
                debug!(
                    page = batch.page,
                    rejected = transformed.rejections.len(),
                    first = %transformed.rejections[0],
                    "records rejected"
                );
            }
            self.loader.record_raw(source, &transformed.raw).await;

            slot.set_phase(RunPhase::Loading);
            let mut progress = LoadProgress::default();
            let mut retrier = Retrier::new(&slot.retry, jitter, source, "load");
            let loaded = loop {
                match self.loader.load(&transformed.candidates, &mut progress).await {
                    Err(e) if retrier.should_retry(&e).await => continue,
                    other => break other,
                }
            };
            tally.counts.inserted += progress.counts.inserted;
            tally.counts.updated += progress.counts.updated;
            tally.counts.unchanged += progress.counts.unchanged;
            match loaded {
                Ok(()) => {
                    tally.batches_loaded += 1;
                    tally.cursor = Some(batch.cursor());
                }
                Err(e) => {
                    warn!(page = batch.page, error = %e, "batch load failed");
                    tally.fail(Some(batch.page), &e);
                }
            }
        }
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<EtlRun>, EtlError> {
        Ok(self.storage.list_runs(filter).await?)
    }

    pub async fn checkpoints(&self) -> Result<Vec<Checkpoint>, EtlError> {
        Ok(self.storage.list_checkpoints().await?)
    }

    pub async fn stats(&self) -> Result<EtlStats, EtlError> {
        let runs = self.storage.list_runs(&RunFilter::default()).await?;
        Ok(EtlStats::from_runs(&runs))
    }

    pub async fn health(&self) -> Result<HealthReport, EtlError> {
        let checkpoints = self.storage.list_checkpoints().await?;
        Ok(HealthReport::from_checkpoints(&self.sources(), &checkpoints))
    }
}

fn record_metrics(run: &EtlRun) {
    let source = run.source.as_str();
    counter!("etl_runs_total", "source" => source, "status" => run.status.as_str()).increment(1);
    counter!("etl_records_loaded_total", "source" => source).increment(run.records_loaded);
    counter!("etl_records_unchanged_total", "source" => source).increment(run.records_unchanged);
    counter!("etl_records_rejected_total", "source" => source).increment(run.records_rejected);
    gauge!("etl_last_run_ts", "source" => source).set(run.ended_at.timestamp() as f64);
    histogram!("etl_run_duration_ms", "source" => source).record(run.duration_ms() as f64);
}
