// src/stats.rs
//! Read-side aggregates over run history and checkpoints, for the external
//! `/stats` and `/health` style reporting surfaces.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ingest::checkpoint::{Checkpoint, CheckpointStatus};
use crate::ingest::types::{EtlRun, RunStatus, SourceId};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStats {
    pub total_runs: u64,
    pub records_loaded: u64,
    /// Mean wall time of `success` runs, in milliseconds.
    pub average_duration_ms: f64,
    /// Percentage of runs that ended in `success`.
    pub success_rate: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EtlStats {
    pub total_runs: u64,
    pub records_loaded: u64,
    pub average_duration_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub by_source: BTreeMap<SourceId, SourceStats>,
}

#[derive(Default)]
struct Acc {
    runs: u64,
    loaded: u64,
    successes: u64,
    success_ms: i64,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
}

impl Acc {
    fn add(&mut self, run: &EtlRun) {
        self.runs += 1;
        self.loaded += run.records_loaded;
        match run.status {
            RunStatus::Success => {
                self.successes += 1;
                self.success_ms += run.duration_ms();
                self.last_success = self.last_success.max(Some(run.ended_at));
            }
            RunStatus::Failure => {
                self.last_failure = self.last_failure.max(Some(run.ended_at));
            }
            RunStatus::PartialFailure | RunStatus::Skipped => {}
        }
    }

    fn average_ms(&self) -> f64 {
        if self.successes == 0 {
            0.0
        } else {
            round2(self.success_ms as f64 / self.successes as f64)
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

impl EtlStats {
    pub fn from_runs(runs: &[EtlRun]) -> Self {
        let mut total = Acc::default();
        let mut per_source: BTreeMap<SourceId, Acc> = SourceId::ALL
            .into_iter()
            .map(|id| (id, Acc::default()))
            .collect();
        for run in runs {
            total.add(run);
            per_source.entry(run.source).or_default().add(run);
        }

        let by_source = per_source
            .into_iter()
            .map(|(id, acc)| {
                let success_rate = if acc.runs == 0 {
                    0.0
                } else {
                    round2(acc.successes as f64 * 100.0 / acc.runs as f64)
                };
                let stats = SourceStats {
                    total_runs: acc.runs,
                    records_loaded: acc.loaded,
                    average_duration_ms: acc.average_ms(),
                    success_rate,
                    last_success: acc.last_success,
                    last_failure: acc.last_failure,
                };
                (id, stats)
            })
            .collect();

        Self {
            total_runs: total.runs,
            records_loaded: total.loaded,
            average_duration_ms: total.average_ms(),
            last_success: total.last_success,
            last_failure: total.last_failure,
            by_source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub sources: BTreeMap<SourceId, CheckpointStatus>,
    pub last_run: Option<DateTime<Utc>>,
}

impl HealthReport {
    /// Degraded as soon as any source's last run failed outright.
    pub fn from_checkpoints(sources: &[SourceId], checkpoints: &[Checkpoint]) -> Self {
        let mut by_source: BTreeMap<SourceId, CheckpointStatus> = sources
            .iter()
            .map(|id| (*id, CheckpointStatus::NeverRun))
            .collect();
        let mut last_run = None;
        for cp in checkpoints {
            by_source.insert(cp.source, cp.last_status);
            last_run = last_run.max(cp.last_success_at).max(cp.last_failure_at);
        }
        let degraded = by_source.values().any(|s| *s == CheckpointStatus::Failure);
        Self {
            status: if degraded {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            sources: by_source,
            last_run,
        }
    }
}
