//! Per-source progress marker.
//!
//! A checkpoint is only touched by the orchestrator, once per finished run.
//! The success timestamp and the cursor move forward only on runs that
//! loaded at least one batch; failures update the status fields alone and
//! skipped runs leave the checkpoint as it was.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ingest::types::{BatchRequest, EtlRun, RunStatus, SourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    NeverRun,
    Success,
    PartialFailure,
    Failure,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::NeverRun => "never_run",
            CheckpointStatus::Success => "success",
            CheckpointStatus::PartialFailure => "partial_failure",
            CheckpointStatus::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "never_run" => Some(CheckpointStatus::NeverRun),
            "success" => Some(CheckpointStatus::Success),
            "partial_failure" => Some(CheckpointStatus::PartialFailure),
            "failure" => Some(CheckpointStatus::Failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source: SourceId,
    /// End of the last run that loaded at least one batch.
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_status: CheckpointStatus,
    /// Opaque resume marker (`page:<n>` of the last loaded batch).
    pub cursor: Option<String>,
    pub last_error: Option<String>,
    pub records_loaded: u64,
}

impl Checkpoint {
    pub fn never_run(source: SourceId) -> Self {
        Self {
            source,
            last_success_at: None,
            last_failure_at: None,
            last_status: CheckpointStatus::NeverRun,
            cursor: None,
            last_error: None,
            records_loaded: 0,
        }
    }

    /// Last page loaded, decoded from the cursor.
    pub fn cursor_page(&self) -> Option<u32> {
        self.cursor
            .as_deref()
            .and_then(|c| c.strip_prefix("page:"))
            .and_then(|n| n.parse().ok())
    }

    /// Where a paginated extraction should start: right after the last
    /// loaded page when the previous run stopped halfway, page 1 otherwise.
    pub fn resume_request(&self) -> BatchRequest {
        match (self.last_status, self.cursor_page()) {
            (CheckpointStatus::PartialFailure, Some(page)) => BatchRequest { page }.next(),
            _ => BatchRequest::first(),
        }
    }

    /// Fold a finished run into the checkpoint. Returns `None` when the run
    /// must not touch the checkpoint at all.
    pub fn commit(&self, run: &EtlRun, cursor: Option<String>) -> Option<Checkpoint> {
        let mut next = self.clone();
        match run.status {
            RunStatus::Skipped => return None,
            RunStatus::Success | RunStatus::PartialFailure => {
                // an empty run (no file, empty first page) proves nothing new
                if run.batches_loaded > 0 {
                    let ts = match self.last_success_at {
                        Some(prev) if prev > run.ended_at => prev,
                        _ => run.ended_at,
                    };
                    next.last_success_at = Some(ts);
                    if cursor.is_some() {
                        next.cursor = cursor;
                    }
                }
                next.last_status = if run.status == RunStatus::Success {
                    CheckpointStatus::Success
                } else {
                    CheckpointStatus::PartialFailure
                };
                next.last_error = run.error_summary.clone();
                next.records_loaded = run.records_loaded;
            }
            RunStatus::Failure => {
                next.last_status = CheckpointStatus::Failure;
                next.last_failure_at = Some(run.ended_at);
                next.last_error = run.error_summary.clone();
            }
        }
        Some(next)
    }
}
