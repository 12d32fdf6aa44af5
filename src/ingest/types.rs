// src/ingest/types.rs
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The configured upstream sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    CoinPaprika,
    CoinGecko,
    Csv,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::CoinPaprika, SourceId::CoinGecko, SourceId::Csv];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::CoinPaprika => "coinpaprika",
            SourceId::CoinGecko => "coingecko",
            SourceId::Csv => "csv",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coinpaprika" => Ok(SourceId::CoinPaprika),
            "coingecko" => Ok(SourceId::CoinGecko),
            "csv" => Ok(SourceId::Csv),
            other => Err(other.to_string()),
        }
    }
}

/// How a source delivers its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    PaginatedApi,
    SimpleApi,
    StaticFile,
}

impl SourceKind {
    /// Remote kinds go through the rate limiter before every call.
    pub fn is_remote(&self) -> bool {
        !matches!(self, SourceKind::StaticFile)
    }
}

/// Position of the next batch to extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRequest {
    pub page: u32,
}

impl BatchRequest {
    pub fn first() -> Self {
        Self { page: 1 }
    }

    pub fn next(&self) -> Self {
        Self {
            page: self.page.saturating_add(1),
        }
    }
}

/// As-received payload, before any parsing into records.
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    /// Response body of a JSON API, verbatim.
    Json(String),
    /// Header-keyed rows of a tabular file.
    Rows(Vec<BTreeMap<String, String>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawBatch {
    pub source: SourceId,
    pub page: u32,
    pub fetched_at: DateTime<Utc>,
    pub payload: RawPayload,
}

impl RawBatch {
    /// Opaque checkpoint cursor identifying this batch.
    pub fn cursor(&self) -> String {
        format!("page:{}", self.page)
    }
}

/// Append-only audit entry: one as-received record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: SourceId,
    pub native_id: String,
    pub ingested_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// The unified, deduplicated coin row (one per canonical id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coin {
    pub canonical_id: String,
    pub symbol: String,
    pub name: String,
    pub price_usd: Option<f64>,
    pub market_cap_usd: Option<f64>,
    pub volume_24h_usd: Option<f64>,
    pub price_change_24h_pct: Option<f64>,
    pub market_rank: Option<u32>,
    pub source: SourceId,
    pub last_updated: DateTime<Utc>,
}

impl Coin {
    /// True when a write of `other` would not change anything observable
    /// besides the timestamp.
    pub fn same_content(&self, other: &Coin) -> bool {
        self.canonical_id == other.canonical_id
            && self.symbol == other.symbol
            && self.name == other.name
            && self.price_usd == other.price_usd
            && self.market_cap_usd == other.market_cap_usd
            && self.volume_24h_usd == other.volume_24h_usd
            && self.price_change_24h_pct == other.price_change_24h_pct
            && self.market_rank == other.market_rank
            && self.source == other.source
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Missing,
    Empty,
    NotNumeric,
    Negative,
    NotInteger,
    NotAnObject,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::Missing => "missing",
            RejectReason::Empty => "empty",
            RejectReason::NotNumeric => "not numeric",
            RejectReason::Negative => "negative",
            RejectReason::NotInteger => "not an integer",
            RejectReason::NotAnObject => "not an object",
        };
        f.write_str(s)
    }
}

/// One record refused by validation. Never aborts its batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub native_id: Option<String>,
    pub field: String,
    pub reason: RejectReason,
}

impl Rejection {
    pub fn new(native_id: Option<&str>, field: &str, reason: RejectReason) -> Self {
        Self {
            native_id: native_id.map(str::to_string),
            field: field.to_string(),
            reason,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.native_id {
            Some(id) => write!(f, "{id}: {} {}", self.field, self.reason),
            None => write!(f, "<no id>: {} {}", self.field, self.reason),
        }
    }
}

/// Output of `SourceAdapter::transform` for one raw batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformedBatch {
    pub candidates: Vec<Coin>,
    pub rejections: Vec<Rejection>,
    pub raw: Vec<RawRecord>,
}

impl TransformedBatch {
    pub fn extracted(&self) -> usize {
        self.candidates.len() + self.rejections.len()
    }
}

/// Result of a single keyed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadCounts {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub rejected: u64,
}

impl LoadCounts {
    /// Rows that were actually written.
    pub fn loaded(&self) -> u64 {
        self.inserted + self.updated
    }

    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// Terminal outcome of one orchestration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialFailure,
    Failure,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial_failure",
            RunStatus::Failure => "failure",
            RunStatus::Skipped => "skipped",
        }
    }

    /// Runs that completed, fully or in part. The checkpoint only moves
    /// when such a run also loaded a batch.
    pub fn advances_checkpoint(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::PartialFailure)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "partial_failure" => Ok(RunStatus::PartialFailure),
            "failure" => Ok(RunStatus::Failure),
            "skipped" => Ok(RunStatus::Skipped),
            other => Err(other.to_string()),
        }
    }
}

/// Non-terminal phases of an in-flight run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    Extracting,
    Transforming,
    Loading,
}

/// One orchestration attempt for one source. Appended once, at its
/// terminal status, and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlRun {
    pub run_id: String,
    pub source: SourceId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    pub records_extracted: u64,
    pub records_loaded: u64,
    pub records_unchanged: u64,
    pub records_rejected: u64,
    pub batches_loaded: u32,
    pub batches_failed: u32,
    pub error_summary: Option<String>,
}

impl EtlRun {
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds().max(0)
    }
}

/// Read-side filter for coin queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinQuery {
    pub page: u32,
    pub page_size: u32,
    pub source: Option<String>,
    pub symbol: Option<String>,
}

impl CoinQuery {
    pub const MAX_PAGE_SIZE: u32 = 100;

    /// Clamp paging into the accepted range and normalise filters.
    pub fn normalized(&self) -> CoinQuery {
        CoinQuery {
            page: self.page.max(1),
            page_size: self.page_size.clamp(1, Self::MAX_PAGE_SIZE),
            source: self
                .source
                .as_deref()
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty()),
            symbol: self
                .symbol
                .as_deref()
                .map(|s| s.trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty()),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

impl Default for CoinQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 50,
            source: None,
            symbol: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoinPage {
    pub items: Vec<Coin>,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub source: Option<SourceId>,
    pub limit: Option<usize>,
}
