//! Error taxonomy for the ingestion core.
//!
//! Per-record validation problems are *not* errors: they travel as
//! [`crate::ingest::types::Rejection`] values and are only counted.
//! Everything here is either retryable (`is_transient`) or terminal for the
//! current run; none of it ever crashes the orchestrator.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::ingest::types::SourceId;

/// Whether an extraction failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionKind {
    /// Timeout, connection reset, HTTP 429 or 5xx.
    Transient,
    /// Bad credentials, unknown endpoint, unreadable file.
    Permanent,
}

impl fmt::Display for ExtractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionKind::Transient => f.write_str("transient"),
            ExtractionKind::Permanent => f.write_str("permanent"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind} extraction error: {message}")]
pub struct ExtractionError {
    pub kind: ExtractionKind,
    pub message: String,
    /// HTTP status when the failure came from a response.
    pub status: Option<u16>,
}

impl ExtractionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ExtractionKind::Transient,
            message: message.into(),
            status: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ExtractionKind::Permanent,
            message: message.into(),
            status: None,
        }
    }

    /// Classify an HTTP status: 429 and 5xx are retryable, everything else is not.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = if status == 429 || (500..600).contains(&status) {
            ExtractionKind::Transient
        } else {
            ExtractionKind::Permanent
        };
        Self {
            kind,
            message: message.into(),
            status: Some(status),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ExtractionKind::Transient
    }
}

/// A whole batch could not be parsed (not a per-record rejection).
#[derive(Debug, Clone, Error)]
#[error("transform error: {0}")]
pub struct TransformError(pub String);

/// Failures of the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Orchestrator-facing error taxonomy.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("rate limit exceeded for {source_id} after waiting {waited:?}")]
    RateLimitExceeded { source_id: SourceId, waited: Duration },

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("load error: {0}")]
    Load(#[source] StorageError),

    #[error("circuit open for {source_id}, retry in {retry_in:?}")]
    CircuitOpen { source_id: SourceId, retry_in: Duration },

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("a run for {0} is already in progress")]
    AlreadyRunning(SourceId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EtlError {
    /// Retry policy input: only transient extraction, rate limiting and
    /// storage write failures are retried.
    pub fn is_transient(&self) -> bool {
        match self {
            EtlError::RateLimitExceeded { .. } | EtlError::Load(_) => true,
            EtlError::Extraction(e) => e.is_transient(),
            _ => false,
        }
    }
}
