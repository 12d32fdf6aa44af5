// src/logging.rs
//! Tracing subscriber setup for the binary.
//!
//! `RUST_LOG` drives the filter (default `crypto_market_etl=info,warn`);
//! `LOG_FORMAT=json` switches from compact text to one JSON object per line.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const DEFAULT_FILTER: &str = "crypto_market_etl=info,warn";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
