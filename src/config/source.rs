// src/config/source.rs
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ingest::rate_limiter::RateLimitPolicy;
use crate::ingest::resilience::{BreakerPolicy, RetryPolicy};
use crate::ingest::types::{SourceId, SourceKind};

pub const COINGECKO_BASE_URL: &str = "https://api.coingecko.com/api/v3";
pub const COINPAPRIKA_BASE_URL: &str = "https://api.coinpaprika.com/v1";
pub const DEFAULT_CSV_PATH: &str = "data/crypto_data.csv";

/// Immutable per-source settings, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: SourceId,
    pub enabled: bool,
    /// API root for remote sources.
    pub base_url: String,
    pub api_key: Option<String>,
    /// File read by the static-file source.
    pub path: PathBuf,
    /// Records per request (`per_page` / `limit`).
    pub page_size: u32,
    /// Upper bound on pages per run for paginated sources.
    pub max_pages: u32,
    /// `None` means the source is never throttled.
    pub rate_limit: Option<RateLimitPolicy>,
    pub retry: RetryPolicy,
    pub breaker: BreakerPolicy,
}

impl SourceConfig {
    pub fn defaults_for(id: SourceId) -> Self {
        let (base_url, rate_limit) = match id {
            SourceId::CoinGecko => (COINGECKO_BASE_URL, Some(RateLimitPolicy::per_minute(50))),
            SourceId::CoinPaprika => (COINPAPRIKA_BASE_URL, Some(RateLimitPolicy::per_minute(10))),
            SourceId::Csv => ("", None),
        };
        Self {
            id,
            enabled: true,
            base_url: base_url.to_string(),
            api_key: None,
            path: PathBuf::from(DEFAULT_CSV_PATH),
            page_size: 100,
            max_pages: 3,
            rate_limit,
            retry: RetryPolicy::default(),
            breaker: BreakerPolicy::default(),
        }
    }

    pub fn kind(&self) -> SourceKind {
        match self.id {
            SourceId::CoinGecko => SourceKind::PaginatedApi,
            SourceId::CoinPaprika => SourceKind::SimpleApi,
            SourceId::Csv => SourceKind::StaticFile,
        }
    }
}

/// Partial per-source block as written in the TOML file. Present keys
/// replace the built-in default, absent keys keep it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceOverrides {
    pub enabled: Option<bool>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub path: Option<PathBuf>,
    pub page_size: Option<u32>,
    pub max_pages: Option<u32>,
    pub rate_limit: Option<RateLimitPolicy>,
    pub retry: Option<RetryPolicy>,
    pub breaker: Option<BreakerPolicy>,
}

impl SourceOverrides {
    pub fn apply(self, cfg: &mut SourceConfig) {
        if let Some(v) = self.enabled {
            cfg.enabled = v;
        }
        if let Some(v) = self.base_url {
            cfg.base_url = v;
        }
        if self.api_key.is_some() {
            cfg.api_key = self.api_key;
        }
        if let Some(v) = self.path {
            cfg.path = v;
        }
        if let Some(v) = self.page_size {
            cfg.page_size = v;
        }
        if let Some(v) = self.max_pages {
            cfg.max_pages = v;
        }
        if self.rate_limit.is_some() {
            cfg.rate_limit = self.rate_limit;
        }
        if let Some(v) = self.retry {
            cfg.retry = v;
        }
        if let Some(v) = self.breaker {
            cfg.breaker = v;
        }
    }
}
