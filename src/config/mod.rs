// src/config/mod.rs
//! Runtime configuration.
//!
//! Layers, later wins:
//! 1) built-in defaults
//! 2) TOML file: `$ETL_CONFIG_PATH`, else `config/etl.toml` when present
//! 3) environment variables (after `.env` has been loaded by the binary)
//!
//! The resolved [`EtlConfig`] is handed to the orchestrator explicitly;
//! nothing below `main` reads the environment.

pub mod source;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::ingest::rate_limiter::RateLimitPolicy;
use crate::ingest::types::SourceId;

pub use source::{SourceConfig, SourceOverrides};

pub const ENV_CONFIG_PATH: &str = "ETL_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/etl.toml";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/crypto_etl.db";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EtlConfig {
    pub database_url: String,
    /// Seconds between scheduled runs of each source.
    pub interval_secs: u64,
    pub run_on_startup: bool,
    /// Prometheus listener, e.g. `0.0.0.0:9090`. Disabled when `None`.
    pub metrics_addr: Option<String>,
    pub http_timeout_secs: u64,
    pub sources: BTreeMap<SourceId, SourceConfig>,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            interval_secs: 30 * 60,
            run_on_startup: true,
            metrics_addr: None,
            http_timeout_secs: 30,
            sources: SourceId::ALL
                .into_iter()
                .map(|id| (id, SourceConfig::defaults_for(id)))
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    database_url: Option<String>,
    interval_secs: Option<u64>,
    run_on_startup: Option<bool>,
    metrics_addr: Option<String>,
    http_timeout_secs: Option<u64>,
    sources: BTreeMap<String, SourceOverrides>,
}

impl EtlConfig {
    /// Defaults, then the config file (if any), then the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var(ENV_CONFIG_PATH) {
            Ok(p) => Self::from_file(Path::new(&p))?,
            Err(_) => {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(&default)?
                } else {
                    Self::default()
                }
            }
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(s)?;
        let mut cfg = Self::default();
        if let Some(v) = file.database_url {
            cfg.database_url = v;
        }
        if let Some(v) = file.interval_secs {
            cfg.interval_secs = v;
        }
        if let Some(v) = file.run_on_startup {
            cfg.run_on_startup = v;
        }
        if file.metrics_addr.is_some() {
            cfg.metrics_addr = file.metrics_addr;
        }
        if let Some(v) = file.http_timeout_secs {
            cfg.http_timeout_secs = v;
        }
        for (name, overrides) in file.sources {
            let id: SourceId = name
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("unknown source [sources.{name}]")))?;
            overrides.apply(cfg.source_mut(id));
        }
        Ok(cfg)
    }

    fn source_mut(&mut self, id: SourceId) -> &mut SourceConfig {
        self.sources
            .entry(id)
            .or_insert_with(|| SourceConfig::defaults_for(id))
    }

    pub fn source(&self, id: SourceId) -> Option<&SourceConfig> {
        self.sources.get(&id)
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.values().filter(|s| s.enabled)
    }

    /// Overlay environment variables. `lookup` is `std::env::var` in the
    /// binary and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = get("ETL_INTERVAL_SECS") {
            self.interval_secs = parse_env("ETL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("ETL_RUN_ON_STARTUP") {
            self.run_on_startup = parse_bool("ETL_RUN_ON_STARTUP", &v)?;
        }
        if let Some(v) = get("METRICS_ADDR") {
            self.metrics_addr = Some(v);
        }

        // Applied to every source.
        if let Some(v) = get("ETL_MAX_ATTEMPTS") {
            let n: u32 = parse_env("ETL_MAX_ATTEMPTS", &v)?;
            self.sources.values_mut().for_each(|s| s.retry.max_attempts = n);
        }
        if let Some(v) = get("ETL_BACKOFF_BASE_MS") {
            let n: u64 = parse_env("ETL_BACKOFF_BASE_MS", &v)?;
            self.sources.values_mut().for_each(|s| s.retry.base_delay_ms = n);
        }
        if let Some(v) = get("ETL_BREAKER_THRESHOLD") {
            let n: u32 = parse_env("ETL_BREAKER_THRESHOLD", &v)?;
            self.sources
                .values_mut()
                .for_each(|s| s.breaker.failure_threshold = n);
        }
        if let Some(v) = get("ETL_BREAKER_COOLDOWN_SECS") {
            let n: u64 = parse_env("ETL_BREAKER_COOLDOWN_SECS", &v)?;
            self.sources
                .values_mut()
                .for_each(|s| s.breaker.cooldown_secs = n);
        }

        for (key, id) in [
            ("COINPAPRIKA_RATE_LIMIT", SourceId::CoinPaprika),
            ("COINGECKO_RATE_LIMIT", SourceId::CoinGecko),
        ] {
            if let Some(v) = get(key) {
                let per_minute: u32 = parse_env(key, &v)?;
                let src = self.source_mut(id);
                let mut policy = RateLimitPolicy::per_minute(per_minute);
                if let Some(prev) = &src.rate_limit {
                    policy.max_wait_ms = prev.max_wait_ms;
                    policy.mode = prev.mode;
                }
                src.rate_limit = Some(policy);
            }
        }
        if let Some(v) = get("COINGECKO_API_KEY") {
            self.source_mut(SourceId::CoinGecko).api_key = Some(v);
        }
        if let Some(v) = get("CSV_PATH") {
            self.source_mut(SourceId::Csv).path = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs == 0 {
            return Err(ConfigError::Invalid("interval_secs must be > 0".into()));
        }
        if self.http_timeout_secs == 0 {
            return Err(ConfigError::Invalid("http_timeout_secs must be > 0".into()));
        }
        for src in self.sources.values() {
            let id = src.id;
            if let Some(rl) = &src.rate_limit {
                if rl.capacity == 0 || rl.refill_tokens == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "{id}: rate limit capacity and refill_tokens must be > 0"
                    )));
                }
                if rl.refill_interval_ms == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "{id}: rate limit refill_interval_ms must be > 0"
                    )));
                }
            }
            if src.retry.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{id}: retry max_attempts must be > 0"
                )));
            }
            if !(0.0..=1.0).contains(&src.retry.jitter_ratio) {
                return Err(ConfigError::Invalid(format!(
                    "{id}: retry jitter_ratio must be within 0..=1"
                )));
            }
            if src.breaker.failure_threshold == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{id}: breaker failure_threshold must be > 0"
                )));
            }
            if src.kind().is_remote() && src.enabled && src.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{id}: base_url is required")));
            }
            if src.page_size == 0 || src.max_pages == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{id}: page_size and max_pages must be > 0"
                )));
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_cover_every_source() {
        let cfg = EtlConfig::default();
        assert_eq!(cfg.sources.len(), 3);
        assert_eq!(
            cfg.source(SourceId::CoinGecko).unwrap().rate_limit,
            Some(RateLimitPolicy::per_minute(50))
        );
        assert!(cfg.source(SourceId::Csv).unwrap().rate_limit.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn toml_overrides_only_named_keys() {
        let cfg = EtlConfig::from_toml_str(
            r#"
            interval_secs = 60

            [sources.coingecko]
            max_pages = 7
            retry = { max_attempts = 5 }

            [sources.csv]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.interval_secs, 60);
        let cg = cfg.source(SourceId::CoinGecko).unwrap();
        assert_eq!(cg.max_pages, 7);
        assert_eq!(cg.retry.max_attempts, 5);
        assert_eq!(cg.retry.base_delay_ms, 1_000);
        assert_eq!(cg.base_url, source::COINGECKO_BASE_URL);
        assert!(!cfg.source(SourceId::Csv).unwrap().enabled);
        assert_eq!(cfg.enabled_sources().count(), 2);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = EtlConfig::from_toml_str("intervl_secs = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        let err = EtlConfig::from_toml_str("[sources.binance]\nenabled = true").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn env_overrides_apply_to_sources() {
        let mut cfg = EtlConfig::default();
        cfg.apply_env(env(&[
            ("ETL_MAX_ATTEMPTS", "4"),
            ("ETL_BREAKER_THRESHOLD", "2"),
            ("COINPAPRIKA_RATE_LIMIT", "20"),
            ("CSV_PATH", "/tmp/x.csv"),
            ("ETL_RUN_ON_STARTUP", "false"),
            ("DATABASE_URL", "sqlite::memory:"),
        ]))
        .unwrap();
        assert!(!cfg.run_on_startup);
        assert_eq!(cfg.database_url, "sqlite::memory:");
        for s in cfg.sources.values() {
            assert_eq!(s.retry.max_attempts, 4);
            assert_eq!(s.breaker.failure_threshold, 2);
        }
        let cp = cfg.source(SourceId::CoinPaprika).unwrap();
        assert_eq!(cp.rate_limit.as_ref().unwrap().capacity, 20);
        assert_eq!(
            cfg.source(SourceId::Csv).unwrap().path,
            PathBuf::from("/tmp/x.csv")
        );
    }

    #[test]
    fn bad_env_values_are_reported() {
        let mut cfg = EtlConfig::default();
        let err = cfg
            .apply_env(env(&[("ETL_INTERVAL_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref key, .. } if key == "ETL_INTERVAL_SECS"));
    }

    #[test]
    fn zero_values_fail_validation() {
        let mut cfg = EtlConfig::default();
        cfg.apply_env(env(&[("ETL_BREAKER_THRESHOLD", "0")])).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = EtlConfig::default();
        cfg.apply_env(env(&[("COINGECKO_RATE_LIMIT", "0")])).unwrap();
        assert!(cfg.validate().is_err());
    }
}
