// tests/config_env.rs
use std::{env, fs};

use crypto_market_etl::config::{EtlConfig, DEFAULT_DATABASE_URL};
use crypto_market_etl::error::ConfigError;
use crypto_market_etl::ingest::types::SourceId;

const VARS: &[&str] = &[
    "ETL_CONFIG_PATH",
    "DATABASE_URL",
    "ETL_INTERVAL_SECS",
    "ETL_RUN_ON_STARTUP",
    "METRICS_ADDR",
    "ETL_MAX_ATTEMPTS",
    "ETL_BACKOFF_BASE_MS",
    "ETL_BREAKER_THRESHOLD",
    "ETL_BREAKER_COOLDOWN_SECS",
    "COINGECKO_RATE_LIMIT",
    "COINPAPRIKA_RATE_LIMIT",
    "COINGECKO_API_KEY",
    "CSV_PATH",
];

fn clear_env() {
    for v in VARS {
        env::remove_var(v);
    }
}

#[serial_test::serial]
#[test]
fn load_uses_env_path_then_cwd_fallback_then_defaults() {
    // isolate cwd so the repository's own config/ is never read
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();
    clear_env();

    // 1) nothing at all: built-in defaults
    let cfg = EtlConfig::load().unwrap();
    assert_eq!(cfg, EtlConfig::default());
    assert_eq!(cfg.database_url, DEFAULT_DATABASE_URL);

    // 2) ./config/etl.toml
    fs::create_dir_all(tmp.path().join("config")).unwrap();
    fs::write(
        tmp.path().join("config/etl.toml"),
        "interval_secs = 300\n[sources.coinpaprika]\nenabled = false\n",
    )
    .unwrap();
    let cfg = EtlConfig::load().unwrap();
    assert_eq!(cfg.interval_secs, 300);
    assert!(!cfg.source(SourceId::CoinPaprika).unwrap().enabled);

    // 3) ETL_CONFIG_PATH wins over the fallback, env vars win over the file
    let custom = tmp.path().join("custom.toml");
    fs::write(&custom, "interval_secs = 900\nrun_on_startup = false\n").unwrap();
    env::set_var("ETL_CONFIG_PATH", custom.display().to_string());
    env::set_var("ETL_INTERVAL_SECS", "45");
    env::set_var("COINGECKO_API_KEY", "demo");
    let cfg = EtlConfig::load().unwrap();
    assert_eq!(cfg.interval_secs, 45);
    assert!(!cfg.run_on_startup);
    assert!(cfg.source(SourceId::CoinPaprika).unwrap().enabled);
    assert_eq!(
        cfg.source(SourceId::CoinGecko).unwrap().api_key.as_deref(),
        Some("demo")
    );

    clear_env();
    env::set_current_dir(&old).unwrap();
}

#[serial_test::serial]
#[test]
fn load_reports_missing_file_and_invalid_values() {
    clear_env();
    env::set_var("ETL_CONFIG_PATH", "/definitely/not/here.toml");
    assert!(matches!(EtlConfig::load(), Err(ConfigError::Read { .. })));

    env::remove_var("ETL_CONFIG_PATH");
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();

    env::set_var("ETL_INTERVAL_SECS", "0");
    assert!(matches!(EtlConfig::load(), Err(ConfigError::Invalid(_))));
    env::set_var("ETL_INTERVAL_SECS", "often");
    assert!(matches!(EtlConfig::load(), Err(ConfigError::InvalidEnv { .. })));

    clear_env();
    env::set_current_dir(&old).unwrap();
}
