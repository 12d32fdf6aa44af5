//! crypto-market-etl: binary entrypoint
//!
//! `crypto-market-etl once` runs every enabled source a single time and exits
//! (non-zero when every source failed). `status` prints the stored run
//! history and checkpoints. Without arguments it schedules periodic runs
//! until Ctrl-C, then drains in-flight runs.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;

use crypto_market_etl::config::EtlConfig;
use crypto_market_etl::ingest::providers::build_adapters;
use crypto_market_etl::ingest::resilience::RandomJitter;
use crypto_market_etl::ingest::scheduler::{self, SchedulerCfg};
use crypto_market_etl::ingest::types::RunFilter;
use crypto_market_etl::logging::{self, LogFormat};
use crypto_market_etl::{Orchestrator, SqliteStorage};

const RECENT_RUNS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Once,
    Status,
    Daemon,
}

fn parse_mode() -> Result<Mode> {
    match std::env::args().nth(1).as_deref() {
        None | Some("run") | Some("daemon") => Ok(Mode::Daemon),
        Some("once") => Ok(Mode::Once),
        Some("status") => Ok(Mode::Status),
        Some(other) => bail!("unknown command {other:?} (expected `once`, `status` or `daemon`)"),
    }
}

/// `sqlite://path/to.db` needs its parent directory to exist.
fn ensure_db_dir(url: &str) -> Result<()> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .map(|p| p.split('?').next().unwrap_or(p));
    if let Some(p) = path.filter(|p| !p.starts_with(':')) {
        if let Some(parent) = std::path::Path::new(p).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    logging::init(LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref()));

    let mode = parse_mode()?;
    let config = EtlConfig::load().context("loading configuration")?;

    if let Some(addr) = config.metrics_addr.as_deref() {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("METRICS_ADDR {addr:?} is not host:port"))?;
        crypto_market_etl::metrics::install_prometheus(addr)
            .context("installing prometheus exporter")?;
        tracing::info!(%addr, "prometheus listener up");
    }

    ensure_db_dir(&config.database_url)?;
    let storage = SqliteStorage::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.database_url))?;
    let adapters = build_adapters(&config).context("building source adapters")?;
    tracing::info!(
        sources = ?adapters.iter().map(|a| a.source().as_str()).collect::<Vec<_>>(),
        database = %config.database_url,
        "crypto-market-etl starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Arc::new(Orchestrator::new(
        &config,
        Arc::new(storage),
        adapters,
        Arc::new(RandomJitter::from_os()),
        shutdown_rx,
    ));

    match mode {
        Mode::Once => {
            let summary = orchestrator.run_all().await;
            tracing::info!(summary = %serde_json::to_string(&summary)?, "run summary");
            if summary.all_failed() {
                bail!("every source failed");
            }
        }
        Mode::Status => {
            let report = serde_json::json!({
                "health": orchestrator.health().await?,
                "stats": orchestrator.stats().await?,
                "checkpoints": orchestrator.checkpoints().await?,
                "recent_runs": orchestrator
                    .list_runs(&RunFilter { source: None, limit: Some(RECENT_RUNS) })
                    .await?,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Mode::Daemon => {
            let handle = scheduler::spawn(
                Arc::clone(&orchestrator),
                SchedulerCfg::from(&config),
                shutdown_tx,
            );
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            tracing::info!("shutdown requested, draining in-flight runs");
            handle.shutdown().await;
        }
    }
    Ok(())
}
