// src/metrics.rs
use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use once_cell::sync::OnceCell;

/// One-time metric descriptions, so every series shows up with help text.
pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("etl_runs_total", "Finished ETL runs by source and terminal status.");
        describe_counter!("etl_records_loaded_total", "Coins inserted or updated.");
        describe_counter!(
            "etl_records_unchanged_total",
            "Coins whose upsert matched the stored row."
        );
        describe_counter!(
            "etl_records_rejected_total",
            "Records refused by per-field validation."
        );
        describe_counter!("etl_retries_total", "Backoff retries after transient errors.");
        describe_counter!("etl_circuit_open_total", "Times a source circuit opened.");
        describe_counter!(
            "etl_audit_failures_total",
            "Raw audit writes that failed (logged, not propagated)."
        );
        describe_gauge!("etl_last_run_ts", Unit::Seconds, "Unix ts when a source last finished a run.");
        describe_histogram!("etl_run_duration_ms", Unit::Milliseconds, "Wall time of one ETL run.");
        describe_histogram!("etl_fetch_ms", Unit::Milliseconds, "Latency of one upstream fetch.");
    });
}

/// Install the Prometheus recorder with its own scrape listener.
pub fn install_prometheus(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    ensure_described();
    Ok(())
}
