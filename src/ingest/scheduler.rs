// src/ingest/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::EtlConfig;
use crate::error::EtlError;
use crate::ingest::orchestrator::Orchestrator;

#[derive(Clone, Copy, Debug)]
pub struct SchedulerCfg {
    pub interval: Duration,
    pub run_on_startup: bool,
}

impl From<&EtlConfig> for SchedulerCfg {
    fn from(cfg: &EtlConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.interval_secs),
            run_on_startup: cfg.run_on_startup,
        }
    }
}

/// Owns the per-source tasks and the shutdown flag they (and the
/// orchestrator) watch.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Flip the shutdown flag and wait for every task. An in-flight run
    /// finishes its current batch and records a terminal status first.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "scheduler task panicked");
            }
        }
        tracing::info!("scheduler drained");
    }
}

/// One task per source, each on its own fixed interval. Missed ticks are
/// skipped, so a slow run never causes a burst of catch-up runs.
///
/// `shutdown` must be the sender paired with the receiver the orchestrator
/// was built with.
pub fn spawn(
    orchestrator: Arc<Orchestrator>,
    cfg: SchedulerCfg,
    shutdown: watch::Sender<bool>,
) -> SchedulerHandle {
    let tasks = orchestrator
        .sources()
        .into_iter()
        .map(|source| {
            let orch = Arc::clone(&orchestrator);
            let mut stop = shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cfg.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                if !cfg.run_on_startup {
                    // first tick completes immediately
                    ticker.tick().await;
                }
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                break;
                            }
                            continue;
                        }
                    }
                    if *stop.borrow() {
                        break;
                    }
                    match orch.run_one(source).await {
                        Ok(run) => tracing::debug!(
                            target: "ingest",
                            source = %source,
                            status = %run.status,
                            "scheduled run done"
                        ),
                        Err(EtlError::AlreadyRunning(_)) => {
                            tracing::debug!(source = %source, "previous run still in progress, tick skipped")
                        }
                        Err(e) => tracing::warn!(source = %source, error = %e, "scheduled run failed"),
                    }
                }
                tracing::debug!(source = %source, "scheduler task stopped");
            })
        })
        .collect();

    tracing::info!(
        interval_secs = cfg.interval.as_secs(),
        run_on_startup = cfg.run_on_startup,
        "scheduler started"
    );
    SchedulerHandle { shutdown, tasks }
}
