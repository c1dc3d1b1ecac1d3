//! Background lookup materialization

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::RunReport;
use crate::error::Result;
use crate::manager::CentralSyncManager;

/// Periodically brings the lookup table up to date.
///
/// Failed passes are retried with exponential backoff and logged; they
/// never stop the worker.
pub struct MaterializerWorker {
    manager: CentralSyncManager,
    interval: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl MaterializerWorker {
    pub fn new(manager: CentralSyncManager) -> Self {
        let config = manager.config();
        Self {
            interval: config.lookup_interval,
            max_retries: config.lookup_max_retries,
            backoff: config.lookup_backoff,
            manager,
        }
    }

    /// One pass, without retries
    pub async fn run_once(&self) -> Result<RunReport> {
        self.manager.update_lookup_table().await
    }

    /// Delay before retry number `attempt + 1`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2_u32.saturating_pow(attempt))
    }

    /// Run until `shutdown` turns true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Lookup materializer worker started"
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_with_retries(&mut shutdown).await;
                    if *shutdown.borrow() {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Lookup materializer worker stopped");
    }

    async fn run_with_retries(&self, shutdown: &mut watch::Receiver<bool>) -> Option<RunReport> {
        let mut attempt = 0;
        loop {
            match self.run_once().await {
                Ok(report) if report.failures.is_empty() => {
                    tracing::debug!(rows = report.rows(), "Lookup materializer pass complete");
                    return Some(report);
                }
                Ok(report) => tracing::warn!(
                    attempt,
                    failures = report.failures.len(),
                    "Lookup materializer pass had failed windows"
                ),
                Err(error) => tracing::warn!(attempt, "Lookup materializer pass failed: {error}"),
            }

            if attempt >= self.max_retries {
                tracing::warn!(
                    retries = self.max_retries,
                    "Lookup materializer giving up until the next interval"
                );
                return None;
            }
            let delay = self.backoff_delay(attempt);
            attempt += 1;
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return None,
            }
        }
    }
}
