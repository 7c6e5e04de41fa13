//! Saga recovery worker
//!
//! On a crash the orchestrator may leave sagas in CREATED, RESERVED, or
//! PAID. This worker scans for non-terminal instances older than a
//! threshold and asks the orchestrator to resume or fail each one.
//!
//! It also runs the re-notify sweep: a CONFIRMED saga whose notification
//! enqueue failed past the step budget has no outbox row at all, so the
//! dispatcher's retry machinery never sees it. The sweep finds those
//! sagas and re-runs the enqueue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::errors::BookingError;

use super::orchestrator::SagaOrchestrator;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub scan_interval: Duration,
    pub stale_threshold: Duration,
    pub batch_size: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(120),
            batch_size: 100,
        }
    }
}

pub struct SagaRecoveryWorker {
    orchestrator: Arc<SagaOrchestrator>,
    config: RecoveryConfig,
}

impl SagaRecoveryWorker {
    pub fn new(orchestrator: Arc<SagaOrchestrator>, config: RecoveryConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Starting saga recovery worker"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.scan_interval) => {}
                _ = shutdown.changed() => {
                    info!("Saga recovery worker shutting down");
                    return;
                }
            }

            match self.scan_once().await {
                Ok(0) => {}
                Ok(n) => info!(recovered = n, "Recovered sagas this scan"),
                Err(e) => error!(error = %e, "Recovery scan failed"),
            }
        }
    }

    /// One scan cycle. Returns how many sagas changed state or were
    /// re-notified.
    pub async fn scan_once(&self) -> Result<usize, BookingError> {
        let stale = self
            .orchestrator
            .db()
            .find_stale(self.config.stale_threshold, self.config.batch_size)
            .await?;

        if stale.is_empty() {
            debug!("No stale sagas found");
        }

        let mut recovered = 0;
        for saga in &stale {
            match self.orchestrator.recover(saga).await {
                Ok(new_state) if new_state != saga.state => {
                    info!(
                        saga_id = %saga.id,
                        old_state = %saga.state,
                        new_state = %new_state,
                        "Saga state advanced by recovery"
                    );
                    recovered += 1;
                }
                Ok(_) => {}
                Err(e) => error!(
                    saga_id = %saga.id,
                    state = %saga.state,
                    error = %e,
                    "Failed to recover saga"
                ),
            }
        }

        recovered += self.renotify_sweep().await?;
        Ok(recovered)
    }

    /// Re-enqueue notifications for confirmed sagas that lost theirs.
    async fn renotify_sweep(&self) -> Result<usize, BookingError> {
        let unnotified = self
            .orchestrator
            .db()
            .find_unnotified_confirmed(self.config.stale_threshold, self.config.batch_size)
            .await?;

        let mut renotified = 0;
        for saga in &unnotified {
            match self.orchestrator.renotify(saga).await {
                Ok(()) => renotified += 1,
                Err(e) => error!(
                    saga_id = %saga.id,
                    error = %e,
                    "Re-notify failed; next sweep retries"
                ),
            }
        }
        Ok(renotified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_defaults() {
        let config = RecoveryConfig::default();
        assert_eq!(config.scan_interval, Duration::from_secs(30));
        assert_eq!(config.stale_threshold, Duration::from_secs(120));
        assert_eq!(config.batch_size, 100);
    }
}
