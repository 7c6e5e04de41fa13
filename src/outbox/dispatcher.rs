//! Outbox dispatcher
//!
//! Long-running worker draining PENDING outbox rows to the event bus.
//! Multiple instances can run side by side: rows are claimed with
//! row-level locks and SKIP LOCKED, never table locks.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::config::timeouts;
use crate::errors::BookingError;

use super::{OutboxStatus, claim_batch, mark_failed_attempt, mark_published};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            batch_size: 100,
        }
    }
}

/// Backoff before the next attempt, proportional to how often the row has
/// already failed.
fn backoff_secs(retry_count: i32) -> i64 {
    const BASE_SECS: i64 = 1;
    const MAX_SECS: i64 = 30;
    (BASE_SECS * i64::from(retry_count.max(1))).min(MAX_SECS)
}

pub struct OutboxDispatcher {
    pool: PgPool,
    bus: Arc<dyn EventBus>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(pool: PgPool, bus: Arc<dyn EventBus>, config: DispatcherConfig) -> Self {
        Self { pool, bus, config }
    }

    /// Run until the shutdown channel flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting outbox dispatcher"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {
                    info!("Outbox dispatcher shutting down");
                    return;
                }
            }

            match self.drain_once().await {
                Ok(0) => {}
                Ok(n) => debug!(published = n, "Outbox batch drained"),
                Err(e) => error!(error = %e, "Outbox batch failed"),
            }
        }
    }

    /// Claim and publish one batch. Returns how many rows were published.
    pub async fn drain_once(&self) -> Result<usize, BookingError> {
        let mut tx = self.pool.begin().await?;
        let batch = claim_batch(&mut tx, self.config.batch_size).await?;
        if batch.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        let mut published = 0;
        for event in &batch {
            let result = tokio::time::timeout(
                timeouts::PUBLISH,
                self.bus
                    .publish(&event.topic, &event.partition_key, &event.payload),
            )
            .await;

            match result {
                Ok(Ok(())) => {
                    mark_published(&mut tx, event.id).await?;
                    published += 1;
                }
                Ok(Err(bus_err)) => {
                    let status = mark_failed_attempt(
                        &mut tx,
                        event,
                        &bus_err.to_string(),
                        backoff_secs(event.retry_count + 1),
                    )
                    .await?;
                    if status == OutboxStatus::Failed {
                        error!(
                            outbox_id = %event.id,
                            event_type = %event.event_type,
                            retries = event.retry_count + 1,
                            error = %bus_err,
                            "Outbox row moved to FAILED, operator attention required"
                        );
                    } else {
                        warn!(
                            outbox_id = %event.id,
                            event_type = %event.event_type,
                            attempt = event.retry_count + 1,
                            error = %bus_err,
                            "Outbox publish failed, will retry"
                        );
                    }
                }
                Err(_elapsed) => {
                    let status = mark_failed_attempt(
                        &mut tx,
                        event,
                        "publish timed out",
                        backoff_secs(event.retry_count + 1),
                    )
                    .await?;
                    if status == OutboxStatus::Failed {
                        error!(
                            outbox_id = %event.id,
                            event_type = %event.event_type,
                            "Outbox row moved to FAILED after publish timeouts"
                        );
                    }
                }
            }
        }

        tx.commit().await?;
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_proportional_and_capped() {
        assert_eq!(backoff_secs(0), 1);
        assert_eq!(backoff_secs(1), 1);
        assert_eq!(backoff_secs(3), 3);
        assert_eq!(backoff_secs(500), 30);
    }

    #[test]
    fn test_dispatcher_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 100);
    }
}
