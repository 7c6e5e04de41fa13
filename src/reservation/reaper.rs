//! Expiry reaper
//!
//! Periodic worker releasing reservations whose TTL elapsed before
//! confirmation. The CAS to EXPIRED resolves the race with a concurrent
//! confirm: exactly one side wins, and the loser must not touch inventory.
//! Scanning the same row twice changes nothing (the CAS fails the second
//! time, and the release script is one-shot besides).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::errors::BookingError;
use crate::models::{Reservation, ReservationStatus};
use crate::outbox::{self, NewOutboxEvent};
use crate::store::FastStore;

use super::engine::release_args;
use super::repository::ReservationDb;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub scan_interval: Duration,
    pub batch_size: i64,
    pub outbox_max_retries: i32,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(5),
            batch_size: 100,
            outbox_max_retries: 5,
        }
    }
}

pub struct ExpiryReaper {
    db: Arc<ReservationDb>,
    store: Arc<dyn FastStore>,
    config: ReaperConfig,
}

impl ExpiryReaper {
    pub fn new(db: Arc<ReservationDb>, store: Arc<dyn FastStore>, config: ReaperConfig) -> Self {
        Self { db, store, config }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting expiry reaper"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.scan_interval) => {}
                _ = shutdown.changed() => {
                    info!("Expiry reaper shutting down");
                    return;
                }
            }

            match self.scan_once().await {
                Ok(0) => {}
                Ok(n) => debug!(expired = n, "Reaper released expired reservations"),
                Err(e) => error!(error = %e, "Reaper scan failed"),
            }
        }
    }

    /// One scan cycle. Returns how many reservations this instance expired.
    pub async fn scan_once(&self) -> Result<usize, BookingError> {
        let expired = self.db.find_expired(self.config.batch_size).await?;
        let mut released = 0;

        for reservation in expired {
            match self.expire_one(&reservation).await {
                Ok(true) => released += 1,
                Ok(false) => {} // lost the CAS to a concurrent confirm
                Err(e) => error!(
                    booking_id = %reservation.id,
                    error = %e,
                    "Failed to expire reservation"
                ),
            }
        }

        Ok(released)
    }

    async fn expire_one(&self, reservation: &Reservation) -> Result<bool, BookingError> {
        // 1. CAS RESERVED → EXPIRED; losing means a confirm won the race.
        let mut tx = self.db.pool().begin().await?;
        let won = self
            .db
            .update_status_if_reserved(&mut tx, reservation.id, ReservationStatus::Expired)
            .await?;
        if !won {
            tx.rollback().await?;
            debug!(booking_id = %reservation.id, "Concurrent confirmation won, skipping");
            return Ok(false);
        }

        let mut expired = reservation.clone();
        expired.status = ReservationStatus::Expired;
        outbox::insert_in_tx(
            &mut tx,
            &NewOutboxEvent::booking_expired(&expired),
            self.config.outbox_max_retries,
        )
        .await?;
        tx.commit().await?;

        // 2. Restore inventory and the user counter.
        let reply = self.store.release(&release_args(reservation)).await?;
        match reply.into_result() {
            Ok(restored) => {
                if let Err(e) = outbox::insert_standalone(
                    self.db.pool(),
                    &NewOutboxEvent::zone_inventory_updated(&reservation.zone_id, restored),
                    self.config.outbox_max_retries,
                )
                .await
                {
                    error!(booking_id = %reservation.id, error = %e, "Inventory event write failed");
                }
            }
            Err(BookingError::AlreadyReleased) => {
                // Application compensation already restored this booking.
            }
            Err(e) => {
                error!(
                    booking_id = %reservation.id,
                    error = %e,
                    "Inventory restore failed after expiry CAS; operator reconciliation required"
                );
            }
        }

        info!(
            booking_id = %reservation.id,
            zone_id = %reservation.zone_id,
            quantity = reservation.quantity,
            "Reservation expired, inventory returned"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reaper_defaults() {
        let config = ReaperConfig::default();
        assert_eq!(config.scan_interval, Duration::from_secs(5));
        assert_eq!(config.batch_size, 100);
    }
}
