//! Reservation engine
//!
//! Wraps the atomic fast-store script with idempotency, the queue gate,
//! the catalog snapshot, and the durable write. Script rejections surface
//! verbatim; they are the taxonomy the client sees.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::catalog::CatalogProvider;
use crate::config::timeouts;
use crate::core_types::{BookingId, EventId, ShowId, UserId, ZoneId};
use crate::errors::BookingError;
use crate::models::{Reservation, ReservationStatus};
use crate::outbox::{self, NewOutboxEvent};
use crate::queue::pass::PassIssuer;
use crate::store::{FastStore, ReleaseArgs, ReserveArgs};

use super::repository::ReservationDb;

/// What a client asks to reserve.
#[derive(Debug, Clone)]
pub struct ReserveSpec {
    pub event_id: EventId,
    pub show_id: ShowId,
    pub zone_id: ZoneId,
    pub quantity: i32,
    /// Echo of the catalog's unit price; a mismatch is rejected.
    pub unit_price: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub reservation_ttl: Duration,
    pub queue_enforcement: bool,
    pub outbox_max_retries: i32,
}

pub struct ReservationEngine {
    db: Arc<ReservationDb>,
    store: Arc<dyn FastStore>,
    catalog: Arc<dyn CatalogProvider>,
    passes: Arc<PassIssuer>,
    config: EngineConfig,
}

impl ReservationEngine {
    pub fn new(
        db: Arc<ReservationDb>,
        store: Arc<dyn FastStore>,
        catalog: Arc<dyn CatalogProvider>,
        passes: Arc<PassIssuer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            store,
            catalog,
            passes,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn FastStore> {
        &self.store
    }

    pub fn db(&self) -> &Arc<ReservationDb> {
        &self.db
    }

    /// Reserve seats.
    ///
    /// # Flow
    /// 1. Idempotent replay by key (no script call)
    /// 2. Queue gate (admission pass, one-shot)
    /// 3. Catalog snapshot (bounded freshness)
    /// 4. Atomic script: check + decrement + record, one round trip
    /// 5. Durable write: reservation row + outbox rows, one transaction
    ///
    /// A relational failure after a successful script call triggers a
    /// best-effort compensating release; the reaper is the last line of
    /// defense behind that.
    pub async fn reserve(
        &self,
        user: UserId,
        spec: &ReserveSpec,
        idempotency_key: &str,
        queue_pass: Option<&str>,
    ) -> Result<Reservation, BookingError> {
        // Step 1: replay
        if let Some(existing) = self.db.get_by_idempotency_key(idempotency_key).await? {
            info!(booking_id = %existing.id, "Idempotent replay of reserve");
            return Ok(existing);
        }

        // Step 2: queue gate
        if self.config.queue_enforcement {
            let token = queue_pass.ok_or(BookingError::QueuePassRequired)?;
            self.passes
                .verify_and_redeem(token, &user, &spec.event_id, self.store.as_ref())
                .await?;
        }

        // Step 3: catalog snapshot
        let snapshot = self
            .catalog
            .zone_snapshot(&spec.event_id, &spec.show_id, &spec.zone_id)
            .await?;
        if !snapshot.on_sale {
            // Sale not initialized; same vocabulary the script uses.
            return Err(BookingError::ZoneNotFound);
        }
        if let Some(price) = spec.unit_price
            && price != snapshot.unit_price
        {
            return Err(BookingError::InvalidRequest(format!(
                "unit_price mismatch: catalog says {}",
                snapshot.unit_price
            )));
        }

        // Step 4: atomic script
        let booking_id = BookingId::new_v4();
        let args = ReserveArgs {
            zone: spec.zone_id,
            user,
            booking: booking_id,
            event: spec.event_id,
            show: spec.show_id,
            quantity: i64::from(spec.quantity),
            max_per_user: snapshot.max_per_user,
            unit_price: snapshot.unit_price,
            ttl: self.config.reservation_ttl,
        };
        let reply = tokio::time::timeout(timeouts::SCRIPT, self.store.reserve(&args))
            .await
            .map_err(|_| BookingError::ServiceUnavailable("fast store timed out".into()))??;
        let remaining = reply.into_result()?;

        // Step 5: durable write
        let now = Utc::now();
        let total = snapshot.unit_price * Decimal::from(spec.quantity);
        let reservation = Reservation {
            id: booking_id,
            user_id: user,
            event_id: spec.event_id,
            show_id: spec.show_id,
            zone_id: spec.zone_id,
            quantity: spec.quantity,
            unit_price: snapshot.unit_price,
            total,
            status: ReservationStatus::Reserved,
            reserved_at: now,
            expires_at: now
                + chrono::Duration::seconds(self.config.reservation_ttl.as_secs() as i64),
            confirmation_code: None,
            idempotency_key: idempotency_key.to_string(),
            event_name: snapshot.event_name.clone(),
            show_name: snapshot.show_name.clone(),
            zone_name: snapshot.zone_name.clone(),
            venue: snapshot.venue.clone(),
            zone_capacity: snapshot.capacity,
        };

        let persisted = tokio::time::timeout(
            timeouts::DB_WRITE,
            self.persist_reserved(&reservation, remaining),
        )
        .await;

        match persisted {
            Ok(Ok(())) => {
                info!(
                    booking_id = %booking_id,
                    user_id = %user,
                    zone_id = %spec.zone_id,
                    quantity = spec.quantity,
                    remaining,
                    "Reservation created"
                );
                Ok(reservation)
            }
            Ok(Err(e)) => {
                self.compensate_script(&reservation).await;
                Err(e)
            }
            Err(_elapsed) => {
                self.compensate_script(&reservation).await;
                Err(BookingError::ServiceUnavailable(
                    "reservation write timed out".into(),
                ))
            }
        }
    }

    async fn persist_reserved(
        &self,
        reservation: &Reservation,
        remaining: i64,
    ) -> Result<(), BookingError> {
        let mut tx = self.db.pool().begin().await?;
        self.db.insert_reserved(&mut tx, reservation).await?;
        outbox::insert_in_tx(
            &mut tx,
            &NewOutboxEvent::booking_reserved(reservation),
            self.config.outbox_max_retries,
        )
        .await?;
        outbox::insert_in_tx(
            &mut tx,
            &NewOutboxEvent::zone_inventory_updated(&reservation.zone_id, remaining),
            self.config.outbox_max_retries,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Best-effort inverse of a script call whose relational write failed.
    /// If this fails too, the TTL record has already vanished from the fast
    /// store's perspective once it expires, and the reaper cannot see a row
    /// that was never written; the release marker keeps a later manual
    /// replay safe.
    async fn compensate_script(&self, reservation: &Reservation) {
        warn!(
            booking_id = %reservation.id,
            "Relational write failed after script success; compensating inventory"
        );
        match self.store.release(&release_args(reservation)).await {
            Ok(reply) if reply.ok => {}
            Ok(reply) => warn!(
                booking_id = %reservation.id,
                code = %reply.code,
                "Compensating release was a no-op"
            ),
            Err(e) => error!(
                booking_id = %reservation.id,
                error = %e,
                "Compensating release failed; operator reconciliation required"
            ),
        }
    }

    /// Confirm a reservation after successful payment.
    pub async fn confirm(
        &self,
        booking_id: BookingId,
        user: UserId,
    ) -> Result<Reservation, BookingError> {
        let reservation = self
            .db
            .get(booking_id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("booking {booking_id}")))?;
        if reservation.user_id != user {
            return Err(BookingError::Forbidden);
        }
        match reservation.status {
            ReservationStatus::Confirmed => return Err(BookingError::AlreadyConfirmed),
            ReservationStatus::Cancelled => return Err(BookingError::AlreadyReleased),
            ReservationStatus::Expired => return Err(BookingError::Expired),
            ReservationStatus::Reserved => {}
        }
        let now = Utc::now();
        if reservation.expires_at <= now {
            // TTL elapsed; the reaper owns this row now.
            return Err(BookingError::Expired);
        }

        let code = confirmation_code();
        let mut tx = self.db.pool().begin().await?;
        let won = self
            .db
            .confirm_if_reserved(&mut tx, booking_id, &code)
            .await?;
        if !won {
            tx.rollback().await?;
            // Re-read to report what beat us.
            return match self.db.get(booking_id).await?.map(|r| r.status) {
                Some(ReservationStatus::Confirmed) => Err(BookingError::AlreadyConfirmed),
                Some(ReservationStatus::Cancelled) => Err(BookingError::AlreadyReleased),
                _ => Err(BookingError::Expired),
            };
        }

        let mut confirmed = reservation.clone();
        confirmed.status = ReservationStatus::Confirmed;
        confirmed.confirmation_code = Some(code);
        outbox::insert_in_tx(
            &mut tx,
            &NewOutboxEvent::booking_confirmed(&confirmed),
            self.config.outbox_max_retries,
        )
        .await?;
        tx.commit().await?;

        info!(booking_id = %booking_id, "Reservation confirmed");
        Ok(confirmed)
    }

    /// User-initiated release of an unpaid hold.
    pub async fn release(
        &self,
        booking_id: BookingId,
        user: UserId,
    ) -> Result<Reservation, BookingError> {
        let reservation = self
            .db
            .get(booking_id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("booking {booking_id}")))?;
        if reservation.user_id != user {
            return Err(BookingError::Forbidden);
        }
        self.release_internal(reservation, "user release").await
    }

    /// Release on behalf of saga compensation (no user check; the saga
    /// already authenticated the booking).
    pub async fn release_for_compensation(
        &self,
        booking_id: BookingId,
    ) -> Result<Reservation, BookingError> {
        let reservation = self
            .db
            .get(booking_id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("booking {booking_id}")))?;
        self.release_internal(reservation, "saga compensation").await
    }

    async fn release_internal(
        &self,
        reservation: Reservation,
        reason: &str,
    ) -> Result<Reservation, BookingError> {
        match reservation.status {
            ReservationStatus::Confirmed => return Err(BookingError::AlreadyConfirmed),
            ReservationStatus::Cancelled => return Err(BookingError::AlreadyReleased),
            ReservationStatus::Expired => return Err(BookingError::Expired),
            ReservationStatus::Reserved => {}
        }

        let mut cancelled = reservation.clone();
        cancelled.status = ReservationStatus::Cancelled;

        let mut tx = self.db.pool().begin().await?;
        let won = self
            .db
            .update_status_if_reserved(&mut tx, reservation.id, ReservationStatus::Cancelled)
            .await?;
        if !won {
            tx.rollback().await?;
            return match self.db.get(reservation.id).await?.map(|r| r.status) {
                Some(ReservationStatus::Confirmed) => Err(BookingError::AlreadyConfirmed),
                Some(ReservationStatus::Expired) => Err(BookingError::Expired),
                _ => Err(BookingError::AlreadyReleased),
            };
        }
        outbox::insert_in_tx(
            &mut tx,
            &NewOutboxEvent::booking_cancelled(&cancelled),
            self.config.outbox_max_retries,
        )
        .await?;
        tx.commit().await?;

        // CAS won: this caller owns the inventory restore.
        let reply = self.store.release(&release_args(&reservation)).await?;
        match reply.into_result() {
            Ok(restored) => {
                if let Err(e) = outbox::insert_standalone(
                    self.db.pool(),
                    &NewOutboxEvent::zone_inventory_updated(&reservation.zone_id, restored),
                    self.config.outbox_max_retries,
                )
                .await
                {
                    warn!(booking_id = %reservation.id, error = %e, "Inventory event write failed");
                }
            }
            Err(BookingError::AlreadyReleased) => {
                // Compensation already ran (e.g. failed reserve persist).
            }
            Err(e) => {
                error!(
                    booking_id = %reservation.id,
                    error = %e,
                    "Inventory restore failed after release CAS; operator reconciliation required"
                );
            }
        }

        info!(booking_id = %reservation.id, reason, "Reservation released");
        Ok(cancelled)
    }

    pub async fn get(&self, booking_id: BookingId) -> Result<Reservation, BookingError> {
        self.db
            .get(booking_id)
            .await?
            .ok_or_else(|| BookingError::NotFound(format!("booking {booking_id}")))
    }
}

pub(crate) fn release_args(reservation: &Reservation) -> ReleaseArgs {
    ReleaseArgs {
        zone: reservation.zone_id,
        user: reservation.user_id,
        booking: reservation.id,
        event: reservation.event_id,
        quantity: i64::from(reservation.quantity),
        capacity: reservation.zone_capacity,
    }
}

/// Short human-readable confirmation code.
fn confirmation_code() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_code_shape() {
        let code = confirmation_code();
        assert_eq!(code.len(), 8);
        // No ambiguous characters.
        assert!(!code.contains('O') && !code.contains('0') && !code.contains('I'));
    }

    #[test]
    fn test_release_args_mirror_reservation() {
        let now = Utc::now();
        let res = Reservation {
            id: BookingId::new_v4(),
            user_id: UserId::new_v4(),
            event_id: EventId::new_v4(),
            show_id: ShowId::new_v4(),
            zone_id: ZoneId::new_v4(),
            quantity: 3,
            unit_price: Decimal::new(5000, 2),
            total: Decimal::new(15000, 2),
            status: ReservationStatus::Reserved,
            reserved_at: now,
            expires_at: now + chrono::Duration::seconds(600),
            confirmation_code: None,
            idempotency_key: "k".into(),
            event_name: "e".into(),
            show_name: "s".into(),
            zone_name: "z".into(),
            venue: "v".into(),
            zone_capacity: 500,
        };
        let args = release_args(&res);
        assert_eq!(args.quantity, 3);
        assert_eq!(args.capacity, 500);
        assert_eq!(args.booking, res.id);
    }
}
