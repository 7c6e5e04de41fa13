//! Per-event queue controller
//!
//! Owns the admission cycle for one event and the broadcast channel its
//! position streams listen on. The fast store holds the durable state
//! (sorted-set queue + ticket hashes); the controller is the single writer
//! advancing admission for its event.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use crate::core_types::{EventId, UserId};
use crate::errors::BookingError;
use crate::store::{FastStore, QueueTicket, TicketStatus};

use super::pass::PassIssuer;

/// Broadcast signal: queue state changed, streams re-read their position.
/// Position updates may be dropped under lag (drop-oldest); the terminal
/// pass lives in the durable ticket, so it is never lost.
#[derive(Debug, Clone, Copy)]
pub struct QueueAdvanced;

/// Per-subscriber buffer. Small on purpose; a lagging stream just re-reads.
const UPDATE_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub batch_size: u64,
    pub admission_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            admission_interval: Duration::from_secs(1),
        }
    }
}

/// Reply to a join or position query.
#[derive(Debug, Clone)]
pub struct QueuePosition {
    /// 1-based place in line; 0 when admitted.
    pub position: u64,
    pub is_ready: bool,
    pub queue_pass: Option<String>,
    pub estimated_wait: Duration,
}

pub struct QueueController {
    event_id: EventId,
    store: Arc<dyn FastStore>,
    passes: Arc<PassIssuer>,
    config: QueueConfig,
    updates: broadcast::Sender<QueueAdvanced>,
    closed: watch::Sender<bool>,
}

impl QueueController {
    pub fn new(
        event_id: EventId,
        store: Arc<dyn FastStore>,
        passes: Arc<PassIssuer>,
        config: QueueConfig,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            event_id,
            store,
            passes,
            config,
            updates,
            closed,
        })
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueAdvanced> {
        self.updates.subscribe()
    }

    fn estimate_wait(&self, position: u64) -> Duration {
        if position == 0 {
            return Duration::ZERO;
        }
        let waves = position.div_ceil(self.config.batch_size.max(1));
        self.config.admission_interval * waves as u32
    }

    /// Join the waiting room. Idempotent per (user, event): a rejoin
    /// returns the existing ticket unchanged.
    pub async fn join(&self, user: &UserId) -> Result<QueuePosition, BookingError> {
        if let Some(ticket) = self.store.ticket_get(&self.event_id, user).await? {
            return self.position_of(user, &ticket).await;
        }

        let joined_at_ms = Utc::now().timestamp_millis();
        let position = self
            .store
            .queue_join(&self.event_id, user, joined_at_ms)
            .await?;
        let ticket = QueueTicket {
            user_id: *user,
            status: TicketStatus::Waiting,
            joined_at_ms,
            pass: None,
        };
        self.store.ticket_save(&self.event_id, &ticket).await?;

        debug!(event_id = %self.event_id, user_id = %user, position, "User joined queue");
        Ok(QueuePosition {
            position,
            is_ready: false,
            queue_pass: None,
            estimated_wait: self.estimate_wait(position),
        })
    }

    /// One-shot position lookup.
    pub async fn position(&self, user: &UserId) -> Result<QueuePosition, BookingError> {
        let ticket = self
            .store
            .ticket_get(&self.event_id, user)
            .await?
            .ok_or_else(|| BookingError::NotFound("queue ticket".into()))?;
        self.position_of(user, &ticket).await
    }

    async fn position_of(
        &self,
        user: &UserId,
        ticket: &QueueTicket,
    ) -> Result<QueuePosition, BookingError> {
        if ticket.status == TicketStatus::Admitted {
            return Ok(QueuePosition {
                position: 0,
                is_ready: true,
                queue_pass: ticket.pass.clone(),
                estimated_wait: Duration::ZERO,
            });
        }
        // Between pop and ticket rewrite a user is briefly in neither
        // structure; report the head of the line rather than erroring.
        let position = self
            .store
            .queue_position(&self.event_id, user)
            .await?
            .unwrap_or(1);
        Ok(QueuePosition {
            position,
            is_ready: false,
            queue_pass: None,
            estimated_wait: self.estimate_wait(position),
        })
    }

    /// Admit the next batch: pop from the head, mint passes, flip tickets,
    /// and wake the streams.
    pub async fn admit_batch(&self) -> Result<usize, BookingError> {
        let users = self
            .store
            .queue_pop_min(&self.event_id, self.config.batch_size)
            .await?;
        if users.is_empty() {
            return Ok(0);
        }

        for user in &users {
            let pass = self.passes.mint(user, &self.event_id)?;
            let existing = self.store.ticket_get(&self.event_id, user).await?;
            let ticket = QueueTicket {
                user_id: *user,
                status: TicketStatus::Admitted,
                joined_at_ms: existing.map(|t| t.joined_at_ms).unwrap_or_default(),
                pass: Some(pass),
            };
            self.store.ticket_save(&self.event_id, &ticket).await?;
        }
        self.store
            .incr_admitted(&self.event_id, users.len() as u64)
            .await?;

        // Nobody listening is fine; tickets hold the durable state.
        let _ = self.updates.send(QueueAdvanced);

        info!(
            event_id = %self.event_id,
            admitted = users.len(),
            "Admission batch processed"
        );
        Ok(users.len())
    }

    /// Admission cycle. One controller instance per event is the single
    /// writer of that event's admission state.
    pub async fn run_admission(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut closed = self.closed.subscribe();
        info!(
            event_id = %self.event_id,
            batch = self.config.batch_size,
            interval_ms = self.config.admission_interval.as_millis() as u64,
            "Starting admission cycle"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.admission_interval) => {}
                _ = shutdown.changed() => break,
                _ = closed.changed() => break,
            }

            if let Err(e) = self.admit_batch().await {
                error!(event_id = %self.event_id, error = %e, "Admission batch failed");
            }
        }
        info!(event_id = %self.event_id, "Admission cycle stopped");
    }

    /// Stop the admission cycle and drop all queue state for this event.
    pub async fn close(&self) -> Result<(), BookingError> {
        let _ = self.closed.send(true);
        let _ = self.updates.send(QueueAdvanced);
        self.store.clear_queue(&self.event_id).await
    }

    /// Waiting and admitted counts for the ops surface.
    pub async fn stats(&self) -> Result<(u64, u64), BookingError> {
        let waiting = self.store.queue_len(&self.event_id).await?;
        let admitted = self.store.admitted_count(&self.event_id).await?;
        Ok((waiting, admitted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn controller(batch: u64) -> Arc<QueueController> {
        QueueController::new(
            Uuid::new_v4(),
            Arc::new(MemoryStore::new()),
            Arc::new(PassIssuer::new("secret", Duration::from_secs(120))),
            QueueConfig {
                batch_size: batch,
                admission_interval: Duration::from_secs(2),
            },
        )
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let controller = controller(10);
        let user = Uuid::new_v4();
        let first = controller.join(&user).await.unwrap();
        let second = controller.join(&user).await.unwrap();
        assert_eq!(first.position, second.position);
        assert_eq!(first.position, 1);
    }

    #[tokio::test]
    async fn test_estimated_wait_scales_with_position() {
        let controller = controller(2);
        let mut last = Duration::ZERO;
        for i in 0..6 {
            let pos = controller.join(&Uuid::new_v4()).await.unwrap();
            assert_eq!(pos.position, i + 1);
            assert!(pos.estimated_wait >= last);
            last = pos.estimated_wait;
        }
        // Position 5..6 is the third wave of two: 3 * 2s.
        assert_eq!(last, Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_admission_flips_tickets_in_fifo_order() {
        let controller = controller(2);
        let users: Vec<_> = (0..5).map(|_| Uuid::new_v4()).collect();
        for user in &users {
            controller.join(user).await.unwrap();
        }

        assert_eq!(controller.admit_batch().await.unwrap(), 2);

        let head = controller.position(&users[0]).await.unwrap();
        assert!(head.is_ready);
        assert!(head.queue_pass.is_some());

        let third = controller.position(&users[2]).await.unwrap();
        assert!(!third.is_ready);
        assert_eq!(third.position, 1); // moved up after the first wave

        let (waiting, admitted) = controller.stats().await.unwrap();
        assert_eq!(waiting, 3);
        assert_eq!(admitted, 2);
    }

    #[tokio::test]
    async fn test_admitted_pass_verifies_against_issuer() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let passes = Arc::new(PassIssuer::new("secret", Duration::from_secs(120)));
        let event = Uuid::new_v4();
        let controller = QueueController::new(
            event,
            store.clone(),
            passes.clone(),
            QueueConfig::default(),
        );

        let user = Uuid::new_v4();
        controller.join(&user).await.unwrap();
        controller.admit_batch().await.unwrap();

        let pos = controller.position(&user).await.unwrap();
        let token = pos.queue_pass.unwrap();
        passes
            .verify_and_redeem(&token, &user, &event, store.as_ref())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_wakes_subscribers() {
        let controller = controller(10);
        let mut rx = controller.subscribe();
        controller.join(&Uuid::new_v4()).await.unwrap();
        controller.admit_batch().await.unwrap();
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_clears_state() {
        let controller = controller(10);
        let user = Uuid::new_v4();
        controller.join(&user).await.unwrap();
        controller.close().await.unwrap();
        let (waiting, admitted) = controller.stats().await.unwrap();
        assert_eq!((waiting, admitted), (0, 0));
    }
}
