//! Virtual queue (admission control)
//!
//! Bounds the instantaneous pressure on the reservation engine by admitting
//! users in FIFO waves. The queue is a waiting room, not a latency-critical
//! path: a disconnected client keeps its place because the fast store holds
//! the durable ticket; the SSE stream is only a view.
//!
//! Controllers are created per event on first join and torn down when the
//! sale window closes; there is no process-wide mutable map without a
//! cleanup path.

pub mod controller;
pub mod pass;

pub use controller::{QueueAdvanced, QueueConfig, QueueController, QueuePosition};
pub use pass::{PassClaims, PassIssuer};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

use crate::core_types::{EventId, UserId};
use crate::errors::BookingError;
use crate::store::FastStore;

/// Registry of per-event controllers.
pub struct QueueService {
    store: Arc<dyn FastStore>,
    passes: Arc<PassIssuer>,
    config: QueueConfig,
    controllers: DashMap<EventId, Arc<QueueController>>,
    shutdown: watch::Receiver<bool>,
}

impl QueueService {
    pub fn new(
        store: Arc<dyn FastStore>,
        passes: Arc<PassIssuer>,
        config: QueueConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            passes,
            config,
            controllers: DashMap::new(),
            shutdown,
        }
    }

    /// Controller for an event, created (and its admission cycle spawned)
    /// on first use.
    pub fn controller(&self, event: &EventId) -> Arc<QueueController> {
        self.controllers
            .entry(*event)
            .or_insert_with(|| {
                let controller = QueueController::new(
                    *event,
                    self.store.clone(),
                    self.passes.clone(),
                    self.config.clone(),
                );
                tokio::spawn(controller.clone().run_admission(self.shutdown.clone()));
                controller
            })
            .clone()
    }

    /// Controller for an event only if one is already running.
    pub fn existing(&self, event: &EventId) -> Option<Arc<QueueController>> {
        self.controllers.get(event).map(|c| c.clone())
    }

    pub async fn join(&self, event: &EventId, user: &UserId) -> Result<QueuePosition, BookingError> {
        self.controller(event).join(user).await
    }

    pub async fn position(
        &self,
        event: &EventId,
        user: &UserId,
    ) -> Result<QueuePosition, BookingError> {
        match self.existing(event) {
            Some(controller) => controller.position(user).await,
            None => Err(BookingError::NotFound("queue ticket".into())),
        }
    }

    /// Tear down an event's queue when its sale window closes.
    pub async fn close_event(&self, event: &EventId) -> Result<(), BookingError> {
        if let Some((_, controller)) = self.controllers.remove(event) {
            controller.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use uuid::Uuid;

    fn service() -> QueueService {
        let (_tx, rx) = watch::channel(false);
        // Leak the sender so the shutdown channel stays open for the test.
        std::mem::forget(_tx);
        QueueService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(PassIssuer::new("secret", Duration::from_secs(120))),
            QueueConfig {
                batch_size: 2,
                admission_interval: Duration::from_secs(3600),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_controller_created_on_first_join() {
        let service = service();
        let event = Uuid::new_v4();
        assert!(service.existing(&event).is_none());
        service.join(&event, &Uuid::new_v4()).await.unwrap();
        assert!(service.existing(&event).is_some());
    }

    #[tokio::test]
    async fn test_position_without_ticket_is_not_found() {
        let service = service();
        let err = service
            .position(&Uuid::new_v4(), &Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_close_event_removes_controller() {
        let service = service();
        let event = Uuid::new_v4();
        service.join(&event, &Uuid::new_v4()).await.unwrap();
        service.close_event(&event).await.unwrap();
        assert!(service.existing(&event).is_none());
    }
}
