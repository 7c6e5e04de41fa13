//! Idempotency layer
//!
//! Every mutating hot-path endpoint requires a client-supplied
//! `Idempotency-Key`. The first completed response is stored in the fast
//! store for a bounded window; a retry with the same key replays the stored
//! bytes with no side effects, so the two responses are byte-equal.
//!
//! The same key is persisted as the reservation's unique
//! `idempotency_key` column, deduplicating at the data layer as well.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::BookingError;
use crate::store::FastStore;

const MAX_KEY_LEN: usize = 255;

/// A captured response, replayed verbatim on retry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

pub struct IdempotencyLayer {
    store: Arc<dyn FastStore>,
    ttl: Duration,
}

impl IdempotencyLayer {
    pub fn new(store: Arc<dyn FastStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Reject keys that cannot serve as stable identifiers.
    pub fn validate_key(key: &str) -> Result<(), BookingError> {
        if key.trim().is_empty() || key.len() > MAX_KEY_LEN {
            return Err(BookingError::InvalidRequest(
                "Idempotency-Key must be 1..=255 characters".into(),
            ));
        }
        Ok(())
    }

    /// Look up a previously stored response for this key.
    pub async fn find(&self, key: &str) -> Result<Option<StoredResponse>, BookingError> {
        match self.store.idem_get(key).await? {
            None => Ok(None),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(stored) => Ok(Some(stored)),
                Err(e) => {
                    // A corrupt entry must not wedge the key forever; treat
                    // as a miss and let the data layer deduplicate.
                    tracing::warn!(key, error = %e, "Dropping unreadable idempotency record");
                    Ok(None)
                }
            },
        }
    }

    /// Record the first response for this key. Losing a concurrent race is
    /// fine: the winner's record is the one future retries replay.
    pub async fn record(&self, key: &str, response: &StoredResponse) -> Result<(), BookingError> {
        let raw = serde_json::to_string(response)
            .map_err(|e| BookingError::Internal(format!("serialize response: {e}")))?;
        let stored = self.store.idem_put(key, &raw, self.ttl).await?;
        if !stored {
            tracing::debug!(key, "Idempotency record already present, keeping first");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn layer() -> IdempotencyLayer {
        IdempotencyLayer::new(Arc::new(MemoryStore::new()), Duration::from_secs(60))
    }

    #[test]
    fn test_key_validation() {
        assert!(IdempotencyLayer::validate_key("abc-123").is_ok());
        assert!(IdempotencyLayer::validate_key("").is_err());
        assert!(IdempotencyLayer::validate_key(&"x".repeat(256)).is_err());
    }

    #[tokio::test]
    async fn test_first_response_wins() {
        let layer = layer();
        let first = StoredResponse {
            status: 201,
            body: serde_json::json!({"booking_id": "b1"}),
        };
        let second = StoredResponse {
            status: 201,
            body: serde_json::json!({"booking_id": "b2"}),
        };

        layer.record("k", &first).await.unwrap();
        layer.record("k", &second).await.unwrap();

        assert_eq!(layer.find("k").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_miss_returns_none() {
        assert_eq!(layer().find("nope").await.unwrap(), None);
    }
}
