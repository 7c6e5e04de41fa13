//! Admission passes
//!
//! A pass is a short-TTL HS256 token proving the holder was released from
//! the virtual queue for one event. Verification is one-shot: the jti is
//! redeemed in the fast store, so one pass buys exactly one reservation.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::core_types::{EventId, UserId};
use crate::errors::BookingError;
use crate::store::FastStore;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PassClaims {
    /// User the pass is bound to
    pub sub: UserId,
    /// Event the pass is bound to
    pub event: EventId,
    /// One-shot redemption id
    pub jti: String,
    pub exp: usize,
    pub iat: usize,
}

pub struct PassIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl PassIssuer {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a pass for an admitted user.
    pub fn mint(&self, user: &UserId, event: &EventId) -> Result<String, BookingError> {
        let now = Utc::now().timestamp();
        let claims = PassClaims {
            sub: *user,
            event: *event,
            jti: uuid::Uuid::new_v4().to_string(),
            exp: (now + self.ttl.as_secs() as i64) as usize,
            iat: now as usize,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| BookingError::Internal(format!("mint pass: {e}")))
    }

    /// Check signature, expiry, and the (user, event) binding.
    pub fn verify(
        &self,
        token: &str,
        user: &UserId,
        event: &EventId,
    ) -> Result<PassClaims, BookingError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // A 2-minute pass cannot afford the default 60s leeway.
        validation.leeway = 0;

        let data = decode::<PassClaims>(token, &self.decoding, &validation).map_err(|e| {
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => BookingError::QueuePassExpired,
                _ => BookingError::QueuePassInvalid,
            }
        })?;

        if data.claims.sub != *user || data.claims.event != *event {
            return Err(BookingError::QueuePassInvalid);
        }
        Ok(data.claims)
    }

    /// Verify and burn the pass. A second redemption of the same jti is
    /// rejected even while the token itself is still unexpired.
    pub async fn verify_and_redeem(
        &self,
        token: &str,
        user: &UserId,
        event: &EventId,
        store: &dyn FastStore,
    ) -> Result<(), BookingError> {
        let claims = self.verify(token, user, event)?;
        let fresh = store.redeem_pass(&claims.jti, self.ttl).await?;
        if !fresh {
            return Err(BookingError::QueuePassInvalid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn issuer() -> PassIssuer {
        PassIssuer::new("test-secret", Duration::from_secs(120))
    }

    #[test]
    fn test_mint_and_verify() {
        let issuer = issuer();
        let (user, event) = (Uuid::new_v4(), Uuid::new_v4());
        let token = issuer.mint(&user, &event).unwrap();
        let claims = issuer.verify(&token, &user, &event).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.event, event);
    }

    #[test]
    fn test_wrong_binding_rejected() {
        let issuer = issuer();
        let (user, event) = (Uuid::new_v4(), Uuid::new_v4());
        let token = issuer.mint(&user, &event).unwrap();

        let err = issuer.verify(&token, &Uuid::new_v4(), &event).unwrap_err();
        assert_eq!(err.code(), "QUEUE_PASS_INVALID");
        let err = issuer.verify(&token, &user, &Uuid::new_v4()).unwrap_err();
        assert_eq!(err.code(), "QUEUE_PASS_INVALID");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = issuer();
        let other = PassIssuer::new("other-secret", Duration::from_secs(120));
        let (user, event) = (Uuid::new_v4(), Uuid::new_v4());
        let token = issuer.mint(&user, &event).unwrap();
        assert!(other.verify(&token, &user, &event).is_err());
    }

    #[tokio::test]
    async fn test_redeem_is_one_shot() {
        let issuer = issuer();
        let store = MemoryStore::new();
        let (user, event) = (Uuid::new_v4(), Uuid::new_v4());
        let token = issuer.mint(&user, &event).unwrap();

        issuer
            .verify_and_redeem(&token, &user, &event, &store)
            .await
            .unwrap();
        let err = issuer
            .verify_and_redeem(&token, &user, &event, &store)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUEUE_PASS_INVALID");
    }
}
