//! Booking error taxonomy
//!
//! The error codes returned here are stable over the wire. The atomic
//! inventory script's rejection codes are the canonical domain-conflict
//! vocabulary and are surfaced verbatim; no layer above invents new codes
//! for the same condition.

use thiserror::Error;

/// Booking platform errors
///
/// Three families, matching client retry semantics:
/// - client input: never retried by a correct client
/// - domain conflict: not retried; the client navigates to a new flow
/// - transient: retried with backoff and the same idempotency key
#[derive(Error, Debug, Clone)]
pub enum BookingError {
    // === Client input ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Quantity must be greater than zero")]
    InvalidQuantity,

    #[error("Not authenticated")]
    Unauthorized,

    #[error("Not allowed")]
    Forbidden,

    #[error("Not found: {0}")]
    NotFound(String),

    // === Domain conflict ===
    #[error("Insufficient stock (available: {0})")]
    InsufficientStock(i64),

    #[error("Per-user ticket limit exceeded (currently held: {0})")]
    UserLimitExceeded(i64),

    #[error("Zone not initialized for sale")]
    ZoneNotFound,

    #[error("Booking already confirmed")]
    AlreadyConfirmed,

    #[error("Booking already released")]
    AlreadyReleased,

    #[error("Reservation expired")]
    Expired,

    #[error("Queue admission pass required")]
    QueuePassRequired,

    #[error("Queue admission pass invalid")]
    QueuePassInvalid,

    #[error("Queue admission pass expired")]
    QueuePassExpired,

    #[error("Payment declined: {0}")]
    PaymentDeclined(String),

    // === Transient ===
    #[error("Too many requests")]
    TooManyRequests { retry_after_secs: u64 },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl BookingError {
    /// Stable wire code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            BookingError::InvalidRequest(_) => "INVALID_REQUEST",
            BookingError::InvalidQuantity => "INVALID_QUANTITY",
            BookingError::Unauthorized => "UNAUTHORIZED",
            BookingError::Forbidden => "FORBIDDEN",
            BookingError::NotFound(_) => "NOT_FOUND",
            BookingError::InsufficientStock(_) => "INSUFFICIENT_STOCK",
            BookingError::UserLimitExceeded(_) => "USER_LIMIT_EXCEEDED",
            BookingError::ZoneNotFound => "ZONE_NOT_FOUND",
            BookingError::AlreadyConfirmed => "ALREADY_CONFIRMED",
            BookingError::AlreadyReleased => "ALREADY_RELEASED",
            BookingError::Expired => "EXPIRED",
            BookingError::QueuePassRequired => "QUEUE_PASS_REQUIRED",
            BookingError::QueuePassInvalid => "QUEUE_PASS_INVALID",
            BookingError::QueuePassExpired => "QUEUE_PASS_EXPIRED",
            BookingError::PaymentDeclined(_) => "PAYMENT_FAILED",
            BookingError::TooManyRequests { .. } => "TOO_MANY_REQUESTS",
            BookingError::Internal(_) => "INTERNAL_ERROR",
            BookingError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    /// HTTP status suggestion for the gateway.
    pub fn http_status(&self) -> u16 {
        match self {
            BookingError::InvalidRequest(_) | BookingError::InvalidQuantity => 400,
            BookingError::Unauthorized => 401,
            BookingError::Forbidden
            | BookingError::QueuePassRequired
            | BookingError::QueuePassInvalid
            | BookingError::QueuePassExpired => 403,
            BookingError::NotFound(_) => 404,
            BookingError::InsufficientStock(_)
            | BookingError::UserLimitExceeded(_)
            | BookingError::ZoneNotFound
            | BookingError::AlreadyConfirmed
            | BookingError::AlreadyReleased
            | BookingError::Expired => 409,
            BookingError::PaymentDeclined(_) => 402,
            BookingError::TooManyRequests { .. } => 429,
            BookingError::Internal(_) => 500,
            BookingError::ServiceUnavailable(_) => 503,
        }
    }

    /// Whether a client should retry with the same idempotency key.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BookingError::TooManyRequests { .. }
                | BookingError::Internal(_)
                | BookingError::ServiceUnavailable(_)
        )
    }

    /// Map an atomic-script rejection code back to the taxonomy.
    ///
    /// The script is the source of these codes; unknown codes indicate a
    /// script/engine version skew and surface as internal errors.
    pub fn from_script_code(code: &str, detail: i64) -> Self {
        match code {
            "INVALID_QUANTITY" => BookingError::InvalidQuantity,
            "ZONE_NOT_FOUND" => BookingError::ZoneNotFound,
            "USER_LIMIT_EXCEEDED" => BookingError::UserLimitExceeded(detail),
            "INSUFFICIENT_STOCK" => BookingError::InsufficientStock(detail),
            "ALREADY_RELEASED" => BookingError::AlreadyReleased,
            other => BookingError::Internal(format!("unknown script code: {other}")),
        }
    }
}

impl From<sqlx::Error> for BookingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => BookingError::NotFound("row".into()),
            other => BookingError::Internal(format!("database error: {other}")),
        }
    }
}

impl From<redis::RedisError> for BookingError {
    fn from(e: redis::RedisError) -> Self {
        BookingError::ServiceUnavailable(format!("fast store: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_codes_round_trip() {
        assert_eq!(
            BookingError::from_script_code("INSUFFICIENT_STOCK", 3).code(),
            "INSUFFICIENT_STOCK"
        );
        assert_eq!(
            BookingError::from_script_code("USER_LIMIT_EXCEEDED", 4).code(),
            "USER_LIMIT_EXCEEDED"
        );
        assert_eq!(
            BookingError::from_script_code("ZONE_NOT_FOUND", 0).code(),
            "ZONE_NOT_FOUND"
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(BookingError::InsufficientStock(0).http_status(), 409);
        assert_eq!(BookingError::Unauthorized.http_status(), 401);
        assert_eq!(BookingError::QueuePassRequired.http_status(), 403);
        assert_eq!(
            BookingError::TooManyRequests { retry_after_secs: 1 }.http_status(),
            429
        );
        assert_eq!(BookingError::Internal("x".into()).http_status(), 500);
    }

    #[test]
    fn test_transient_classification() {
        assert!(BookingError::ServiceUnavailable("down".into()).is_transient());
        assert!(!BookingError::InsufficientStock(0).is_transient());
        assert!(!BookingError::InvalidQuantity.is_transient());
    }

    #[test]
    fn test_detail_is_carried() {
        match BookingError::from_script_code("USER_LIMIT_EXCEEDED", 4) {
            BookingError::UserLimitExceeded(held) => assert_eq!(held, 4),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
