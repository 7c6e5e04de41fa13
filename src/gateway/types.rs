//! Gateway wire types
//!
//! Every endpoint answers with the same envelope:
//! `{"success": true, "data": {...}}` or
//! `{"success": false, "error": {"code": ..., "message": ...}}`.
//! Error codes are the stable taxonomy from [`BookingError`].

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::core_types::{BookingId, EventId, ShowId, ZoneId};
use crate::errors::BookingError;
use crate::models::Reservation;
use crate::queue::QueuePosition;

/// Unified API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// Map a domain error onto the wire: status from the taxonomy, plus
/// `Retry-After` for rate limiting.
pub fn error_response(err: &BookingError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = Json(ApiResponse::<()>::error(err.code(), err.to_string()));
    let mut response = (status, body).into_response();

    if let BookingError::TooManyRequests { retry_after_secs } = err
        && let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string())
    {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

// ============================================================
// Booking DTOs
// ============================================================

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct ReserveRequest {
    #[schema(value_type = Uuid)]
    pub event_id: EventId,
    #[schema(value_type = Uuid)]
    pub show_id: ShowId,
    #[schema(value_type = Uuid)]
    pub zone_id: ZoneId,
    /// Seats requested; per-zone quantity, no seat coordinates.
    #[validate(range(min = 1, max = 100))]
    pub quantity: i32,
    /// Echo of the catalog unit price; rejected on mismatch.
    #[schema(value_type = Option<String>, example = "75.00")]
    pub unit_price: Option<Decimal>,
    /// Admission pass; may also arrive via the X-Queue-Pass header.
    pub queue_pass: Option<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ConfirmRequest {
    /// Payment id produced by the payment flow.
    pub payment_id: Option<uuid::Uuid>,
    /// Free-form payment reference (card token, wallet id).
    pub payment_reference: Option<String>,
}

impl ConfirmRequest {
    pub fn reference(&self) -> Option<String> {
        self.payment_reference
            .clone()
            .or_else(|| self.payment_id.map(|id| id.to_string()))
    }
}

/// Booking state as returned by every booking endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BookingView {
    #[schema(value_type = Uuid)]
    pub booking_id: BookingId,
    pub status: String,
    #[schema(value_type = Uuid)]
    pub event_id: EventId,
    #[schema(value_type = Uuid)]
    pub show_id: ShowId,
    #[schema(value_type = Uuid)]
    pub zone_id: ZoneId,
    pub quantity: i32,
    #[schema(value_type = String, example = "75.00")]
    pub unit_price: Decimal,
    #[schema(value_type = String, example = "150.00")]
    pub total: Decimal,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confirmation_code: Option<String>,
    pub event_name: String,
    pub show_name: String,
    pub zone_name: String,
    pub venue: String,
    /// Present when a saga instance exists for this booking.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saga_state: Option<String>,
}

impl BookingView {
    pub fn from_reservation(res: &Reservation) -> Self {
        Self {
            booking_id: res.id,
            status: res.status.as_str().to_string(),
            event_id: res.event_id,
            show_id: res.show_id,
            zone_id: res.zone_id,
            quantity: res.quantity,
            unit_price: res.unit_price,
            total: res.total,
            reserved_at: res.reserved_at,
            expires_at: res.expires_at,
            confirmation_code: res.confirmation_code.clone(),
            event_name: res.event_name.clone(),
            show_name: res.show_name.clone(),
            zone_name: res.zone_name.clone(),
            venue: res.venue.clone(),
            saga_state: None,
        }
    }

    pub fn with_saga_state(mut self, state: Option<String>) -> Self {
        self.saga_state = state;
        self
    }
}

// ============================================================
// Queue DTOs
// ============================================================

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct QueueJoinRequest {
    #[schema(value_type = Uuid)]
    pub event_id: EventId,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QueueJoinData {
    /// 1-based place in line; 0 when already admitted.
    pub position: u64,
    pub estimated_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QueuePositionData {
    pub position: u64,
    pub is_ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_pass: Option<String>,
}

impl QueuePositionData {
    pub fn from_position(pos: &QueuePosition) -> Self {
        Self {
            position: pos.position,
            is_ready: pos.is_ready,
            queue_pass: pos.queue_pass.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QueueStatsData {
    pub waiting: u64,
    pub admitted: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthData {
    pub status: String,
    pub version: String,
    pub database: bool,
    pub fast_store: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shapes() {
        let ok = serde_json::to_value(ApiResponse::success(42)).unwrap();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["data"], 42);
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(ApiResponse::<()>::error("EXPIRED", "gone")).unwrap();
        assert_eq!(err["success"], false);
        assert_eq!(err["error"]["code"], "EXPIRED");
        assert!(err.get("data").is_none());
    }

    #[test]
    fn test_confirm_reference_fallback() {
        let req = ConfirmRequest {
            payment_id: Some(uuid::Uuid::nil()),
            payment_reference: None,
        };
        assert_eq!(
            req.reference().as_deref(),
            Some("00000000-0000-0000-0000-000000000000")
        );

        let req = ConfirmRequest {
            payment_id: None,
            payment_reference: Some("tok_visa".into()),
        };
        assert_eq!(req.reference().as_deref(), Some("tok_visa"));
    }

    #[test]
    fn test_retry_after_header() {
        let response = error_response(&BookingError::TooManyRequests { retry_after_secs: 7 });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            HeaderValue::from_static("7")
        );
    }
}
