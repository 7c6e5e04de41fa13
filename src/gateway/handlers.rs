//! Gateway handlers
//!
//! Thin layer over the orchestrator, engine, and queue service: decode,
//! authenticate (middleware), replay idempotent responses, delegate, wrap
//! in the response envelope.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
};
use futures::Stream;
use tokio::sync::broadcast;
use tracing::warn;
use validator::Validate;

use crate::core_types::{BookingId, EventId, UserId};
use crate::errors::BookingError;
use crate::idempotency::{IdempotencyLayer, StoredResponse};
use crate::queue::QueueController;
use crate::reservation::ReserveSpec;

use super::auth::Claims;
use super::state::AppState;
use super::types::{
    ApiResponse, BookingView, ConfirmRequest, HealthData, QueueJoinData, QueueJoinRequest,
    QueuePositionData, QueueStatsData, ReserveRequest, error_response,
};

// Re-export for the OpenAPI component list.
pub use super::types::ApiError;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";
const QUEUE_PASS_HEADER: &str = "x-queue-pass";

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn required_idempotency_key(headers: &HeaderMap) -> Result<String, BookingError> {
    let key = header_value(headers, IDEMPOTENCY_HEADER)
        .ok_or_else(|| BookingError::InvalidRequest("Idempotency-Key header required".into()))?;
    IdempotencyLayer::validate_key(&key)?;
    Ok(key)
}

fn replayed(stored: StoredResponse) -> Response {
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK);
    (status, Json(stored.body)).into_response()
}

/// Serialize the success envelope once so a replay is byte-equal.
async fn respond_and_record<T: serde::Serialize>(
    idempotency: &IdempotencyLayer,
    key: &str,
    status: StatusCode,
    data: T,
) -> Response {
    let body = match serde_json::to_value(ApiResponse::success(data)) {
        Ok(value) => value,
        Err(e) => return error_response(&BookingError::Internal(e.to_string())),
    };
    let stored = StoredResponse {
        status: status.as_u16(),
        body: body.clone(),
    };
    if let Err(e) = idempotency.record(key, &stored).await {
        warn!(error = %e, "Idempotency record write failed");
    }
    (status, Json(body)).into_response()
}

// ============================================================
// Booking endpoints (the hot path)
// ============================================================

/// POST /bookings/reserve
#[utoipa::path(
    post,
    path = "/bookings/reserve",
    request_body = ReserveRequest,
    responses(
        (status = 201, description = "Seats reserved", body = BookingView),
        (status = 403, description = "Queue pass missing or invalid"),
        (status = 409, description = "INSUFFICIENT_STOCK | USER_LIMIT_EXCEEDED | ZONE_NOT_FOUND"),
        (status = 429, description = "Rate limited, see Retry-After")
    ),
    security(("bearer_auth" = [])),
    tag = "Bookings"
)]
pub async fn reserve(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Json(body): Json<ReserveRequest>,
) -> Response {
    if let Err(e) = body.validate() {
        return error_response(&BookingError::InvalidRequest(e.to_string()));
    }
    let key = match required_idempotency_key(&headers) {
        Ok(key) => key,
        Err(e) => return error_response(&e),
    };

    // Replay before any side effect.
    match state.idempotency.find(&key).await {
        Ok(Some(stored)) => return replayed(stored),
        Ok(None) => {}
        Err(e) => return error_response(&e),
    }

    let queue_pass = body
        .queue_pass
        .clone()
        .or_else(|| header_value(&headers, QUEUE_PASS_HEADER));
    let spec = ReserveSpec {
        event_id: body.event_id,
        show_id: body.show_id,
        zone_id: body.zone_id,
        quantity: body.quantity,
        unit_price: body.unit_price,
    };

    match state
        .orchestrator
        .start_booking(claims.sub, spec, &key, queue_pass)
        .await
    {
        Ok(reservation) => {
            let view = BookingView::from_reservation(&reservation);
            respond_and_record(&state.idempotency, &key, StatusCode::CREATED, view).await
        }
        Err(e) => error_response(&e),
    }
}

/// POST /bookings/{id}/confirm
#[utoipa::path(
    post,
    path = "/bookings/{id}/confirm",
    request_body = ConfirmRequest,
    responses(
        (status = 200, description = "Booking confirmed", body = BookingView),
        (status = 402, description = "Payment declined, reservation released"),
        (status = 409, description = "ALREADY_CONFIRMED | EXPIRED | ALREADY_RELEASED")
    ),
    security(("bearer_auth" = [])),
    tag = "Bookings"
)]
pub async fn confirm(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<BookingId>,
    headers: HeaderMap,
    Json(body): Json<ConfirmRequest>,
) -> Response {
    let key = header_value(&headers, IDEMPOTENCY_HEADER);
    if let Some(key) = &key {
        if let Err(e) = IdempotencyLayer::validate_key(key) {
            return error_response(&e);
        }
        match state.idempotency.find(key).await {
            Ok(Some(stored)) => return replayed(stored),
            Ok(None) => {}
            Err(e) => return error_response(&e),
        }
    }

    let Some(reference) = body.reference() else {
        return error_response(&BookingError::InvalidRequest(
            "payment_id or payment_reference required".into(),
        ));
    };

    match state
        .orchestrator
        .confirm_booking(id, claims.sub, reference)
        .await
    {
        Ok(reservation) => {
            let view = BookingView::from_reservation(&reservation);
            match key {
                Some(key) => {
                    respond_and_record(&state.idempotency, &key, StatusCode::OK, view).await
                }
                None => (StatusCode::OK, Json(ApiResponse::success(view))).into_response(),
            }
        }
        Err(e) => error_response(&e),
    }
}

/// POST /bookings/{id}/release
#[utoipa::path(
    post,
    path = "/bookings/{id}/release",
    responses(
        (status = 200, description = "Reservation released, inventory restored", body = BookingView),
        (status = 409, description = "ALREADY_CONFIRMED | ALREADY_RELEASED | EXPIRED")
    ),
    security(("bearer_auth" = [])),
    tag = "Bookings"
)]
pub async fn release(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<BookingId>,
) -> Response {
    match state.orchestrator.cancel_booking(id, claims.sub).await {
        Ok(reservation) => {
            let view = BookingView::from_reservation(&reservation);
            (StatusCode::OK, Json(ApiResponse::success(view))).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// GET /bookings/{id}
#[utoipa::path(
    get,
    path = "/bookings/{id}",
    responses(
        (status = 200, description = "Current booking state", body = BookingView),
        (status = 404, description = "Unknown booking")
    ),
    security(("bearer_auth" = [])),
    tag = "Bookings"
)]
pub async fn get_booking(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<BookingId>,
) -> Response {
    let reservation = match state.engine.get(id).await {
        Ok(res) => res,
        Err(e) => return error_response(&e),
    };
    if reservation.user_id != claims.sub {
        return error_response(&BookingError::Forbidden);
    }

    let saga_state = match state.orchestrator.db().get_by_booking(id).await {
        Ok(saga) => saga.map(|s| s.state.as_str().to_string()),
        Err(e) => {
            warn!(booking_id = %id, error = %e, "Saga lookup failed");
            None
        }
    };

    let view = BookingView::from_reservation(&reservation).with_saga_state(saga_state);
    (StatusCode::OK, Json(ApiResponse::success(view))).into_response()
}

// ============================================================
// Queue endpoints
// ============================================================

/// POST /queue/join
#[utoipa::path(
    post,
    path = "/queue/join",
    request_body = QueueJoinRequest,
    responses(
        (status = 200, description = "Ticket in the waiting room", body = QueueJoinData)
    ),
    security(("bearer_auth" = [])),
    tag = "Queue"
)]
pub async fn queue_join(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Json(body): Json<QueueJoinRequest>,
) -> Response {
    // The ticket itself is the idempotency record: rejoining returns the
    // same place in line. The key is still required so retried requests
    // are well-formed.
    if let Err(e) = required_idempotency_key(&headers) {
        return error_response(&e);
    }

    match state.queue.join(&body.event_id, &claims.sub).await {
        Ok(position) => {
            let data = QueueJoinData {
                position: position.position,
                estimated_wait_secs: position.estimated_wait.as_secs(),
            };
            (StatusCode::OK, Json(ApiResponse::success(data))).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// GET /queue/position/{event_id}
#[utoipa::path(
    get,
    path = "/queue/position/{event_id}",
    responses(
        (status = 200, description = "One-shot position", body = QueuePositionData),
        (status = 404, description = "Not in this queue")
    ),
    security(("bearer_auth" = [])),
    tag = "Queue"
)]
pub async fn queue_position(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(event_id): Path<EventId>,
) -> Response {
    match state.queue.position(&event_id, &claims.sub).await {
        Ok(position) => (
            StatusCode::OK,
            Json(ApiResponse::success(QueuePositionData::from_position(
                &position,
            ))),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET /queue/stats/{event_id}
#[utoipa::path(
    get,
    path = "/queue/stats/{event_id}",
    responses((status = 200, description = "Waiting and admitted counts", body = QueueStatsData)),
    security(("bearer_auth" = [])),
    tag = "Queue"
)]
pub async fn queue_stats(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<EventId>,
) -> Response {
    match state.queue.controller(&event_id).stats().await {
        Ok((waiting, admitted)) => (
            StatusCode::OK,
            Json(ApiResponse::success(QueueStatsData { waiting, admitted })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

// ============================================================
// Queue position stream (SSE)
// ============================================================

struct PositionStream {
    controller: Arc<QueueController>,
    user: UserId,
    updates: broadcast::Receiver<crate::queue::QueueAdvanced>,
    last_position: Option<u64>,
    first: bool,
    done: bool,
}

fn position_event(data: &QueuePositionData) -> Event {
    match Event::default().event("position").json_data(data) {
        Ok(event) => event,
        Err(_) => Event::default().event("error").data("serialization failed"),
    }
}

fn error_event(err: &BookingError) -> Event {
    match Event::default()
        .event("error")
        .json_data(ApiError {
            code: err.code().to_string(),
            message: err.to_string(),
        }) {
        Ok(event) => event,
        Err(_) => Event::default().event("error").data("stream error"),
    }
}

/// GET /queue/position/{event_id}/stream
///
/// Emits a `position` event whenever the user's position changes and
/// exactly one terminal event carrying the admission pass. The ticket in
/// the fast store is the durable record; a dropped connection loses
/// nothing but this view.
#[utoipa::path(
    get,
    path = "/queue/position/{event_id}/stream",
    responses((status = 200, description = "Server-sent events: position / error")),
    security(("bearer_auth" = [])),
    tag = "Queue"
)]
pub async fn queue_position_stream(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<Claims>,
    Path(event_id): Path<EventId>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let controller = state.queue.controller(&event_id);
    let stream_state = PositionStream {
        updates: controller.subscribe(),
        controller,
        user: claims.sub,
        last_position: None,
        first: true,
        done: false,
    };

    let stream = futures::stream::unfold(stream_state, |mut st| async move {
        loop {
            if st.done {
                return None;
            }

            if !st.first {
                match st.updates.recv().await {
                    Ok(_) => {}
                    // Dropped position updates are fine; re-read the
                    // current state below.
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        st.done = true;
                        let event = error_event(&BookingError::NotFound("queue closed".into()));
                        return Some((Ok::<_, Infallible>(event), st));
                    }
                }
            }
            st.first = false;

            match st.controller.position(&st.user).await {
                Ok(position) => {
                    let data = QueuePositionData::from_position(&position);
                    if position.is_ready {
                        // Terminal event carries the pass; never dropped.
                        st.done = true;
                        return Some((Ok(position_event(&data)), st));
                    }
                    if st.last_position == Some(data.position) {
                        continue; // unchanged, wait for the next signal
                    }
                    st.last_position = Some(data.position);
                    return Some((Ok(position_event(&data)), st));
                }
                Err(e) => {
                    st.done = true;
                    return Some((Ok(error_event(&e)), st));
                }
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============================================================
// Health
// ============================================================

/// GET /healthz
#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Dependency health", body = HealthData)),
    tag = "Ops"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Response {
    let database = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let fast_store = state
        .store
        .zone_available(&uuid::Uuid::nil())
        .await
        .is_ok();

    let data = HealthData {
        status: if database && fast_store {
            "ok".into()
        } else {
            "degraded".into()
        },
        version: format!("{} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH")),
        database,
        fast_store,
    };
    (StatusCode::OK, Json(ApiResponse::success(data))).into_response()
}
