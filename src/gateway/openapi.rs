//! OpenAPI / Swagger UI documentation
//!
//! - Swagger UI: `http://localhost:8080/docs`
//! - OpenAPI JSON: `http://localhost:8080/api-docs/openapi.json`

use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

use super::types::{
    ApiError, BookingView, ConfirmRequest, HealthData, QueueJoinData, QueueJoinRequest,
    QueuePositionData, QueueStatsData, ReserveRequest,
};

/// Bearer token security scheme (HS256-signed gateway tokens).
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Rushtix Booking API",
        version = "1.0.0",
        description = "Flash-sale ticket booking: virtual queue admission, atomic zone inventory, \
                       reservation lifecycle with TTL expiry, saga-backed confirmation.",
        license(name = "MIT")
    ),
    servers(
        (url = "http://localhost:8080", description = "Development"),
    ),
    paths(
        crate::gateway::handlers::health_check,
        crate::gateway::handlers::reserve,
        crate::gateway::handlers::confirm,
        crate::gateway::handlers::release,
        crate::gateway::handlers::get_booking,
        crate::gateway::handlers::queue_join,
        crate::gateway::handlers::queue_position,
        crate::gateway::handlers::queue_position_stream,
        crate::gateway::handlers::queue_stats,
    ),
    components(
        schemas(
            ApiError,
            ReserveRequest,
            ConfirmRequest,
            BookingView,
            QueueJoinRequest,
            QueueJoinData,
            QueuePositionData,
            QueueStatsData,
            HealthData,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Bookings", description = "Reservation hot path"),
        (name = "Queue", description = "Virtual waiting room"),
        (name = "Ops", description = "Health and operations"),
    )
)]
pub struct ApiDoc;
