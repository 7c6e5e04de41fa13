//! HTTP gateway
//!
//! The sole ingress. Routes by path prefix, verifies bearer tokens,
//! enforces the per-IP admission limiter, and forwards verified identity
//! to handlers via request extensions.

pub mod auth;
pub mod handlers;
pub mod openapi;
pub mod rate_limit;
pub mod state;
pub mod types;

pub use auth::{AuthVerifier, Claims};
pub use rate_limit::RateLimiter;
pub use state::AppState;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Build the full router. Split out from [`run_server`] so tests can drive
/// it with `tower::ServiceExt::oneshot`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let booking_routes = Router::new()
        .route("/reserve", post(handlers::reserve))
        .route("/{id}/confirm", post(handlers::confirm))
        .route("/{id}/release", post(handlers::release))
        .route("/{id}", get(handlers::get_booking));

    let queue_routes = Router::new()
        .route("/join", post(handlers::queue_join))
        .route("/position/{event_id}", get(handlers::queue_position))
        .route(
            "/position/{event_id}/stream",
            get(handlers::queue_position_stream),
        )
        .route("/stats/{event_id}", get(handlers::queue_stats));

    let protected = Router::new()
        .nest("/bookings", booking_routes)
        .nest("/queue", queue_routes)
        .layer(from_fn_with_state(state.clone(), auth::jwt_auth_middleware))
        .layer(from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_middleware,
        ));

    Router::new()
        .route("/healthz", get(handlers::health_check))
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
}

/// Bind and serve until the shutdown channel flips.
pub async fn run_server(
    state: Arc<AppState>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Gateway listening on http://{addr}");
    tracing::info!("API docs: http://{addr}/docs");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await?;

    Ok(())
}
