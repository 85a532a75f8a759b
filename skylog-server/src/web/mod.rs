//! Web server: axum REST API for the live view and flight history.
//!
//! Shared state holds the DB path (each handler opens its own connection)
//! and, when serving alongside a live session, a handle for feeding it.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::runner::SessionHandle;

pub mod routes;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub db_path: String,
    pub session: Option<SessionHandle>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/live", get(routes::api_live))
        .route("/api/flights", get(routes::api_flights))
        .route("/api/flights/:id", get(routes::api_flight_detail))
        .route("/api/alerts", get(routes::api_alerts))
        .route("/api/stats", get(routes::api_stats))
        // Session input, only when a runner is attached
        .route("/api/session/point", post(routes::api_session_point))
        .route("/api/session/start", post(routes::api_session_start))
        .route("/api/session/cancel", post(routes::api_session_cancel))
        .with_state(state)
        .layer(cors)
}

/// Start the web server and run until it fails.
pub async fn serve(
    db_path: String,
    session: Option<SessionHandle>,
    host: &str,
    port: u16,
) -> std::io::Result<()> {
    let state = Arc::new(AppState { db_path, session });
    let app = build_router(state);
    let addr = format!("{host}:{port}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("skylog live view on http://{addr}");
    axum::serve(listener, app).await
}
