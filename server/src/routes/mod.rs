//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! This module binds the websocket endpoint and the REST poll surface under
//! a single Axum router. The websocket carries live delivery; REST exists so
//! clients without an open socket can still read notifications and history.

pub mod auth;
pub mod messages;
pub mod notifications;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Full application router: websocket + REST + health.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/ws", get(ws::handle_ws))
        .route("/api/notifications", get(notifications::list))
        .route("/api/notifications/mark-all-read", post(notifications::mark_all_read))
        .route("/api/notifications/{id}", patch(notifications::mark_read))
        .route("/api/channels/{id}/messages", get(messages::history))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
