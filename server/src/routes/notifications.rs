//! Notification poll + read-state REST surface.
//!
//! DESIGN
//! ======
//! The websocket is the delivery fast path; these endpoints are the durable
//! fallback. A client that reconnects (or never connects) polls its inbox
//! here, and read-state changes only flow through here, never the socket.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use envelope::{Notification, NotificationStatus};
use serde::Deserialize;
use tracing::error;
use uuid::Uuid;

use crate::routes::auth::AuthUser;
use crate::services::notify;
use crate::state::AppState;

const DEFAULT_PAGE_LIMIT: i64 = 50;
const MAX_PAGE_LIMIT: i64 = 200;

#[derive(Deserialize)]
pub struct ListParams {
    status: Option<String>,
    limit: Option<i64>,
}

fn clamp_limit(requested: Option<i64>) -> i64 {
    requested.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

/// GET /api/notifications — the caller's inbox, newest first.
pub async fn list(
    State(state): State<AppState>,
    caller: AuthUser,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Notification>>, (StatusCode, String)> {
    let status = match params.status.as_deref() {
        None => None,
        Some(raw) => Some(NotificationStatus::from_str(raw).ok_or_else(|| {
            (StatusCode::BAD_REQUEST, format!("unknown status filter: {raw}"))
        })?),
    };

    let notifications =
        notify::list_notifications(&state.pool, caller.user_id, status, clamp_limit(params.limit))
            .await
            .map_err(|e| {
                error!(error = %e, user_id = %caller.user_id, "notification list failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "notification list failed".to_owned())
            })?;

    Ok(Json(notifications))
}

#[derive(Deserialize)]
pub struct MarkReadBody {
    status: String,
}

/// PATCH /api/notifications/{id} — flip one notification to read.
pub async fn mark_read(
    State(state): State<AppState>,
    caller: AuthUser,
    Path(notification_id): Path<Uuid>,
    Json(body): Json<MarkReadBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if NotificationStatus::from_str(&body.status) != Some(NotificationStatus::Read) {
        return Err((StatusCode::BAD_REQUEST, format!("unsupported status: {}", body.status)));
    }

    let updated = notify::mark_read(&state.pool, caller.user_id, notification_id)
        .await
        .map_err(|e| {
            error!(error = %e, %notification_id, "mark read failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "mark read failed".to_owned())
        })?;

    Ok(Json(serde_json::json!({ "updated": updated })))
}

/// POST /api/notifications/mark-all-read — bulk flip for the caller.
pub async fn mark_all_read(
    State(state): State<AppState>,
    caller: AuthUser,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let marked = notify::mark_all_read(&state.pool, caller.user_id).await.map_err(|e| {
        error!(error = %e, user_id = %caller.user_id, "mark all read failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "mark all read failed".to_owned())
    })?;

    Ok(Json(serde_json::json!({ "marked": marked })))
}

#[cfg(test)]
#[path = "notifications_test.rs"]
mod tests;
