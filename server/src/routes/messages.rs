//! Channel message history.
//!
//! DESIGN
//! ======
//! Cursor pagination over `created_at`, newest first. The `before` cursor is
//! a millisecond epoch timestamp taken from the oldest message of the
//! previous page, so clients walk backwards through history without offsets.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use envelope::{ChatMessage, Mention};
use serde::Deserialize;
use sqlx::Row;
use tracing::error;
use uuid::Uuid;

use crate::routes::auth::AuthUser;
use crate::services::membership;
use crate::state::AppState;

const DEFAULT_PAGE_LIMIT: i64 = 50;
const MAX_PAGE_LIMIT: i64 = 200;

#[derive(Deserialize)]
pub struct HistoryParams {
    limit: Option<i64>,
    /// Millisecond epoch cursor; only messages strictly older are returned.
    before: Option<i64>,
}

/// GET /api/channels/{id}/messages — recent history for channel members.
pub async fn history(
    State(state): State<AppState>,
    caller: AuthUser,
    Path(channel_id): Path<Uuid>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<ChatMessage>>, (StatusCode, String)> {
    let is_member = membership::is_channel_member(&state.pool, channel_id, caller.user_id)
        .await
        .map_err(|e| {
            error!(error = %e, %channel_id, "membership check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "membership check failed".to_owned())
        })?;
    if !is_member {
        return Err((StatusCode::FORBIDDEN, "not a channel member".to_owned()));
    }

    let limit = params.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT);

    let rows = match params.before {
        Some(before_ms) => {
            sqlx::query(
                r"SELECT id, channel_id, author_id, content, reply_to, mentions,
                         (EXTRACT(EPOCH FROM created_at) * 1000)::BIGINT AS created_ms
                  FROM messages
                  WHERE channel_id = $1
                    AND created_at < to_timestamp($2::DOUBLE PRECISION / 1000.0)
                  ORDER BY created_at DESC
                  LIMIT $3",
            )
            .bind(channel_id)
            .bind(before_ms)
            .bind(limit)
            .fetch_all(&state.pool)
            .await
        }
        None => {
            sqlx::query(
                r"SELECT id, channel_id, author_id, content, reply_to, mentions,
                         (EXTRACT(EPOCH FROM created_at) * 1000)::BIGINT AS created_ms
                  FROM messages
                  WHERE channel_id = $1
                  ORDER BY created_at DESC
                  LIMIT $2",
            )
            .bind(channel_id)
            .bind(limit)
            .fetch_all(&state.pool)
            .await
        }
    }
    .map_err(|e| {
        error!(error = %e, %channel_id, "history query failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "history query failed".to_owned())
    })?;

    let messages = rows
        .into_iter()
        .map(|row| {
            let mentions: Vec<Mention> =
                serde_json::from_value(row.get("mentions")).unwrap_or_default();
            ChatMessage {
                id: row.get("id"),
                channel_id: row.get("channel_id"),
                author_id: row.get("author_id"),
                content: row.get("content"),
                reply_to: row.get("reply_to"),
                mentions,
                created_ms: row.get("created_ms"),
            }
        })
        .collect();

    Ok(Json(messages))
}

#[cfg(test)]
#[path = "messages_test.rs"]
mod tests;
