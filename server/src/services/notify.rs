//! Notification dispatcher — durable first, live push second.
//!
//! DESIGN
//! ======
//! Every dispatch inserts an unread row before any live delivery. The insert
//! is the source of truth: if it fails the dispatch fails and nothing is
//! pushed. The live push is best-effort and only attempted for recipients
//! with a registered connection; an offline recipient simply finds the row
//! on their next poll. Bulk dispatch is all-settled: one failing recipient
//! never aborts the rest, callers get a per-recipient tally instead.

use envelope::{Notification, NotificationKind, NotificationStatus, Outbound};
use futures::future::join_all;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::services::presence;
use crate::state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("unknown notification kind or status {0:?} in stored row")]
    InvalidKind(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for NotifyError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidKind(_) => "E_INVALID_KIND",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Outcome tally of a bulk dispatch. Failures are logged, never escalated.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub successful: usize,
    pub failed: usize,
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Persist an unread notification for `recipient`, then push it live if the
/// recipient holds a connection.
///
/// # Errors
///
/// `Database` when the durable insert fails; the live push never errors.
pub async fn dispatch(
    state: &AppState,
    recipient: Uuid,
    kind: NotificationKind,
    title: &str,
    body: &str,
    payload: Option<serde_json::Value>,
    sender_name: Option<String>,
) -> Result<Notification, NotifyError> {
    let id = Uuid::new_v4();
    let created_ms: i64 = sqlx::query_scalar(
        r"INSERT INTO notifications (id, recipient_id, kind, title, body, status, payload, sender_name)
          VALUES ($1, $2, $3, $4, $5, 'unread', $6, $7)
          RETURNING (EXTRACT(EPOCH FROM created_at) * 1000)::BIGINT",
    )
    .bind(id)
    .bind(recipient)
    .bind(kind.as_str())
    .bind(title)
    .bind(body)
    .bind(&payload)
    .bind(&sender_name)
    .fetch_one(&state.pool)
    .await?;

    let notification = Notification {
        id,
        recipient_id: recipient,
        kind,
        title: title.to_owned(),
        body: body.to_owned(),
        status: NotificationStatus::Unread,
        payload,
        sender_name,
        created_ms,
    };
    info!(notification_id = %id, %recipient, kind = kind.as_str(), "notification persisted");

    if state.registry.is_online(recipient).await {
        let dead = state
            .registry
            .send_to_user(recipient, Outbound::Notification(notification.clone()))
            .await;
        presence::drop_dead_connections(state, dead.into_iter().collect()).await;
    }

    Ok(notification)
}

/// Dispatch the same notification to many recipients, all-settled. Individual
/// failures are logged and counted; the call itself never errors.
pub async fn dispatch_bulk(
    state: &AppState,
    recipients: &[Uuid],
    kind: NotificationKind,
    title: &str,
    body: &str,
    payload: Option<serde_json::Value>,
    sender_name: Option<String>,
) -> DispatchReport {
    let dispatches = recipients.iter().map(|&recipient| {
        let payload = payload.clone();
        let sender_name = sender_name.clone();
        async move {
            dispatch(state, recipient, kind, title, body, payload, sender_name)
                .await
                .map_err(|e| (recipient, e))
        }
    });

    let mut report = DispatchReport::default();
    for outcome in join_all(dispatches).await {
        match outcome {
            Ok(_) => report.successful += 1,
            Err((recipient, e)) => {
                warn!(error = %e, %recipient, "bulk dispatch: recipient failed");
                report.failed += 1;
            }
        }
    }
    report
}

// =============================================================================
// READ STATE + LISTING
// =============================================================================

/// Mark one of `recipient`'s notifications read. Returns `false` when the row
/// does not exist, belongs to someone else, or was already read, so a repeated
/// mark is a no-op.
///
/// # Errors
///
/// `Database` on query failure.
pub async fn mark_read(pool: &PgPool, recipient: Uuid, notification_id: Uuid) -> Result<bool, NotifyError> {
    let result = sqlx::query(
        "UPDATE notifications SET status = 'read' WHERE id = $1 AND recipient_id = $2 AND status = 'unread'",
    )
    .bind(notification_id)
    .bind(recipient)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Mark every unread notification for `recipient` read in one statement.
/// Returns the number of rows flipped.
///
/// # Errors
///
/// `Database` on query failure.
pub async fn mark_all_read(pool: &PgPool, recipient: Uuid) -> Result<u64, NotifyError> {
    let result =
        sqlx::query("UPDATE notifications SET status = 'read' WHERE recipient_id = $1 AND status = 'unread'")
            .bind(recipient)
            .execute(pool)
            .await?;
    Ok(result.rows_affected())
}

/// Notifications for `recipient`, newest first, optionally filtered by status.
///
/// # Errors
///
/// `Database` on query failure, `InvalidKind` when a stored row carries a
/// kind or status outside the known set.
pub async fn list_notifications(
    pool: &PgPool,
    recipient: Uuid,
    status: Option<NotificationStatus>,
    limit: i64,
) -> Result<Vec<Notification>, NotifyError> {
    let rows = match status {
        Some(status) => {
            sqlx::query(
                r"SELECT id, recipient_id, kind, title, body, status, payload, sender_name,
                         (EXTRACT(EPOCH FROM created_at) * 1000)::BIGINT AS created_ms
                  FROM notifications
                  WHERE recipient_id = $1 AND status = $2
                  ORDER BY created_at DESC
                  LIMIT $3",
            )
            .bind(recipient)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                r"SELECT id, recipient_id, kind, title, body, status, payload, sender_name,
                         (EXTRACT(EPOCH FROM created_at) * 1000)::BIGINT AS created_ms
                  FROM notifications
                  WHERE recipient_id = $1
                  ORDER BY created_at DESC
                  LIMIT $2",
            )
            .bind(recipient)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };

    rows.into_iter().map(notification_from_row).collect()
}

fn notification_from_row(row: PgRow) -> Result<Notification, NotifyError> {
    let kind_raw: String = row.get("kind");
    let status_raw: String = row.get("status");
    let kind = NotificationKind::from_str(&kind_raw).ok_or(NotifyError::InvalidKind(kind_raw))?;
    let status =
        NotificationStatus::from_str(&status_raw).ok_or(NotifyError::InvalidKind(status_raw))?;

    Ok(Notification {
        id: row.get("id"),
        recipient_id: row.get("recipient_id"),
        kind,
        title: row.get("title"),
        body: row.get("body"),
        status,
        payload: row.get("payload"),
        sender_name: row.get("sender_name"),
        created_ms: row.get("created_ms"),
    })
}

#[cfg(test)]
#[path = "notify_test.rs"]
mod tests;
