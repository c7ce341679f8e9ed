//! Message relay — validate, persist, then fan out.
//!
//! DESIGN
//! ======
//! The durable insert happens before any broadcast. A persistence failure
//! aborts the relay with a retryable error and nothing is delivered, so a
//! recipient can never observe a message that was not saved. Fan-out sends
//! are issued concurrently and are best-effort: a dead recipient is dropped
//! from the registry, never surfaced to the author.
//!
//! MENTIONS
//! ========
//! Content is scanned for `@task<id>` and `@<username>` tokens. Resolution
//! runs against the store per token; a token that fails to resolve (or whose
//! lookup errors) is skipped, it never fails the send. Resolved user mentions
//! dispatch a durable notification decoupled from the live broadcast, so a
//! mentioned user who is offline still finds it on next poll.

use envelope::{ChatMessage, Mention, NotificationKind, Outbound};
use futures::future::join_all;
use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::services::{membership, notify, presence};
use crate::state::AppState;

const MENTION_BODY_PREVIEW_CHARS: usize = 140;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("message content must not be empty")]
    InvalidContent,
    #[error("user {user_id} is not a member of channel {channel_id}")]
    Forbidden { user_id: Uuid, channel_id: Uuid },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for RelayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidContent => "E_INVALID_CONTENT",
            Self::Forbidden { .. } => "E_FORBIDDEN",
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// A mention token lifted out of message content, not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
enum MentionToken {
    Task(i64),
    Username(String),
}

/// Relay one inbound chat message: validate, authorize, persist, fan out.
///
/// # Errors
///
/// `InvalidContent` for empty content, `Forbidden` when the author is not a
/// channel member, `Database` when the durable insert fails (retryable; no
/// broadcast happens in that case).
pub async fn relay(
    state: &AppState,
    channel_id: Uuid,
    author_id: Uuid,
    content: &str,
    reply_to: Option<Uuid>,
) -> Result<ChatMessage, RelayError> {
    if content.trim().is_empty() {
        return Err(RelayError::InvalidContent);
    }

    if !membership::is_channel_member(&state.pool, channel_id, author_id).await? {
        return Err(RelayError::Forbidden { user_id: author_id, channel_id });
    }

    let mentions = resolve_mentions(&state.pool, &extract_mention_tokens(content)).await;

    let message = persist_message(&state.pool, channel_id, author_id, content, reply_to, mentions).await?;
    info!(message_id = %message.id, %channel_id, %author_id, mentions = message.mentions.len(),
        "message persisted");

    fan_out(state, &message).await;
    notify_mentioned_users(state, &message).await;

    Ok(message)
}

// =============================================================================
// MENTIONS
// =============================================================================

/// Lift `@task<id>` and `@<username>` tokens out of content. Trailing
/// punctuation is stripped so `@alice,` still mentions alice.
fn extract_mention_tokens(content: &str) -> Vec<MentionToken> {
    content
        .split_whitespace()
        .filter_map(|word| {
            let candidate = word.strip_prefix('@')?;
            let candidate = candidate.trim_end_matches(['.', ',', '!', '?', ';', ':']);
            if candidate.is_empty() {
                return None;
            }
            if let Some(digits) = candidate.strip_prefix("task") {
                if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                    return digits.parse().ok().map(MentionToken::Task);
                }
            }
            Some(MentionToken::Username(candidate.to_owned()))
        })
        .collect()
}

/// Resolve tokens against the store. Unresolvable tokens and per-token lookup
/// failures are dropped; a bad mention must not fail the whole send.
async fn resolve_mentions(pool: &PgPool, tokens: &[MentionToken]) -> Vec<Mention> {
    let mut mentions = Vec::new();
    for token in tokens {
        match token {
            MentionToken::Task(task_id) => match task_exists(pool, *task_id).await {
                Ok(true) => mentions.push(Mention::Task { id: *task_id }),
                Ok(false) => debug!(task_id, "mention skipped: task not found"),
                Err(e) => debug!(error = %e, task_id, "mention skipped: task lookup failed"),
            },
            MentionToken::Username(name) => match user_id_by_name(pool, name).await {
                Ok(Some(id)) => mentions.push(Mention::User { id }),
                Ok(None) => debug!(name, "mention skipped: user not found"),
                Err(e) => debug!(error = %e, name, "mention skipped: user lookup failed"),
            },
        }
    }
    mentions
}

async fn task_exists(pool: &PgPool, task_id: i64) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = $1)")
        .bind(task_id)
        .fetch_one(pool)
        .await
}

async fn user_id_by_name(pool: &PgPool, name: &str) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar("SELECT id FROM users WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
}

// =============================================================================
// PERSIST + FAN-OUT
// =============================================================================

async fn persist_message(
    pool: &PgPool,
    channel_id: Uuid,
    author_id: Uuid,
    content: &str,
    reply_to: Option<Uuid>,
    mentions: Vec<Mention>,
) -> Result<ChatMessage, sqlx::Error> {
    let id = Uuid::new_v4();
    let mentions_json = serde_json::to_value(&mentions).unwrap_or_else(|_| serde_json::json!([]));

    let created_ms: i64 = sqlx::query_scalar(
        r"INSERT INTO messages (id, channel_id, author_id, content, reply_to, mentions)
          VALUES ($1, $2, $3, $4, $5, $6)
          RETURNING (EXTRACT(EPOCH FROM created_at) * 1000)::BIGINT",
    )
    .bind(id)
    .bind(channel_id)
    .bind(author_id)
    .bind(content)
    .bind(reply_to)
    .bind(&mentions_json)
    .fetch_one(pool)
    .await?;

    Ok(ChatMessage {
        id,
        channel_id,
        author_id,
        content: content.to_owned(),
        reply_to,
        mentions,
        created_ms,
    })
}

/// Concurrent best-effort delivery to every connected channel member, author
/// included. Dead recipients are dropped; the relay result is unaffected.
async fn fan_out(state: &AppState, message: &ChatMessage) {
    let recipients = state.registry.members_of(message.channel_id).await;
    let envelope = Outbound::Message(message.clone());

    let sends = recipients
        .into_iter()
        .map(|recipient| state.registry.send_to_user(recipient, envelope.clone()));
    let dead: Vec<_> = join_all(sends).await.into_iter().flatten().collect();

    presence::drop_dead_connections(state, dead).await;
}

/// Dispatch a durable notification per resolved user mention (self-mentions
/// excluded). Dispatch failures are logged; the message is already delivered.
async fn notify_mentioned_users(state: &AppState, message: &ChatMessage) {
    let mentioned: Vec<Uuid> = message
        .mentions
        .iter()
        .filter_map(|mention| match mention {
            Mention::User { id } if *id != message.author_id => Some(*id),
            _ => None,
        })
        .collect();
    if mentioned.is_empty() {
        return;
    }

    let kind = match membership::channel_kind(&state.pool, message.channel_id).await {
        Ok(Some(membership::ChannelKind::Team)) => NotificationKind::Team,
        Ok(Some(membership::ChannelKind::Group)) => NotificationKind::Group,
        Ok(None) | Err(_) => NotificationKind::System,
    };
    let sender_name = author_name(&state.pool, message.author_id).await;
    let payload = serde_json::json!({
        "channel_id": message.channel_id,
        "message_id": message.id,
    });

    for recipient in mentioned {
        let result = notify::dispatch(
            state,
            recipient,
            kind,
            "You were mentioned",
            &preview(&message.content),
            Some(payload.clone()),
            sender_name.clone(),
        )
        .await;
        if let Err(e) = result {
            warn!(error = %e, %recipient, message_id = %message.id, "mention notification failed");
        }
    }
}

async fn author_name(pool: &PgPool, author_id: Uuid) -> Option<String> {
    sqlx::query_scalar("SELECT name FROM users WHERE id = $1")
        .bind(author_id)
        .fetch_optional(pool)
        .await
        .ok()
        .flatten()
}

/// Char-safe preview of message content for notification bodies.
fn preview(content: &str) -> String {
    if content.chars().count() <= MENTION_BODY_PREVIEW_CHARS {
        return content.to_owned();
    }
    let truncated: String = content.chars().take(MENTION_BODY_PREVIEW_CHARS).collect();
    format!("{truncated}…")
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;
