//! Shared wire protocol for the Taskwire live channel.
//!
//! This crate owns the JSON envelope types used by both `server` and `cli`.
//! Every message on the live channel is one envelope, tagged by a `type`
//! field and matched exhaustively on both ends: an unknown inbound type is a
//! decode error, never a silently dropped message.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error returned by [`decode_inbound`] and [`decode_outbound`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text is not valid JSON or does not match any known envelope type.
    #[error("failed to decode envelope: {0}")]
    Decode(#[from] serde_json::Error),
}

// =============================================================================
// DOMAIN ENUMS
// =============================================================================

/// Online/offline presence state for one user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Source category of a notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Task,
    Team,
    Group,
    System,
}

impl NotificationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Team => "team",
            Self::Group => "group",
            Self::System => "system",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "task" => Some(Self::Task),
            "team" => Some(Self::Team),
            "group" => Some(Self::Group),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Read state of a notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Unread,
    Read,
}

impl NotificationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unread => "unread",
            Self::Read => "read",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "unread" => Some(Self::Unread),
            "read" => Some(Self::Read),
            _ => None,
        }
    }
}

// =============================================================================
// WIRE RECORDS
// =============================================================================

/// A reference parsed out of message content (`@task42`, `@alice`).
/// Only mentions that resolved against the store are carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Mention {
    Task { id: i64 },
    User { id: Uuid },
}

/// A persisted chat message as delivered over the live channel and the
/// history endpoint. Immutable once persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub mentions: Vec<Mention>,
    /// Milliseconds since the Unix epoch.
    pub created_ms: i64,
}

/// A persisted notification as delivered over the live channel and the
/// poll endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub status: NotificationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub created_ms: i64,
}

// =============================================================================
// ENVELOPES
// =============================================================================

/// Client-to-server envelopes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// First envelope on every connection; must arrive within the server's
    /// authentication window.
    Authenticate {
        token: String,
        channel_ids: Vec<Uuid>,
    },
    ChatMessage {
        channel_id: Uuid,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<Uuid>,
    },
    Typing {
        channel_id: Uuid,
        is_typing: bool,
    },
    HeartbeatResponse {},
}

/// Server-to-client envelopes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    AuthSuccess {
        user_id: Uuid,
    },
    AuthError {
        message: String,
    },
    Presence {
        user_id: Uuid,
        status: PresenceStatus,
        /// Milliseconds since the Unix epoch.
        timestamp: i64,
    },
    Typing {
        channel_id: Uuid,
        user_id: Uuid,
        is_typing: bool,
    },
    Message(ChatMessage),
    Notification(Notification),
    Heartbeat {},
    Error {
        content: String,
    },
}

impl Outbound {
    /// Build an `error` envelope with a human-readable reason.
    pub fn error(content: impl Into<String>) -> Self {
        Self::Error { content: content.into() }
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

/// Encode an outbound envelope as a JSON text frame.
///
/// # Panics
///
/// Never panics in practice; envelope types contain no non-serializable data.
#[must_use]
pub fn encode_outbound(envelope: &Outbound) -> String {
    serde_json::to_string(envelope).unwrap_or_default()
}

/// Encode an inbound envelope as a JSON text frame (client side).
#[must_use]
pub fn encode_inbound(envelope: &Inbound) -> String {
    serde_json::to_string(envelope).unwrap_or_default()
}

/// Decode a JSON text frame into an inbound envelope (server side).
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed JSON, unknown `type` tags,
/// or missing fields.
pub fn decode_inbound(text: &str) -> Result<Inbound, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a JSON text frame into an outbound envelope (client side).
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed JSON, unknown `type` tags,
/// or missing fields.
pub fn decode_outbound(text: &str) -> Result<Outbound, CodecError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
