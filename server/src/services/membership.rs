//! Channel membership lookups against the durable store.
//!
//! Membership is owned by the team/group layer; this module only reads it.

use std::collections::HashSet;

use sqlx::PgPool;
use uuid::Uuid;

/// Team or group; every channel is one of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Team,
    Group,
}

impl ChannelKind {
    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "team" => Some(Self::Team),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// All members of a channel, whether connected or not.
pub async fn channel_members(pool: &PgPool, channel_id: Uuid) -> Result<HashSet<Uuid>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (Uuid,)>(
        "SELECT user_id FROM channel_members WHERE channel_id = $1",
    )
    .bind(channel_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(user_id,)| user_id).collect())
}

pub async fn is_channel_member(pool: &PgPool, channel_id: Uuid, user_id: Uuid) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM channel_members WHERE channel_id = $1 AND user_id = $2)",
    )
    .bind(channel_id)
    .bind(user_id)
    .fetch_one(pool)
    .await
}

/// Filter a requested channel set down to the channels the user actually
/// belongs to. Keeps the registry's channel sets consistent with durable
/// membership: a connection never subscribes to a channel its user left.
pub async fn member_channels(
    pool: &PgPool,
    user_id: Uuid,
    requested: &[Uuid],
) -> Result<HashSet<Uuid>, sqlx::Error> {
    if requested.is_empty() {
        return Ok(HashSet::new());
    }

    let rows = sqlx::query_as::<_, (Uuid,)>(
        "SELECT channel_id FROM channel_members WHERE user_id = $1 AND channel_id = ANY($2)",
    )
    .bind(user_id)
    .bind(requested)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|(channel_id,)| channel_id).collect())
}

/// Kind of an existing channel, `None` when the channel does not exist.
pub async fn channel_kind(pool: &PgPool, channel_id: Uuid) -> Result<Option<ChannelKind>, sqlx::Error> {
    let kind: Option<String> = sqlx::query_scalar("SELECT kind FROM channels WHERE id = $1")
        .bind(channel_id)
        .fetch_optional(pool)
        .await?;

    Ok(kind.as_deref().and_then(ChannelKind::from_str))
}
