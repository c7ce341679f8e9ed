//! Presence tracker — online/offline transitions and their fan-out.
//!
//! DESIGN
//! ======
//! The registry reports 0<->1 connection-count boundaries; this module turns
//! them into durable presence rows and `presence` broadcasts. The in-memory
//! registry stays authoritative for delivery decisions; the `presence` table
//! is advisory, so persistence failures are logged and never fail the
//! transition.
//!
//! Broadcasts go to every member of every channel the user belongs to, self
//! included, deduplicated across channels so a shared-membership peer gets
//! one envelope per transition.

use std::collections::HashSet;

use envelope::{Outbound, PresenceStatus, now_ms};
use tracing::{info, warn};
use uuid::Uuid;

use crate::registry::{DeadConnection, Deregistration};
use crate::state::AppState;

/// Handle the 0 -> 1 boundary: persist and announce `online`.
pub async fn connection_opened(state: &AppState, user_id: Uuid, channel_ids: &HashSet<Uuid>) {
    info!(%user_id, channels = channel_ids.len(), "user online");
    let dead = announce(state, user_id, PresenceStatus::Online, channel_ids).await;
    drop_dead_connections(state, dead).await;
}

/// Handle the 1 -> 0 boundary: persist and announce `offline`.
pub async fn connection_closed(state: &AppState, dereg: &Deregistration) {
    if !dereg.went_offline {
        return;
    }
    info!(user_id = %dereg.user_id, "user offline");
    let dead = announce(state, dereg.user_id, PresenceStatus::Offline, &dereg.channel_ids).await;
    drop_dead_connections(state, dead).await;
}

/// Deregister connections whose sends failed, announcing `offline` for each
/// user that actually went offline. Newly discovered dead connections join
/// the worklist, so a cascade of stale sockets drains in one pass.
pub async fn drop_dead_connections(state: &AppState, dead: Vec<DeadConnection>) {
    let mut worklist = dead;
    while let Some(found) = worklist.pop() {
        let Some(dereg) = state.registry.deregister(found.connection_id).await else {
            continue;
        };
        warn!(user_id = %found.user_id, connection_id = %found.connection_id,
            "send failed, connection dropped");
        if dereg.went_offline {
            let more = announce(state, dereg.user_id, PresenceStatus::Offline, &dereg.channel_ids).await;
            worklist.extend(more);
        }
    }
}

/// Persist the transition (best-effort) then broadcast it. Returns dead
/// connections discovered during fan-out.
async fn announce(
    state: &AppState,
    user_id: Uuid,
    status: PresenceStatus,
    channel_ids: &HashSet<Uuid>,
) -> Vec<DeadConnection> {
    let timestamp = now_ms();
    persist_presence(state, user_id, status, timestamp).await;

    let mut recipients: HashSet<Uuid> = HashSet::new();
    for channel_id in channel_ids {
        recipients.extend(state.registry.members_of(*channel_id).await);
    }
    recipients.insert(user_id);

    let envelope = Outbound::Presence { user_id, status, timestamp };
    let mut dead = Vec::new();
    for recipient in recipients {
        if let Some(found) = state.registry.send_to_user(recipient, envelope.clone()).await {
            dead.push(found);
        }
    }
    dead
}

/// Best-effort upsert of the durable presence row. Presence is advisory:
/// failure is logged, never propagated.
async fn persist_presence(state: &AppState, user_id: Uuid, status: PresenceStatus, timestamp: i64) {
    let result = sqlx::query(
        r"INSERT INTO presence (user_id, status, changed_at)
          VALUES ($1, $2, to_timestamp($3::DOUBLE PRECISION / 1000.0))
          ON CONFLICT (user_id)
          DO UPDATE SET status = EXCLUDED.status, changed_at = EXCLUDED.changed_at",
    )
    .bind(user_id)
    .bind(status.as_str())
    .bind(timestamp)
    .execute(&state.pool)
    .await;

    if let Err(e) = result {
        warn!(error = %e, %user_id, status = status.as_str(), "presence persist failed");
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
