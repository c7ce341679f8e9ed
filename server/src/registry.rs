//! Connection registry — live transport handles keyed by user.
//!
//! DESIGN
//! ======
//! One live connection per user: a reconnect replaces the previous entry and
//! the old receiver is dropped, which closes the stale socket loop. The
//! registry exclusively owns the user -> connection mapping; presence derives
//! its 0<->1 transitions from the `came_online` / `went_offline` flags
//! returned here rather than tracking its own counts.
//!
//! Channel membership lookups scan the registered connections' channel sets.
//! At the expected scale (hundreds of connections per process) a scan is
//! cheaper to keep correct than a redundant inverted index; see DESIGN.md for
//! the open question on larger deployments.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use envelope::Outbound;
use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

/// A registered live connection for one user.
struct Connection {
    connection_id: Uuid,
    channel_ids: HashSet<Uuid>,
    tx: mpsc::Sender<Outbound>,
}

/// Result of a successful [`ConnectionRegistry::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub connection_id: Uuid,
    /// True on the 0 -> 1 boundary for this user (presence transition).
    pub came_online: bool,
    /// True when an existing live connection was replaced and closed.
    pub replaced: bool,
}

/// Result of a successful [`ConnectionRegistry::deregister`].
#[derive(Debug, Clone)]
pub struct Deregistration {
    pub user_id: Uuid,
    /// Channels the departed connection was subscribed to.
    pub channel_ids: HashSet<Uuid>,
    /// True on the 1 -> 0 boundary for this user (presence transition).
    pub went_offline: bool,
}

/// A recipient whose send channel turned out to be closed during fan-out.
#[derive(Debug, Clone, Copy)]
pub struct DeadConnection {
    pub user_id: Uuid,
    pub connection_id: Uuid,
}

/// Process-local registry of live connections. Clone is cheap; all clones
/// share the same map.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<HashMap<Uuid, Connection>>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Register a live connection for `user_id`. A user that already has a
    /// connection gets the old one replaced and closed; reconnect races are
    /// expected, so this is a recorded side effect rather than an error.
    pub async fn register(
        &self,
        user_id: Uuid,
        channel_ids: HashSet<Uuid>,
        tx: mpsc::Sender<Outbound>,
    ) -> Registration {
        let connection_id = Uuid::new_v4();
        let mut connections = self.inner.write().await;
        let previous = connections.insert(user_id, Connection { connection_id, channel_ids, tx });

        let replaced = previous.is_some();
        if let Some(old) = previous {
            info!(%user_id, old_connection = %old.connection_id, new_connection = %connection_id,
                "replaced live connection");
        }

        Registration { connection_id, came_online: !replaced, replaced }
    }

    /// Remove the connection identified by `connection_id`. Idempotent: a
    /// connection that was already replaced or removed is a no-op, so the
    /// stale socket loop of a replaced connection cannot evict its successor.
    pub async fn deregister(&self, connection_id: Uuid) -> Option<Deregistration> {
        let mut connections = self.inner.write().await;
        let user_id = connections
            .iter()
            .find(|(_, conn)| conn.connection_id == connection_id)
            .map(|(user_id, _)| *user_id)?;

        let removed = connections.remove(&user_id)?;
        info!(%user_id, %connection_id, "connection deregistered");

        Some(Deregistration {
            user_id,
            channel_ids: removed.channel_ids,
            went_offline: true,
        })
    }

    /// Users currently connected and subscribed to `channel_id`. Derived by
    /// scanning registered connections, never stored redundantly.
    pub async fn members_of(&self, channel_id: Uuid) -> HashSet<Uuid> {
        let connections = self.inner.read().await;
        connections
            .iter()
            .filter(|(_, conn)| conn.channel_ids.contains(&channel_id))
            .map(|(user_id, _)| *user_id)
            .collect()
    }

    /// Channels the given user's live connection is subscribed to.
    pub async fn channels_of(&self, user_id: Uuid) -> HashSet<Uuid> {
        let connections = self.inner.read().await;
        connections
            .get(&user_id)
            .map(|conn| conn.channel_ids.clone())
            .unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.read().await.contains_key(&user_id)
    }

    /// Best-effort send to one user. Returns the connection as dead when its
    /// channel is closed; a full channel is skipped (slow consumer, not dead).
    pub async fn send_to_user(&self, user_id: Uuid, envelope: Outbound) -> Option<DeadConnection> {
        let connections = self.inner.read().await;
        let conn = connections.get(&user_id)?;
        Self::try_deliver(user_id, conn, envelope)
    }

    /// Best-effort fan-out to every connected member of `channel_id`,
    /// optionally excluding one user. Returns connections found dead; the
    /// caller is responsible for dropping them (send failure is an implicit
    /// disconnect).
    pub async fn broadcast_to_channel(
        &self,
        channel_id: Uuid,
        envelope: &Outbound,
        exclude: Option<Uuid>,
    ) -> Vec<DeadConnection> {
        let connections = self.inner.read().await;
        let mut dead = Vec::new();
        for (user_id, conn) in connections.iter() {
            if exclude == Some(*user_id) || !conn.channel_ids.contains(&channel_id) {
                continue;
            }
            if let Some(found) = Self::try_deliver(*user_id, conn, envelope.clone()) {
                dead.push(found);
            }
        }
        dead
    }

    fn try_deliver(user_id: Uuid, conn: &Connection, envelope: Outbound) -> Option<DeadConnection> {
        match conn.tx.try_send(envelope) {
            Ok(()) => None,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%user_id, "outbound queue full, dropping envelope");
                None
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Some(DeadConnection { user_id, connection_id: conn.connection_id })
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
