//! Typing indicator manager — short-lived per (channel, user) state.
//!
//! DESIGN
//! ======
//! Each `is_typing = true` event (re)schedules an expiry task that flips the
//! state back to false after the expiry window. Every entry carries a
//! generation token drawn from a tracker-wide counter that never repeats; the
//! expiry task only acts when its generation is still current, so a stale
//! timer that lost the race to a newer event can never emit a late "stopped
//! typing" broadcast, even across an entry's removal and re-creation. The pending task is also
//! aborted on every supersession, the generation check is the backstop for
//! aborts that land after the sleep completed.
//!
//! Typing broadcasts always exclude the originating user.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use envelope::Outbound;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::services::presence;
use crate::state::AppState;

const DEFAULT_TYPING_EXPIRY_MS: u64 = 3000;

fn typing_expiry_from_env() -> Duration {
    let ms = std::env::var("TYPING_EXPIRY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TYPING_EXPIRY_MS);
    Duration::from_millis(ms)
}

struct TypingEntry {
    generation: u64,
    expiry_task: AbortHandle,
}

/// Process-local typing state. Clone is cheap; all clones share the map.
#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<Mutex<HashMap<(Uuid, Uuid), TypingEntry>>>,
    // Tracker-wide, never reused even after an entry is removed. A timer whose
    // abort lands after its sleep completed can therefore never match an entry
    // created by a later cycle.
    generations: Arc<AtomicU64>,
    expiry: Duration,
}

impl TypingTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_expiry(typing_expiry_from_env())
    }

    /// Tracker with an explicit expiry window (tests use short windows).
    #[must_use]
    pub fn with_expiry(expiry: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
            expiry,
        }
    }

    #[must_use]
    pub fn is_typing(&self, channel_id: Uuid, user_id: Uuid) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(&(channel_id, user_id))
    }
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply a typing event and broadcast the resulting state to channel peers.
pub async fn set_typing(state: &AppState, channel_id: Uuid, user_id: Uuid, is_typing: bool) {
    if is_typing {
        schedule_expiry(state, channel_id, user_id);
    } else {
        cancel_entry(state, channel_id, user_id);
    }

    broadcast_typing(state, channel_id, user_id, is_typing).await;
}

/// Upsert the entry and (re)schedule its expiry, superseding any pending
/// timer for the same key.
fn schedule_expiry(state: &AppState, channel_id: Uuid, user_id: Uuid) {
    let key = (channel_id, user_id);
    let mut entries = state
        .typing
        .inner
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    let generation = state.typing.generations.fetch_add(1, Ordering::Relaxed) + 1;
    let expiry = state.typing.expiry;
    let task_state = state.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(expiry).await;
        expire(&task_state, channel_id, user_id, generation).await;
    });

    if let Some(old) = entries.insert(key, TypingEntry { generation, expiry_task: handle.abort_handle() }) {
        old.expiry_task.abort();
    }
}

/// Explicit `is_typing = false`: cancel the pending expiry and clear state.
fn cancel_entry(state: &AppState, channel_id: Uuid, user_id: Uuid) {
    let mut entries = state
        .typing
        .inner
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if let Some(entry) = entries.remove(&(channel_id, user_id)) {
        entry.expiry_task.abort();
    }
}

/// Expiry task body. Acts only when its generation is still the current one.
async fn expire(state: &AppState, channel_id: Uuid, user_id: Uuid, generation: u64) {
    let superseded = {
        let mut entries = state
            .typing
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match entries.get(&(channel_id, user_id)) {
            Some(entry) if entry.generation == generation => {
                entries.remove(&(channel_id, user_id));
                false
            }
            _ => true,
        }
    };

    if !superseded {
        broadcast_typing(state, channel_id, user_id, false).await;
    }
}

async fn broadcast_typing(state: &AppState, channel_id: Uuid, user_id: Uuid, is_typing: bool) {
    let envelope = Outbound::Typing { channel_id, user_id, is_typing };
    let dead = state
        .registry
        .broadcast_to_channel(channel_id, &envelope, Some(user_id))
        .await;
    presence::drop_dead_connections(state, dead).await;
}

#[cfg(test)]
#[path = "typing_test.rs"]
mod tests;
