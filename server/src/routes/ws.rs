//! WebSocket handler — authenticated envelope relay.
//!
//! DESIGN
//! ======
//! On upgrade the connection is unauthenticated. The client gets a bounded
//! window to send an `authenticate` envelope; anything else, or silence,
//! earns an `auth_error` and a close. After authentication the handler
//! registers the connection and enters a `select!` loop:
//! - Inbound client envelopes → decode + dispatch to services
//! - Outbound envelopes from the registry channel → forward to the socket
//! - Heartbeat ticker → probe liveness, close silent peers
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → await `authenticate` within the auth window
//! 2. Verify token, filter requested channels to real memberships
//! 3. Register (replacing any older connection for the same user),
//!    reply `auth_success`, announce presence on the 0 -> 1 boundary
//! 4. Relay until close / replacement / liveness timeout
//! 5. Deregister, announce offline on the 1 -> 0 boundary

use std::collections::HashSet;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use envelope::{Inbound, Outbound, decode_inbound, encode_outbound};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, MissedTickBehavior, timeout_at};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::error_envelope;
use crate::services::identity::IdentityError;
use crate::services::{membership, presence, relay, typing};
use crate::state::AppState;

const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Liveness window: a peer silent for this many heartbeat intervals is dead.
const LIVENESS_INTERVALS: u32 = 2;

fn auth_timeout() -> Duration {
    let secs = std::env::var("AUTH_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_AUTH_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

fn heartbeat_interval() -> Duration {
    let secs = std::env::var("HEARTBEAT_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS);
    Duration::from_secs(secs)
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

// =============================================================================
// AUTHENTICATION WINDOW
// =============================================================================

/// Await and validate the in-band `authenticate` envelope. On any failure the
/// peer gets an `auth_error` with the reason, then the socket is closed.
async fn authenticate(socket: &mut WebSocket, state: &AppState) -> Option<(Uuid, HashSet<Uuid>)> {
    let deadline = Instant::now() + auth_timeout();

    let text = loop {
        match timeout_at(deadline, socket.recv()).await {
            Err(_) => return reject(socket, "authentication window elapsed").await,
            Ok(None | Some(Err(_) | Ok(Message::Close(_)))) => return None,
            Ok(Some(Ok(Message::Text(text)))) => break text,
            // Control frames before auth keep the window open.
            Ok(Some(Ok(_))) => {}
        }
    };

    let Ok(Inbound::Authenticate { token, channel_ids }) = decode_inbound(&text) else {
        return reject(socket, "first envelope must be authenticate").await;
    };

    let identity = match state.verifier.verify(&token).await {
        Ok(identity) => identity,
        Err(IdentityError::InvalidToken) => {
            return reject(socket, "invalid or expired token").await;
        }
        Err(e) => {
            error!(error = %e, "ws: token verification failed");
            return reject(socket, "verification unavailable").await;
        }
    };

    let channels = match membership::member_channels(&state.pool, identity.user_id, &channel_ids).await {
        Ok(channels) => channels,
        Err(e) => {
            error!(error = %e, user_id = %identity.user_id, "ws: membership lookup failed");
            return reject(socket, "verification unavailable").await;
        }
    };

    Some((identity.user_id, channels))
}

async fn reject(socket: &mut WebSocket, reason: &str) -> Option<(Uuid, HashSet<Uuid>)> {
    warn!(reason, "ws: authentication rejected");
    let envelope = Outbound::AuthError { message: reason.to_owned() };
    let _ = socket.send(Message::Text(encode_outbound(&envelope).into())).await;
    let _ = socket.send(Message::Close(None)).await;
    None
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let Some((user_id, channel_ids)) = authenticate(&mut socket, &state).await else {
        return;
    };

    // Per-connection channel the registry uses to reach this socket.
    let (client_tx, mut client_rx) = mpsc::channel::<Outbound>(256);
    let registration = state.registry.register(user_id, channel_ids.clone(), client_tx).await;
    let connection_id = registration.connection_id;

    info!(%user_id, %connection_id, replaced = registration.replaced, "ws: authenticated");

    if send_envelope(&mut socket, &Outbound::AuthSuccess { user_id }).await.is_err() {
        retract_unannounced(&state, connection_id, registration.came_online).await;
        return;
    }

    if registration.came_online {
        presence::connection_opened(&state, user_id, &channel_ids).await;
    }

    let interval = heartbeat_interval();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately; consume it so heartbeats start one interval in.
    ticker.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                last_seen = Instant::now();
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(&state, user_id, &text).await;
                        let mut send_failed = false;
                        for envelope in replies {
                            if send_envelope(&mut socket, &envelope).await.is_err() {
                                send_failed = true;
                                break;
                            }
                        }
                        if send_failed {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    // Pings/pongs count as liveness, nothing to dispatch.
                    _ => {}
                }
            }
            maybe = client_rx.recv() => {
                match maybe {
                    Some(envelope) => {
                        if send_envelope(&mut socket, &envelope).await.is_err() {
                            break;
                        }
                    }
                    // Registry dropped our sender: replaced by a newer connection.
                    None => {
                        info!(%user_id, %connection_id, "ws: replaced by newer connection");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if last_seen.elapsed() > interval * LIVENESS_INTERVALS {
                    info!(%user_id, %connection_id, "ws: liveness window elapsed");
                    break;
                }
                if send_envelope(&mut socket, &Outbound::Heartbeat {}).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(dereg) = state.registry.deregister(connection_id).await {
        presence::connection_closed(&state, &dereg).await;
    }
    info!(%user_id, %connection_id, "ws: disconnected");
}

/// Tear down a registration whose socket died before the handshake finished.
/// When this connection carried the online transition, that transition was
/// never published, so peers must not see an offline announcement either.
/// A replaced connection inherits an already-announced online state and
/// retracts it normally.
async fn retract_unannounced(state: &AppState, connection_id: Uuid, came_online: bool) {
    let Some(dereg) = state.registry.deregister(connection_id).await else {
        return;
    };
    if !came_online {
        presence::connection_closed(state, &dereg).await;
    }
}

// =============================================================================
// ENVELOPE DISPATCH
// =============================================================================

/// Decode and process one inbound text frame, returning envelopes owed to the
/// sender. Kept free of socket concerns so tests can exercise dispatch
/// end-to-end against the registry.
async fn process_inbound_text(state: &AppState, user_id: Uuid, text: &str) -> Vec<Outbound> {
    let inbound = match decode_inbound(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!(%user_id, error = %e, "ws: undecodable envelope");
            return vec![Outbound::error(format!("E_DECODE: {e}"))];
        }
    };

    match inbound {
        Inbound::Authenticate { .. } => {
            vec![Outbound::error("E_ALREADY_AUTHENTICATED: connection is already authenticated")]
        }
        Inbound::ChatMessage { channel_id, content, reply_to } => {
            match relay::relay(state, channel_id, user_id, &content, reply_to).await {
                // The author's own copy arrives through the broadcast.
                Ok(_) => vec![],
                Err(e) => vec![error_envelope(&e)],
            }
        }
        Inbound::Typing { channel_id, is_typing } => {
            // Typing is scoped to the connection's subscribed channels;
            // anything else is dropped without ceremony.
            if state.registry.channels_of(user_id).await.contains(&channel_id) {
                typing::set_typing(state, channel_id, user_id, is_typing).await;
            }
            vec![]
        }
        Inbound::HeartbeatResponse {} => vec![],
    }
}

async fn send_envelope(socket: &mut WebSocket, envelope: &Outbound) -> Result<(), ()> {
    socket
        .send(Message::Text(encode_outbound(envelope).into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
