use std::collections::HashSet;

use envelope::Outbound;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use uuid::Uuid;

use super::*;
use crate::state::test_helpers;

fn channels(ids: &[Uuid]) -> HashSet<Uuid> {
    ids.iter().copied().collect()
}

async fn recv_envelope(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("envelope receive timed out")
        .expect("channel closed")
}

async fn assert_channel_empty(rx: &mut mpsc::Receiver<Outbound>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected channel to remain empty"
    );
}

#[tokio::test]
async fn online_announce_reaches_channel_peers_and_self() {
    let state = test_helpers::test_app_state();
    let channel = Uuid::new_v4();
    let user = Uuid::new_v4();
    let peer = Uuid::new_v4();

    let (tx_peer, mut rx_peer) = mpsc::channel(8);
    state.registry.register(peer, channels(&[channel]), tx_peer).await;
    let (tx_user, mut rx_user) = mpsc::channel(8);
    let reg = state.registry.register(user, channels(&[channel]), tx_user).await;
    assert!(reg.came_online);

    connection_opened(&state, user, &channels(&[channel])).await;

    for rx in [&mut rx_peer, &mut rx_user] {
        let Outbound::Presence { user_id, status, timestamp } = recv_envelope(rx).await else {
            panic!("expected presence envelope");
        };
        assert_eq!(user_id, user);
        assert_eq!(status, PresenceStatus::Online);
        assert!(timestamp > 0);
    }
}

#[tokio::test]
async fn shared_membership_peer_receives_one_envelope_per_transition() {
    let state = test_helpers::test_app_state();
    let channel_a = Uuid::new_v4();
    let channel_b = Uuid::new_v4();
    let user = Uuid::new_v4();
    let peer = Uuid::new_v4();

    let (tx_peer, mut rx_peer) = mpsc::channel(8);
    state
        .registry
        .register(peer, channels(&[channel_a, channel_b]), tx_peer)
        .await;
    let (tx_user, _rx_user) = mpsc::channel(8);
    state
        .registry
        .register(user, channels(&[channel_a, channel_b]), tx_user)
        .await;

    connection_opened(&state, user, &channels(&[channel_a, channel_b])).await;

    let first = recv_envelope(&mut rx_peer).await;
    assert!(matches!(first, Outbound::Presence { .. }));
    assert_channel_empty(&mut rx_peer).await;
}

#[tokio::test]
async fn offline_announce_fires_only_on_went_offline() {
    let state = test_helpers::test_app_state();
    let channel = Uuid::new_v4();
    let user = Uuid::new_v4();
    let peer = Uuid::new_v4();

    let (tx_peer, mut rx_peer) = mpsc::channel(8);
    state.registry.register(peer, channels(&[channel]), tx_peer).await;

    let dereg = crate::registry::Deregistration {
        user_id: user,
        channel_ids: channels(&[channel]),
        went_offline: false,
    };
    connection_closed(&state, &dereg).await;
    assert_channel_empty(&mut rx_peer).await;

    let dereg = crate::registry::Deregistration {
        user_id: user,
        channel_ids: channels(&[channel]),
        went_offline: true,
    };
    connection_closed(&state, &dereg).await;
    let Outbound::Presence { user_id, status, .. } = recv_envelope(&mut rx_peer).await else {
        panic!("expected presence envelope");
    };
    assert_eq!(user_id, user);
    assert_eq!(status, PresenceStatus::Offline);
}

#[tokio::test]
async fn drop_dead_connections_deregisters_and_announces_offline() {
    let state = test_helpers::test_app_state();
    let channel = Uuid::new_v4();
    let gone = Uuid::new_v4();
    let watcher = Uuid::new_v4();

    let (tx_watcher, mut rx_watcher) = mpsc::channel(8);
    state.registry.register(watcher, channels(&[channel]), tx_watcher).await;

    let (tx_gone, rx_gone) = mpsc::channel(8);
    let reg = state.registry.register(gone, channels(&[channel]), tx_gone).await;
    drop(rx_gone);

    drop_dead_connections(
        &state,
        vec![crate::registry::DeadConnection { user_id: gone, connection_id: reg.connection_id }],
    )
    .await;

    assert!(!state.registry.is_online(gone).await);
    let Outbound::Presence { user_id, status, .. } = recv_envelope(&mut rx_watcher).await else {
        panic!("expected presence envelope");
    };
    assert_eq!(user_id, gone);
    assert_eq!(status, PresenceStatus::Offline);
}

#[tokio::test]
async fn cascade_of_dead_connections_drains_in_one_pass() {
    let state = test_helpers::test_app_state();
    let channel = Uuid::new_v4();
    let gone_a = Uuid::new_v4();
    let gone_b = Uuid::new_v4();

    let (tx_a, rx_a) = mpsc::channel(8);
    let reg_a = state.registry.register(gone_a, channels(&[channel]), tx_a).await;
    drop(rx_a);
    let (tx_b, rx_b) = mpsc::channel(8);
    state.registry.register(gone_b, channels(&[channel]), tx_b).await;
    drop(rx_b);

    // Dropping A announces offline, which discovers B dead and drops it too.
    drop_dead_connections(
        &state,
        vec![crate::registry::DeadConnection { user_id: gone_a, connection_id: reg_a.connection_id }],
    )
    .await;

    assert!(!state.registry.is_online(gone_a).await);
    assert!(!state.registry.is_online(gone_b).await);
}

#[tokio::test]
async fn presence_persist_failure_is_not_fatal() {
    // connect_lazy pool: the upsert fails, but the broadcast still happens.
    let state = test_helpers::test_app_state();
    let channel = Uuid::new_v4();
    let user = Uuid::new_v4();
    let peer = Uuid::new_v4();

    let (tx_peer, mut rx_peer) = mpsc::channel(8);
    state.registry.register(peer, channels(&[channel]), tx_peer).await;

    connection_opened(&state, user, &channels(&[channel])).await;

    assert!(matches!(
        recv_envelope(&mut rx_peer).await,
        Outbound::Presence { status: PresenceStatus::Online, .. }
    ));
}
