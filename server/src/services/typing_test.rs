use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio::time::{Duration, sleep, timeout};

use super::*;
use crate::state::test_helpers;

const TEST_EXPIRY: Duration = Duration::from_millis(100);

fn channels(ids: &[Uuid]) -> HashSet<Uuid> {
    ids.iter().copied().collect()
}

async fn recv_typing(rx: &mut mpsc::Receiver<Outbound>) -> (Uuid, Uuid, bool) {
    let envelope = timeout(Duration::from_millis(400), rx.recv())
        .await
        .expect("typing envelope timed out")
        .expect("channel closed");
    let Outbound::Typing { channel_id, user_id, is_typing } = envelope else {
        panic!("expected typing envelope, got {envelope:?}");
    };
    (channel_id, user_id, is_typing)
}

async fn assert_channel_empty(rx: &mut mpsc::Receiver<Outbound>) {
    assert!(
        timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
        "expected channel to remain empty"
    );
}

struct Fixture {
    state: crate::state::AppState,
    channel: Uuid,
    typist: Uuid,
    peer_rx: mpsc::Receiver<Outbound>,
    typist_rx: mpsc::Receiver<Outbound>,
}

async fn fixture() -> Fixture {
    let state = test_helpers::test_app_state_with_typing_expiry(TEST_EXPIRY);
    let channel = Uuid::new_v4();
    let typist = Uuid::new_v4();
    let peer = Uuid::new_v4();

    let (tx_peer, peer_rx) = mpsc::channel(8);
    state.registry.register(peer, channels(&[channel]), tx_peer).await;
    let (tx_typist, typist_rx) = mpsc::channel(8);
    state.registry.register(typist, channels(&[channel]), tx_typist).await;

    Fixture { state, channel, typist, peer_rx, typist_rx }
}

#[tokio::test]
async fn typing_true_broadcasts_to_peers_excluding_sender() {
    let mut fx = fixture().await;

    set_typing(&fx.state, fx.channel, fx.typist, true).await;

    let (channel_id, user_id, is_typing) = recv_typing(&mut fx.peer_rx).await;
    assert_eq!(channel_id, fx.channel);
    assert_eq!(user_id, fx.typist);
    assert!(is_typing);
    assert_channel_empty(&mut fx.typist_rx).await;
    assert!(fx.state.typing.is_typing(fx.channel, fx.typist));
}

#[tokio::test]
async fn typing_auto_expires_and_broadcasts_false() {
    let mut fx = fixture().await;

    set_typing(&fx.state, fx.channel, fx.typist, true).await;
    let (_, _, is_typing) = recv_typing(&mut fx.peer_rx).await;
    assert!(is_typing);

    // No event supersedes the timer: expiry flips the state to false.
    let (channel_id, user_id, is_typing) = recv_typing(&mut fx.peer_rx).await;
    assert_eq!(channel_id, fx.channel);
    assert_eq!(user_id, fx.typist);
    assert!(!is_typing);
    assert!(!fx.state.typing.is_typing(fx.channel, fx.typist));
}

#[tokio::test]
async fn renewed_typing_resets_the_timer_instead_of_stacking_expiries() {
    let mut fx = fixture().await;

    set_typing(&fx.state, fx.channel, fx.typist, true).await;
    assert!(recv_typing(&mut fx.peer_rx).await.2);

    sleep(TEST_EXPIRY / 2).await;
    set_typing(&fx.state, fx.channel, fx.typist, true).await;
    assert!(recv_typing(&mut fx.peer_rx).await.2);

    // Just past the original deadline: the superseded timer must stay silent.
    sleep(TEST_EXPIRY * 11 / 20).await;
    assert!(
        timeout(Duration::from_millis(10), fx.peer_rx.recv()).await.is_err(),
        "superseded timer fired a stale stop"
    );
    assert!(fx.state.typing.is_typing(fx.channel, fx.typist));

    // The renewed timer fires exactly once.
    let (_, _, is_typing) = recv_typing(&mut fx.peer_rx).await;
    assert!(!is_typing);
    assert_channel_empty(&mut fx.peer_rx).await;
}

#[tokio::test]
async fn explicit_false_cancels_pending_expiry() {
    let mut fx = fixture().await;

    set_typing(&fx.state, fx.channel, fx.typist, true).await;
    assert!(recv_typing(&mut fx.peer_rx).await.2);

    set_typing(&fx.state, fx.channel, fx.typist, false).await;
    assert!(!recv_typing(&mut fx.peer_rx).await.2);
    assert!(!fx.state.typing.is_typing(fx.channel, fx.typist));

    // The aborted timer never produces a second false broadcast.
    sleep(TEST_EXPIRY * 2).await;
    assert_channel_empty(&mut fx.peer_rx).await;
}

#[tokio::test]
async fn rapid_toggling_never_emits_a_stale_stop() {
    let mut fx = fixture().await;

    set_typing(&fx.state, fx.channel, fx.typist, true).await;
    set_typing(&fx.state, fx.channel, fx.typist, false).await;
    set_typing(&fx.state, fx.channel, fx.typist, true).await;

    assert!(recv_typing(&mut fx.peer_rx).await.2);
    assert!(!recv_typing(&mut fx.peer_rx).await.2);
    assert!(recv_typing(&mut fx.peer_rx).await.2);

    // Only the final timer fires; the superseded ones stay silent.
    let (_, _, is_typing) = recv_typing(&mut fx.peer_rx).await;
    assert!(!is_typing);
    assert_channel_empty(&mut fx.peer_rx).await;
}

#[tokio::test]
async fn stale_timer_from_an_earlier_cycle_cannot_expire_a_fresh_entry() {
    let mut fx = fixture().await;

    // Full cycle, then a fresh start: the first cycle's timer may still be
    // mid-poll when its abort lands, so its body can run after the restart.
    set_typing(&fx.state, fx.channel, fx.typist, true).await;
    set_typing(&fx.state, fx.channel, fx.typist, false).await;
    set_typing(&fx.state, fx.channel, fx.typist, true).await;
    assert!(recv_typing(&mut fx.peer_rx).await.2);
    assert!(!recv_typing(&mut fx.peer_rx).await.2);
    assert!(recv_typing(&mut fx.peer_rx).await.2);

    // Run the first cycle's expiry body directly, as that late timer would.
    expire(&fx.state, fx.channel, fx.typist, 1).await;

    assert!(
        fx.state.typing.is_typing(fx.channel, fx.typist),
        "stale generation-1 timer expired the fresh entry"
    );
    assert_channel_empty(&mut fx.peer_rx).await;
}

#[tokio::test]
async fn typing_state_is_scoped_per_channel_and_user() {
    let state = test_helpers::test_app_state_with_typing_expiry(TEST_EXPIRY);
    let channel_a = Uuid::new_v4();
    let channel_b = Uuid::new_v4();
    let user = Uuid::new_v4();

    set_typing(&state, channel_a, user, true).await;

    assert!(state.typing.is_typing(channel_a, user));
    assert!(!state.typing.is_typing(channel_b, user));
    assert!(!state.typing.is_typing(channel_a, Uuid::new_v4()));
}
