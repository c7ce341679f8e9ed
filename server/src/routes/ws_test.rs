use super::*;
use crate::state::test_helpers;
use envelope::encode_inbound;
use tokio::time::timeout;

async fn expect_envelope(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("expected an envelope within 200ms")
        .expect("channel should be open")
}

fn expect_single_error(replies: &[Outbound]) -> &str {
    match replies {
        [Outbound::Error { content }] => content,
        other => panic!("expected exactly one error envelope, got {other:?}"),
    }
}

#[tokio::test]
async fn undecodable_text_earns_a_decode_error() {
    let state = test_helpers::test_app_state();
    let replies = process_inbound_text(&state, Uuid::new_v4(), "{not json").await;
    assert!(expect_single_error(&replies).starts_with("E_DECODE"));
}

#[tokio::test]
async fn unknown_envelope_type_earns_a_decode_error() {
    let state = test_helpers::test_app_state();
    let replies =
        process_inbound_text(&state, Uuid::new_v4(), r#"{"type":"launch_missiles"}"#).await;
    assert!(expect_single_error(&replies).starts_with("E_DECODE"));
}

#[tokio::test]
async fn re_authentication_is_rejected() {
    let state = test_helpers::test_app_state();
    let text = encode_inbound(&Inbound::Authenticate { token: "again".to_owned(), channel_ids: vec![] });
    let replies = process_inbound_text(&state, Uuid::new_v4(), &text).await;
    assert!(expect_single_error(&replies).starts_with("E_ALREADY_AUTHENTICATED"));
}

#[tokio::test]
async fn failed_relay_reports_a_coded_error_to_the_sender() {
    let state = test_helpers::test_app_state();
    let text = encode_inbound(&Inbound::ChatMessage {
        channel_id: Uuid::new_v4(),
        content: "hello".to_owned(),
        reply_to: None,
    });
    let replies = process_inbound_text(&state, Uuid::new_v4(), &text).await;
    assert!(expect_single_error(&replies).starts_with("E_"));
}

#[tokio::test]
async fn typing_reaches_subscribed_peers_but_not_the_sender() {
    let state = test_helpers::test_app_state();
    let channel_id = Uuid::new_v4();
    let sender = Uuid::new_v4();
    let peer = Uuid::new_v4();

    let (sender_tx, mut sender_rx) = mpsc::channel(8);
    let (peer_tx, mut peer_rx) = mpsc::channel(8);
    state.registry.register(sender, [channel_id].into(), sender_tx).await;
    state.registry.register(peer, [channel_id].into(), peer_tx).await;

    let text = encode_inbound(&Inbound::Typing { channel_id, is_typing: true });
    let replies = process_inbound_text(&state, sender, &text).await;
    assert!(replies.is_empty(), "typing produces no direct reply");

    match expect_envelope(&mut peer_rx).await {
        Outbound::Typing { channel_id: ch, user_id, is_typing } => {
            assert_eq!(ch, channel_id);
            assert_eq!(user_id, sender);
            assert!(is_typing);
        }
        other => panic!("expected typing envelope, got {other:?}"),
    }

    assert!(
        timeout(Duration::from_millis(50), sender_rx.recv()).await.is_err(),
        "sender must not receive their own typing broadcast"
    );
    assert!(state.typing.is_typing(channel_id, sender));
}

#[tokio::test]
async fn typing_for_an_unsubscribed_channel_is_dropped() {
    let state = test_helpers::test_app_state();
    let subscribed = Uuid::new_v4();
    let unsubscribed = Uuid::new_v4();
    let sender = Uuid::new_v4();

    let (tx, _rx) = mpsc::channel(8);
    state.registry.register(sender, [subscribed].into(), tx).await;

    let text = encode_inbound(&Inbound::Typing { channel_id: unsubscribed, is_typing: true });
    let replies = process_inbound_text(&state, sender, &text).await;

    assert!(replies.is_empty());
    assert!(!state.typing.is_typing(unsubscribed, sender));
}

#[tokio::test]
async fn handshake_failure_before_online_announce_stays_silent_to_peers() {
    let state = test_helpers::test_app_state();
    let channel_id = Uuid::new_v4();
    let user = Uuid::new_v4();
    let peer = Uuid::new_v4();

    let (peer_tx, mut peer_rx) = mpsc::channel(8);
    state.registry.register(peer, [channel_id].into(), peer_tx).await;

    let (tx, _rx) = mpsc::channel(8);
    let registration = state.registry.register(user, [channel_id].into(), tx).await;
    assert!(registration.came_online);

    retract_unannounced(&state, registration.connection_id, registration.came_online).await;

    assert!(!state.registry.is_online(user).await);
    assert!(
        timeout(Duration::from_millis(50), peer_rx.recv()).await.is_err(),
        "peers saw an offline announce for a user never announced online"
    );
}

#[tokio::test]
async fn handshake_failure_on_a_replacement_retracts_the_announced_presence() {
    let state = test_helpers::test_app_state();
    let channel_id = Uuid::new_v4();
    let user = Uuid::new_v4();
    let peer = Uuid::new_v4();

    let (peer_tx, mut peer_rx) = mpsc::channel(8);
    state.registry.register(peer, [channel_id].into(), peer_tx).await;

    // First connection published online; the replacement inherits that state.
    let (tx_old, _rx_old) = mpsc::channel(8);
    state.registry.register(user, [channel_id].into(), tx_old).await;
    let (tx_new, _rx_new) = mpsc::channel(8);
    let replacement = state.registry.register(user, [channel_id].into(), tx_new).await;
    assert!(!replacement.came_online);

    retract_unannounced(&state, replacement.connection_id, replacement.came_online).await;

    assert!(!state.registry.is_online(user).await);
    match expect_envelope(&mut peer_rx).await {
        Outbound::Presence { user_id, status, .. } => {
            assert_eq!(user_id, user);
            assert_eq!(status, envelope::PresenceStatus::Offline);
        }
        other => panic!("expected presence envelope, got {other:?}"),
    }
}

#[tokio::test]
async fn heartbeat_response_is_silent() {
    let state = test_helpers::test_app_state();
    let replies =
        process_inbound_text(&state, Uuid::new_v4(), &encode_inbound(&Inbound::HeartbeatResponse {})).await;
    assert!(replies.is_empty());
}
