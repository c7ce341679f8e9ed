use envelope::{ChatMessage, now_ms};

use super::*;

fn broadcast(author_id: Uuid, content: &str) -> ChatMessage {
    ChatMessage {
        id: Uuid::new_v4(),
        channel_id: Uuid::new_v4(),
        author_id,
        content: content.to_owned(),
        reply_to: None,
        mentions: vec![],
        created_ms: now_ms(),
    }
}

#[test]
fn own_broadcast_matches_author_and_content() {
    let user_id = Uuid::new_v4();
    assert!(is_own_broadcast(&broadcast(user_id, "ship it"), user_id, "ship it"));
}

#[test]
fn identical_content_from_a_peer_is_not_the_ack() {
    let user_id = Uuid::new_v4();
    let peer_copy = broadcast(Uuid::new_v4(), "ship it");
    assert!(!is_own_broadcast(&peer_copy, user_id, "ship it"));
}

#[test]
fn own_earlier_message_with_other_content_is_not_the_ack() {
    let user_id = Uuid::new_v4();
    assert!(!is_own_broadcast(&broadcast(user_id, "an earlier message"), user_id, "ship it"));
}

#[test]
fn ws_url_maps_http_schemes_and_rejects_the_rest() {
    assert_eq!(ws_url("http://localhost:3000").ok().as_deref(), Some("ws://localhost:3000/api/ws"));
    assert_eq!(ws_url("https://taskwire.example").ok().as_deref(), Some("wss://taskwire.example/api/ws"));
    assert!(matches!(ws_url("ftp://nope"), Err(CliError::InvalidBaseUrl(_))));
}
