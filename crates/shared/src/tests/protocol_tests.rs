use super::*;
use serde_json::json;

#[test]
fn auth_response_normalizes_single_role_string() {
    let body = json!({
        "accessToken": "a1",
        "refreshToken": "r1",
        "user": { "_id": "u1", "email": "ana@example.com", "name": "Ana", "role": "admin" }
    });
    let parsed: AuthResponse = serde_json::from_value(body).expect("auth response");
    let identity = Identity::from(parsed.user);
    assert_eq!(identity.roles, vec!["admin".to_string()]);
    assert!(identity.has_role("ADMIN"));
}

#[test]
fn auth_response_keeps_role_arrays_and_defaults_missing_roles() {
    let with_array: UserPayload =
        serde_json::from_value(json!({ "_id": "u1", "roles": ["user", "seller"] }))
            .expect("array roles");
    assert_eq!(with_array.roles, vec!["user", "seller"]);

    let without: UserPayload = serde_json::from_value(json!({ "_id": "u2" })).expect("no roles");
    assert!(without.roles.is_empty());

    let null_roles: UserPayload =
        serde_json::from_value(json!({ "_id": "u3", "roles": null })).expect("null roles");
    assert!(null_roles.roles.is_empty());
}

#[test]
fn message_payload_accepts_embedded_chat_and_sender() {
    let payload: MessagePayload = serde_json::from_value(json!({
        "_id": "m1",
        "chat": { "_id": "c42", "users": [] },
        "sender": { "_id": "u7", "name": "Bo" },
        "content": "Hello",
        "createdAt": "2024-05-01T10:10:00Z"
    }))
    .expect("message payload");
    let message = Message::from(payload);
    assert_eq!(message.conversation_id, ConversationId::from("c42"));
    assert_eq!(message.sender_id, UserId::from("u7"));
    assert_eq!(message.text, "Hello");
}

#[test]
fn message_payload_accepts_bare_ids() {
    let payload: MessagePayload = serde_json::from_value(json!({
        "_id": "m2",
        "chat": "c1",
        "sender": "u1",
        "content": "hi",
        "createdAt": "2024-05-01T10:10:00Z"
    }))
    .expect("message payload");
    assert_eq!(payload.chat.id(), "c1");
    assert_eq!(payload.sender.id(), "u1");
}

#[test]
fn conversation_payload_maps_latest_message_and_item() {
    let payload: ConversationPayload = serde_json::from_value(json!({
        "_id": "c1",
        "users": [
            { "_id": "u1", "name": "Ana", "avatar": "img/ana.png" },
            { "_id": "u2", "name": "Bo" }
        ],
        "item": { "_id": "i9", "title": "Bike" },
        "latestMessage": { "_id": "m3", "content": "still available?" },
        "updatedAt": "2024-05-01T10:05:00Z"
    }))
    .expect("conversation payload");
    let conversation = Conversation::from(payload);
    assert_eq!(conversation.participants.len(), 2);
    assert_eq!(conversation.item_id, Some(ItemId::from("i9")));
    assert_eq!(conversation.last_message_text, "still available?");
    assert_eq!(
        conversation
            .counterpart(&UserId::from("u1"))
            .map(|p| p.display_name.as_str()),
        Some("Bo")
    );
}

#[test]
fn client_frames_use_event_envelope() {
    let join = serde_json::to_value(ClientFrame::JoinChat(ConversationId::from("c42")))
        .expect("serialize");
    assert_eq!(join, json!({ "event": "join chat", "data": "c42" }));
}

#[test]
fn server_frames_parse_connected_ack_and_messages() {
    let ack: ServerFrame =
        serde_json::from_str(r#"{"event":"connected"}"#).expect("connected ack");
    assert!(ack.into_message().is_none());

    let pushed: ServerFrame = serde_json::from_value(json!({
        "event": "message received",
        "data": {
            "_id": "m1",
            "chat": { "_id": "c42" },
            "sender": "u2",
            "content": "Hello",
            "createdAt": "2024-05-01T10:10:00Z"
        }
    }))
    .expect("message frame");
    let message = pushed.into_message().expect("message");
    assert_eq!(message.id, MessageId::from("m1"));
}

#[test]
fn outbound_message_round_trips_through_server_frame() {
    let message = Message {
        id: MessageId::from("m1"),
        conversation_id: ConversationId::from("c42"),
        sender_id: UserId::from("u1"),
        text: "Hello".into(),
        created_at: "2024-05-01T10:10:00Z".parse().expect("timestamp"),
    };
    let text = serde_json::to_string(&ClientFrame::NewMessage(MessagePayload::from(&message)))
        .expect("serialize");
    let parsed: ServerFrame = serde_json::from_str(&text).expect("parse as server frame");
    let payload = parsed.into_message().expect("message");
    assert_eq!(Message::from(payload), message);
}
