//! Unit tests for the role-tagged message encoding.

use agent_dialogue::models::message::{Attachment, Message, Role, ToolCall};
use agent_dialogue::models::payload::RawPayload;
use serde_json::{json, Value};

fn encode(message: &Message) -> Value {
    serde_json::to_value(message).expect("encode")
}

// ─── Encoding ────────────────────────────────────────────────────────────────

#[test]
fn every_variant_carries_role_discriminator() {
    let messages = [
        Message::user("s1", "hi", Vec::new()),
        Message::assistant("s1", "hello"),
        Message::tool("s1", "call-1", "42"),
        Message::system("s1", "be brief"),
    ];
    let roles: Vec<Value> = messages.iter().map(|m| encode(m)["role"].clone()).collect();
    assert_eq!(
        roles,
        vec![json!("user"), json!("assistant"), json!("tool"), json!("system")]
    );
}

#[test]
fn user_message_omits_assistant_fields() {
    let encoded = encode(&Message::user("s1", "hi", Vec::new()));
    let obj = encoded.as_object().expect("object");
    assert!(!obj.contains_key("tool_calls"));
    assert!(!obj.contains_key("tool_call_id"));
    assert!(!obj.contains_key("debug_trace"));
}

#[test]
fn assistant_tool_calls_survive_decode() {
    let original = Message::assistant("s1", "")
        .with_tool_calls(vec![ToolCall::new("call-1", "search", r#"{"q":"rust"}"#)]);
    let decoded: Message = serde_json::from_value(encode(&original)).expect("decode");

    let Message::Assistant(msg) = decoded else {
        panic!("expected assistant");
    };
    assert_eq!(msg.tool_calls.len(), 1);
    assert_eq!(msg.tool_calls[0].arguments, r#"{"q":"rust"}"#);
}

#[test]
fn debug_trace_bytes_are_preserved() {
    let raw = r#"{"traceId":"tr-1","nested":{"b":1,"a":2}}"#;
    let original = Message::assistant("s1", "done")
        .with_debug_trace(RawPayload::from_json(raw).expect("payload"));
    let json = serde_json::to_string(&original).expect("encode");
    let decoded: Message = serde_json::from_str(&json).expect("decode");

    assert_eq!(decoded.debug_trace().map(RawPayload::get), Some(raw));
}

#[test]
fn attachments_round_trip_on_user_turn() {
    let attachment = Attachment {
        name: "report.csv".into(),
        mime_type: "text/csv".into(),
        size_bytes: 128,
        url: None,
    };
    let original = Message::user("s1", "see attached", vec![attachment.clone()]);
    let decoded: Message = serde_json::from_value(encode(&original)).expect("decode");

    let Message::User(msg) = decoded else {
        panic!("expected user");
    };
    assert_eq!(msg.attachments, vec![attachment]);
}

// ─── Decoding errors ─────────────────────────────────────────────────────────

#[test]
fn unknown_role_is_rejected() {
    let raw = json!({
        "role": "narrator",
        "id": "m1",
        "session_id": "s1",
        "content": "once upon a time",
        "created_at": "2024-01-01T00:00:00Z"
    });
    assert!(serde_json::from_value::<Message>(raw).is_err());
}

#[test]
fn missing_role_is_rejected() {
    let raw = json!({
        "id": "m1",
        "session_id": "s1",
        "content": "hi",
        "created_at": "2024-01-01T00:00:00Z"
    });
    assert!(serde_json::from_value::<Message>(raw).is_err());
}

#[test]
fn tool_message_without_call_id_is_rejected() {
    let raw = json!({
        "role": "tool",
        "id": "m1",
        "session_id": "s1",
        "content": "42",
        "created_at": "2024-01-01T00:00:00Z"
    });
    let err = serde_json::from_value::<Message>(raw).expect_err("must fail");
    assert!(err.to_string().contains("tool_call_id"));
}

#[test]
fn tool_call_id_on_user_message_is_rejected() {
    let raw = json!({
        "role": "user",
        "id": "m1",
        "session_id": "s1",
        "content": "hi",
        "tool_call_id": "call-1",
        "created_at": "2024-01-01T00:00:00Z"
    });
    assert!(serde_json::from_value::<Message>(raw).is_err());
}

#[test]
fn decoded_tool_message_exposes_call_id() {
    let raw = json!({
        "role": "tool",
        "id": "m1",
        "session_id": "s1",
        "content": "42",
        "tool_call_id": "call-9",
        "created_at": "2024-01-01T00:00:00Z"
    });
    let message: Message = serde_json::from_value(raw).expect("decode");
    assert_eq!(message.role(), Role::Tool);
    assert_eq!(message.tool_call_id(), Some("call-9"));
}
