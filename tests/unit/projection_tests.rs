//! Unit tests for projecting trace bundles into rows.

use agent_dialogue::models::message::Message;
use agent_dialogue::models::payload::RawPayload;
use agent_dialogue::models::trace::TraceProjection;
use agent_dialogue::observability::projection::project;
use agent_dialogue::AppError;
use serde_json::{json, Value};

fn traced(session_id: &str, content: &str, bundle: &Value) -> Message {
    Message::assistant(session_id, content)
        .with_debug_trace(RawPayload::from_value(bundle).expect("bundle"))
}

fn projected(message: &Message) -> Option<TraceProjection> {
    project("t1", message).expect("decodable bundle")
}

// ─── Trace row ───────────────────────────────────────────────────────────────

#[test]
fn message_without_bundle_projects_nothing() {
    assert!(projected(&Message::assistant("s1", "plain")).is_none());
}

#[test]
fn bundle_without_trace_id_projects_nothing() {
    let message = traced("s1", "answer", &json!({"generationMs": 10}));
    assert!(projected(&message).is_none());
}

#[test]
fn malformed_bundle_is_reported_not_skipped() {
    let message = traced("s1", "answer", &json!({"traceId": 42}));
    let err = project("t1", &message).expect_err("malformed");
    assert!(matches!(err, AppError::MalformedTrace(_)));
    assert!(!err.is_transient());
}

#[test]
fn session_falls_back_to_bundle() {
    let message = traced("", "answer", &json!({"traceId": "tr-1", "sessionId": "s-bundle"}));
    let projection = projected(&message).expect("projection");
    assert_eq!(projection.trace.session_id, "s-bundle");
}

#[test]
fn missing_session_everywhere_projects_nothing() {
    let message = traced("", "answer", &json!({"traceId": "tr-1"}));
    assert!(projected(&message).is_none());
}

#[test]
fn observation_reason_marks_trace_interrupted() {
    let completed = traced("s1", "a", &json!({"traceId": "tr-1"}));
    let interrupted = traced(
        "s1",
        "a",
        &json!({"traceId": "tr-2", "observationReason": "ask_user_question"}),
    );
    assert_eq!(projected(&completed).expect("p").trace.status, "completed");
    assert_eq!(
        projected(&interrupted).expect("p").trace.status,
        "interrupted"
    );
}

#[test]
fn trace_metadata_counts_children_and_skips_blanks() {
    let message = traced(
        "s1",
        "answer",
        &json!({
            "traceId": "tr-1",
            "schemaVersion": "2",
            "tools": [{"callId": "c1", "name": "search"}],
            "events": [{"name": "retry"}, {"name": "fallback"}],
        }),
    );
    let projection = projected(&message).expect("projection");
    let metadata = Value::Object(projection.trace.metadata);
    assert_eq!(
        metadata,
        json!({
            "schema_version": "2",
            "tool_count": 1,
            "span_count": 0,
            "event_count": 2,
        })
    );
}

// ─── Generations ─────────────────────────────────────────────────────────────

#[test]
fn summary_only_bundle_gets_final_generation() {
    let message = traced(
        "s1",
        "the answer",
        &json!({
            "traceId": "tr-1",
            "generationMs": 1500,
            "thinking": "hmm",
            "usage": {"promptTokens": 10, "completionTokens": 5, "totalTokens": 15, "cost": 0.25},
            "tools": [{"callId": "c1"}, {"callId": "c2"}],
        }),
    );
    let projection = projected(&message).expect("projection");
    assert_eq!(projection.generations.len(), 1);

    let generation = &projection.generations[0];
    assert_eq!(generation.external_generation_id, "tr-1:final");
    assert_eq!(generation.prompt_tokens, 10);
    assert_eq!(generation.total_tokens, 15);
    assert!((generation.cost - 0.25).abs() < f64::EPSILON);
    assert_eq!(generation.latency_ms, 1500);
    assert_eq!(generation.output_text.as_deref(), Some("the answer"));
    assert_eq!(generation.thinking.as_deref(), Some("hmm"));
    assert_eq!(generation.metadata["tool_call_count"], json!(2));
}

#[test]
fn attempts_without_ids_are_numbered() {
    let message = traced(
        "s1",
        "a",
        &json!({
            "traceId": "tr-1",
            "attempts": [
                {"id": "gen-a", "model": "m1"},
                {"model": "m2", "startedAt": "2024-03-01T10:00:00Z", "completedAt": "not a time"},
            ],
        }),
    );
    let projection = projected(&message).expect("projection");
    let ids: Vec<&str> = projection
        .generations
        .iter()
        .map(|g| g.external_generation_id.as_str())
        .collect();
    assert_eq!(ids, vec!["gen-a", "tr-1:gen:2"]);

    let second = &projection.generations[1];
    assert!(second.started_at.is_some());
    assert!(second.completed_at.is_none());
}

// ─── Spans and events ────────────────────────────────────────────────────────

#[test]
fn tool_executions_become_spans_when_bundle_has_none() {
    let message = traced(
        "s1",
        "a",
        &json!({
            "traceId": "tr-1",
            "tools": [
                {
                    "callId": "c1",
                    "name": "search",
                    "arguments": "{}",
                    "result": "ok",
                    "durationMs": 40,
                },
                {"name": "fetch", "error": "timeout"},
            ],
        }),
    );
    let projection = projected(&message).expect("projection");
    assert_eq!(projection.spans.len(), 2);

    let first = &projection.spans[0];
    assert_eq!(first.external_span_id, "c1");
    assert_eq!(first.name, "tool.execute");
    assert_eq!(first.kind, "tool");
    assert_eq!(first.status, "success");
    assert_eq!(first.tool_name.as_deref(), Some("search"));
    assert_eq!(first.duration_ms, 40);

    let second = &projection.spans[1];
    assert_eq!(second.external_span_id, "tr-1:tool:2");
    assert_eq!(second.status, "error");
    assert_eq!(second.error_text.as_deref(), Some("timeout"));
}

#[test]
fn explicit_spans_get_defaults_and_ids() {
    let message = traced(
        "s1",
        "a",
        &json!({
            "traceId": "tr-1",
            "tools": [{"callId": "ignored"}],
            "spans": [{"id": "sp-1", "name": "plan", "type": "agent"}, {}],
        }),
    );
    let projection = projected(&message).expect("projection");
    assert_eq!(projection.spans.len(), 2);
    assert_eq!(projection.spans[0].external_span_id, "sp-1");
    assert_eq!(projection.spans[0].kind, "agent");

    let defaulted = &projection.spans[1];
    assert_eq!(defaulted.external_span_id, "tr-1:span:2");
    assert_eq!(defaulted.name, "span");
    assert_eq!(defaulted.kind, "span");
    assert_eq!(defaulted.status, "success");
}

#[test]
fn events_without_ids_are_numbered() {
    let message = traced(
        "s1",
        "a",
        &json!({
            "traceId": "tr-1",
            "events": [
                {"id": "ev-1", "name": "retry", "timestamp": "2024-03-01T10:00:00Z"},
                {"message": "switched model"},
            ],
        }),
    );
    let projection = projected(&message).expect("projection");
    assert_eq!(projection.events[0].external_event_id, "ev-1");
    assert!(projection.events[0].timestamp.is_some());

    let second = &projection.events[1];
    assert_eq!(second.external_event_id, "tr-1:event:2");
    assert_eq!(second.name, "event");
    assert_eq!(second.kind, "event");
    assert_eq!(second.message.as_deref(), Some("switched model"));
}
