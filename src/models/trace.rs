//! Execution-trace bundle attached to assistant turns, and the projected rows.
//!
//! The bundle fields mirror the provider's camelCase JSON. Every field is
//! optional on the wire; empty strings mean "not reported".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form JSON object used for metadata and attributes.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Aggregate token usage for the turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugUsage {
    /// Prompt tokens.
    pub prompt_tokens: i64,
    /// Completion tokens.
    pub completion_tokens: i64,
    /// Total tokens.
    pub total_tokens: i64,
    /// Tokens served from the provider cache.
    pub cached_tokens: i64,
    /// Cost in the provider's billing currency.
    pub cost: f64,
}

/// Summary of one tool execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugToolCall {
    /// Provider call identifier.
    pub call_id: String,
    /// Tool name.
    pub name: String,
    /// Arguments as sent.
    pub arguments: String,
    /// Tool output.
    pub result: String,
    /// Error text when the tool failed.
    pub error: String,
    /// Wall-clock duration.
    pub duration_ms: i64,
}

/// One provider call attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugGeneration {
    /// External generation identifier.
    pub id: String,
    /// Provider request identifier.
    pub request_id: String,
    /// Model name.
    pub model: String,
    /// Provider name.
    pub provider: String,
    /// Why the provider stopped.
    pub finish_reason: String,
    /// Prompt tokens.
    pub prompt_tokens: i64,
    /// Completion tokens.
    pub completion_tokens: i64,
    /// Total tokens.
    pub total_tokens: i64,
    /// Cached tokens.
    pub cached_tokens: i64,
    /// Cost.
    pub cost: f64,
    /// Provider latency.
    pub latency_ms: i64,
    /// Prompt text.
    pub input: String,
    /// Completion text.
    pub output: String,
    /// Reasoning text.
    pub thinking: String,
    /// Why the attempt was flagged, if it was.
    pub observation_reason: String,
    /// RFC 3339 start time.
    pub started_at: String,
    /// RFC 3339 completion time.
    pub completed_at: String,
    /// Tool calls issued by this attempt.
    pub tool_calls: Vec<DebugToolCall>,
}

/// Tool execution or sub-step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugSpan {
    /// External span identifier.
    pub id: String,
    /// External identifier of the parent span.
    pub parent_id: String,
    /// External identifier of the generation that spawned the span.
    pub generation_id: String,
    /// Span name.
    pub name: String,
    /// Span type.
    #[serde(rename = "type")]
    pub kind: String,
    /// `success` or `error`.
    pub status: String,
    /// Severity level.
    pub level: String,
    /// Tool call identifier.
    pub call_id: String,
    /// Tool name.
    pub tool_name: String,
    /// Input text.
    pub input: String,
    /// Output text.
    pub output: String,
    /// Error text.
    pub error: String,
    /// Duration.
    pub duration_ms: i64,
    /// Free-form attributes.
    pub attributes: JsonMap,
    /// RFC 3339 start time.
    pub started_at: String,
    /// RFC 3339 completion time.
    pub completed_at: String,
}

/// Point-in-time occurrence during the turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugEvent {
    /// External event identifier.
    pub id: String,
    /// Event name.
    pub name: String,
    /// Event type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Severity level.
    pub level: String,
    /// Human-readable message.
    pub message: String,
    /// Machine-readable reason.
    pub reason: String,
    /// External identifier of the enclosing span.
    pub span_id: String,
    /// External identifier of the enclosing generation.
    pub generation_id: String,
    /// Free-form attributes.
    pub attributes: JsonMap,
    /// RFC 3339 occurrence time.
    pub timestamp: String,
}

/// Full trace bundle for one assistant turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DebugTrace {
    /// External trace identifier; bundles without one are ignored.
    pub trace_id: String,
    /// Session identifier reported by the provider.
    pub session_id: String,
    /// Bundle schema version.
    pub schema_version: String,
    /// Link to the trace in an external viewer.
    pub trace_url: String,
    /// Total generation time.
    pub generation_ms: i64,
    /// Reasoning text.
    pub thinking: String,
    /// Why the turn was flagged, if it was.
    pub observation_reason: String,
    /// RFC 3339 start time.
    pub started_at: String,
    /// RFC 3339 completion time.
    pub completed_at: String,
    /// Aggregate usage.
    pub usage: Option<DebugUsage>,
    /// Tool executions.
    pub tools: Vec<DebugToolCall>,
    /// Explicit provider call attempts.
    pub attempts: Vec<DebugGeneration>,
    /// Explicit spans.
    pub spans: Vec<DebugSpan>,
    /// Events.
    pub events: Vec<DebugEvent>,
}

/// Projected trace row.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    /// Internal row identifier.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Chat session.
    pub session_id: String,
    /// Assistant message the trace describes.
    pub message_id: String,
    /// External trace identifier.
    pub external_trace_id: String,
    /// External viewer link.
    pub trace_url: Option<String>,
    /// `completed` or `interrupted`.
    pub status: String,
    /// Total generation time.
    pub generation_ms: i64,
    /// Reasoning text.
    pub thinking: Option<String>,
    /// Observation reason.
    pub observation_reason: Option<String>,
    /// Merged metadata.
    pub metadata: JsonMap,
    /// First ingestion time.
    pub created_at: DateTime<Utc>,
    /// Last ingestion time.
    pub updated_at: DateTime<Utc>,
}

/// Projected generation row.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRecord {
    /// Internal row identifier.
    pub id: String,
    /// Owning trace row.
    pub trace_ref_id: String,
    /// External generation identifier.
    pub external_generation_id: String,
    /// Provider request identifier.
    pub request_id: Option<String>,
    /// Model name.
    pub model: Option<String>,
    /// Provider name.
    pub provider: Option<String>,
    /// Finish reason.
    pub finish_reason: Option<String>,
    /// Prompt tokens.
    pub prompt_tokens: i64,
    /// Completion tokens.
    pub completion_tokens: i64,
    /// Total tokens.
    pub total_tokens: i64,
    /// Cached tokens.
    pub cached_tokens: i64,
    /// Cost.
    pub cost: f64,
    /// Latency.
    pub latency_ms: i64,
    /// Prompt text.
    pub input_text: Option<String>,
    /// Completion text.
    pub output_text: Option<String>,
    /// Reasoning text.
    pub thinking: Option<String>,
    /// Observation reason.
    pub observation_reason: Option<String>,
    /// Merged metadata.
    pub metadata: JsonMap,
    /// Start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Projected span row.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    /// Internal row identifier.
    pub id: String,
    /// Owning trace row.
    pub trace_ref_id: String,
    /// External span identifier.
    pub external_span_id: String,
    /// External identifier of the parent span.
    pub parent_external_span_id: Option<String>,
    /// External identifier of the spawning generation.
    pub generation_external_id: Option<String>,
    /// Span name.
    pub name: String,
    /// Span type.
    pub kind: String,
    /// Span status.
    pub status: String,
    /// Severity level.
    pub level: Option<String>,
    /// Tool call identifier.
    pub call_id: Option<String>,
    /// Tool name.
    pub tool_name: Option<String>,
    /// Input text.
    pub input_text: Option<String>,
    /// Output text.
    pub output_text: Option<String>,
    /// Error text.
    pub error_text: Option<String>,
    /// Duration.
    pub duration_ms: i64,
    /// Merged attributes.
    pub attributes: JsonMap,
}

/// Projected event row.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Internal row identifier.
    pub id: String,
    /// Owning trace row.
    pub trace_ref_id: String,
    /// External event identifier.
    pub external_event_id: String,
    /// Event name.
    pub name: String,
    /// Event type.
    pub kind: String,
    /// Severity level.
    pub level: Option<String>,
    /// Message text.
    pub message: Option<String>,
    /// Reason.
    pub reason: Option<String>,
    /// Enclosing span.
    pub span_external_id: Option<String>,
    /// Enclosing generation.
    pub generation_external_id: Option<String>,
    /// Merged attributes.
    pub attributes: JsonMap,
    /// Occurrence time.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Trace row to upsert, keyed by tenant and external trace id.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceUpsert {
    /// Owning tenant.
    pub tenant_id: String,
    /// Chat session.
    pub session_id: String,
    /// Assistant message the trace describes.
    pub message_id: String,
    /// External trace identifier.
    pub external_trace_id: String,
    /// External viewer link.
    pub trace_url: Option<String>,
    /// `completed` or `interrupted`.
    pub status: String,
    /// Total generation time.
    pub generation_ms: i64,
    /// Reasoning text.
    pub thinking: Option<String>,
    /// Observation reason.
    pub observation_reason: Option<String>,
    /// Metadata to union into the stored map; no empty values.
    pub metadata: JsonMap,
}

/// Generation row to upsert under the trace.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationUpsert {
    /// External or synthesized generation identifier.
    pub external_generation_id: String,
    /// Provider request identifier.
    pub request_id: Option<String>,
    /// Model name.
    pub model: Option<String>,
    /// Provider name.
    pub provider: Option<String>,
    /// Finish reason.
    pub finish_reason: Option<String>,
    /// Prompt tokens.
    pub prompt_tokens: i64,
    /// Completion tokens.
    pub completion_tokens: i64,
    /// Total tokens.
    pub total_tokens: i64,
    /// Cached tokens.
    pub cached_tokens: i64,
    /// Cost.
    pub cost: f64,
    /// Latency.
    pub latency_ms: i64,
    /// Prompt text.
    pub input_text: Option<String>,
    /// Completion text.
    pub output_text: Option<String>,
    /// Reasoning text.
    pub thinking: Option<String>,
    /// Observation reason.
    pub observation_reason: Option<String>,
    /// Metadata to union into the stored map.
    pub metadata: JsonMap,
    /// Start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Span row to upsert under the trace.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanUpsert {
    /// External or synthesized span identifier.
    pub external_span_id: String,
    /// External identifier of the parent span.
    pub parent_external_span_id: Option<String>,
    /// External identifier of the spawning generation.
    pub generation_external_id: Option<String>,
    /// Span name.
    pub name: String,
    /// Span type.
    pub kind: String,
    /// Span status.
    pub status: String,
    /// Severity level.
    pub level: Option<String>,
    /// Tool call identifier.
    pub call_id: Option<String>,
    /// Tool name.
    pub tool_name: Option<String>,
    /// Input text.
    pub input_text: Option<String>,
    /// Output text.
    pub output_text: Option<String>,
    /// Error text.
    pub error_text: Option<String>,
    /// Duration.
    pub duration_ms: i64,
    /// Attributes to union into the stored map.
    pub attributes: JsonMap,
    /// Start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Event row to upsert under the trace.
#[derive(Debug, Clone, PartialEq)]
pub struct EventUpsert {
    /// External or synthesized event identifier.
    pub external_event_id: String,
    /// Event name.
    pub name: String,
    /// Event type.
    pub kind: String,
    /// Severity level.
    pub level: Option<String>,
    /// Message text.
    pub message: Option<String>,
    /// Reason.
    pub reason: Option<String>,
    /// Enclosing span.
    pub span_external_id: Option<String>,
    /// Enclosing generation.
    pub generation_external_id: Option<String>,
    /// Attributes to union into the stored map.
    pub attributes: JsonMap,
    /// Occurrence time.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Normalized rows derived from one trace bundle, written as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceProjection {
    /// Trace row.
    pub trace: TraceUpsert,
    /// Generation rows; written before spans.
    pub generations: Vec<GenerationUpsert>,
    /// Span rows.
    pub spans: Vec<SpanUpsert>,
    /// Event rows.
    pub events: Vec<EventUpsert>,
}
