//! Projection of assistant trace bundles into the normalized hierarchy.
//!
//! [`project`] is pure: it turns one bundle into the rows to upsert,
//! synthesizing anything the bundle leaves out. [`TraceProjector`] writes
//! the result through [`TraceRepo`].

use chrono::{DateTime, Utc};
use tracing::{debug, info_span, warn, Instrument};

use crate::config::RetryConfig;
use crate::models::message::Message;
use crate::models::trace::{
    DebugEvent, DebugGeneration, DebugSpan, DebugTrace, EventUpsert, GenerationUpsert, JsonMap,
    SpanUpsert, TraceProjection, TraceUpsert,
};
use crate::persistence::merge::strip_empty;
use crate::persistence::trace_repo::TraceRepo;
use crate::retry::with_backoff;
use crate::{AppError, Result};

const STATUS_COMPLETED: &str = "completed";
const STATUS_INTERRUPTED: &str = "interrupted";

/// Writes assistant trace bundles into the projected tables.
#[derive(Clone)]
pub struct TraceProjector {
    repo: TraceRepo,
    retry: RetryConfig,
}

impl TraceProjector {
    /// Create a projector over the given repository.
    #[must_use]
    pub fn new(repo: TraceRepo, retry: RetryConfig) -> Self {
        Self { repo, retry }
    }

    /// Project and write the bundle carried by `message`, once.
    ///
    /// Messages without a usable bundle are ignored. Returns the internal
    /// trace row id when something was written.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MalformedTrace` if the bundle cannot be decoded,
    /// or `AppError::TraceIngest` if the write fails.
    pub async fn ingest(&self, tenant_id: &str, message: &Message) -> Result<Option<String>> {
        let Some(projection) = project(tenant_id, message)? else {
            return Ok(None);
        };
        let span = info_span!(
            "ingest_trace",
            trace_id = %projection.trace.external_trace_id,
            message_id = %message.id()
        );
        self.repo
            .write_projection(&projection)
            .instrument(span)
            .await
            .map(Some)
    }

    /// [`TraceProjector::ingest`] with bounded backoff on transient failures.
    ///
    /// Safe to retry with the full bundle because every row is an
    /// idempotent upsert.
    ///
    /// # Errors
    ///
    /// Returns the last `AppError::TraceIngest` once retries are exhausted.
    pub async fn ingest_with_retry(
        &self,
        tenant_id: &str,
        message: &Message,
    ) -> Result<Option<String>> {
        with_backoff(&self.retry, "trace ingest", || self.ingest(tenant_id, message)).await
    }
}

/// Derive the rows to upsert for the bundle attached to `message`.
///
/// Returns `Ok(None)` when the message carries no bundle, the bundle has no
/// trace id, or neither the message nor the bundle names a session.
///
/// # Errors
///
/// Returns `AppError::MalformedTrace` when a bundle is present but does not
/// decode.
pub fn project(tenant_id: &str, message: &Message) -> Result<Option<TraceProjection>> {
    let Some(raw) = message.debug_trace() else {
        return Ok(None);
    };
    let trace: DebugTrace = raw.decode().map_err(|err| {
        warn!(message_id = %message.id(), %err, "malformed trace bundle");
        AppError::MalformedTrace(format!("message {}: {err}", message.id()))
    })?;

    let trace_id = trace.trace_id.trim();
    if trace_id.is_empty() {
        debug!(message_id = %message.id(), "trace bundle without trace id");
        return Ok(None);
    }

    let Some(session_id) =
        non_empty(message.session_id()).or_else(|| non_empty(&trace.session_id))
    else {
        debug!(message_id = %message.id(), "trace bundle without session");
        return Ok(None);
    };

    let mut metadata = JsonMap::new();
    metadata.insert("schema_version".into(), trace.schema_version.trim().into());
    metadata.insert("started_at".into(), trace.started_at.trim().into());
    metadata.insert("completed_at".into(), trace.completed_at.trim().into());
    metadata.insert("tool_count".into(), trace.tools.len().into());
    metadata.insert("span_count".into(), trace.spans.len().into());
    metadata.insert("event_count".into(), trace.events.len().into());

    let status = if trace.observation_reason.trim().is_empty() {
        STATUS_COMPLETED
    } else {
        STATUS_INTERRUPTED
    };

    let row = TraceUpsert {
        tenant_id: tenant_id.to_owned(),
        session_id,
        message_id: message.id().to_owned(),
        external_trace_id: trace_id.to_owned(),
        trace_url: non_empty(&trace.trace_url),
        status: status.to_owned(),
        generation_ms: trace.generation_ms,
        thinking: non_empty(&trace.thinking),
        observation_reason: non_empty(&trace.observation_reason),
        metadata: strip_empty(metadata),
    };

    Ok(Some(TraceProjection {
        generations: generations(&trace, trace_id, message.content()),
        spans: spans(&trace, trace_id),
        events: events(&trace.events, trace_id),
        trace: row,
    }))
}

fn generations(trace: &DebugTrace, trace_id: &str, content: &str) -> Vec<GenerationUpsert> {
    if trace.attempts.is_empty() {
        return vec![generation_row(&fallback_attempt(trace, trace_id, content))];
    }
    trace
        .attempts
        .iter()
        .enumerate()
        .map(|(idx, attempt)| {
            let mut row = generation_row(attempt);
            if row.external_generation_id.is_empty() {
                row.external_generation_id = format!("{trace_id}:gen:{}", idx + 1);
            }
            row
        })
        .collect()
}

/// Single attempt standing in for a bundle that reports only its summary.
fn fallback_attempt(trace: &DebugTrace, trace_id: &str, content: &str) -> DebugGeneration {
    let usage = trace.usage.clone().unwrap_or_default();
    DebugGeneration {
        id: format!("{trace_id}:final"),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        cached_tokens: usage.cached_tokens,
        cost: usage.cost,
        latency_ms: trace.generation_ms,
        output: content.to_owned(),
        thinking: trace.thinking.clone(),
        observation_reason: trace.observation_reason.clone(),
        started_at: trace.started_at.clone(),
        completed_at: trace.completed_at.clone(),
        tool_calls: trace.tools.clone(),
        ..DebugGeneration::default()
    }
}

fn generation_row(attempt: &DebugGeneration) -> GenerationUpsert {
    let mut metadata = JsonMap::new();
    metadata.insert("tool_call_count".into(), attempt.tool_calls.len().into());

    GenerationUpsert {
        external_generation_id: attempt.id.trim().to_owned(),
        request_id: non_empty(&attempt.request_id),
        model: non_empty(&attempt.model),
        provider: non_empty(&attempt.provider),
        finish_reason: non_empty(&attempt.finish_reason),
        prompt_tokens: attempt.prompt_tokens,
        completion_tokens: attempt.completion_tokens,
        total_tokens: attempt.total_tokens,
        cached_tokens: attempt.cached_tokens,
        cost: attempt.cost,
        latency_ms: attempt.latency_ms,
        input_text: non_empty(&attempt.input),
        output_text: non_empty(&attempt.output),
        thinking: non_empty(&attempt.thinking),
        observation_reason: non_empty(&attempt.observation_reason),
        metadata,
        started_at: parse_time(&attempt.started_at),
        completed_at: parse_time(&attempt.completed_at),
    }
}

fn spans(trace: &DebugTrace, trace_id: &str) -> Vec<SpanUpsert> {
    let synthesized;
    let source: &[DebugSpan] = if trace.spans.is_empty() {
        synthesized = tool_spans(trace, trace_id);
        &synthesized
    } else {
        &trace.spans
    };

    source
        .iter()
        .enumerate()
        .map(|(idx, span)| SpanUpsert {
            external_span_id: non_empty(&span.id)
                .unwrap_or_else(|| format!("{trace_id}:span:{}", idx + 1)),
            parent_external_span_id: non_empty(&span.parent_id),
            generation_external_id: non_empty(&span.generation_id),
            name: or_default(&span.name, "span"),
            kind: or_default(&span.kind, "span"),
            status: or_default(&span.status, "success"),
            level: non_empty(&span.level),
            call_id: non_empty(&span.call_id),
            tool_name: non_empty(&span.tool_name),
            input_text: non_empty(&span.input),
            output_text: non_empty(&span.output),
            error_text: non_empty(&span.error),
            duration_ms: span.duration_ms,
            attributes: strip_empty(span.attributes.clone()),
            started_at: parse_time(&span.started_at),
            completed_at: parse_time(&span.completed_at),
        })
        .collect()
}

/// One span per tool execution, for bundles that report no spans.
fn tool_spans(trace: &DebugTrace, trace_id: &str) -> Vec<DebugSpan> {
    trace
        .tools
        .iter()
        .enumerate()
        .map(|(idx, tool)| DebugSpan {
            id: non_empty(&tool.call_id).unwrap_or_else(|| format!("{trace_id}:tool:{}", idx + 1)),
            name: "tool.execute".into(),
            kind: "tool".into(),
            status: if tool.error.trim().is_empty() {
                "success".into()
            } else {
                "error".into()
            },
            call_id: tool.call_id.clone(),
            tool_name: tool.name.clone(),
            input: tool.arguments.clone(),
            output: tool.result.clone(),
            error: tool.error.clone(),
            duration_ms: tool.duration_ms,
            ..DebugSpan::default()
        })
        .collect()
}

fn events(events: &[DebugEvent], trace_id: &str) -> Vec<EventUpsert> {
    events
        .iter()
        .enumerate()
        .map(|(idx, event)| EventUpsert {
            external_event_id: non_empty(&event.id)
                .unwrap_or_else(|| format!("{trace_id}:event:{}", idx + 1)),
            name: or_default(&event.name, "event"),
            kind: or_default(&event.kind, "event"),
            level: non_empty(&event.level),
            message: non_empty(&event.message),
            reason: non_empty(&event.reason),
            span_external_id: non_empty(&event.span_id),
            generation_external_id: non_empty(&event.generation_id),
            attributes: strip_empty(event.attributes.clone()),
            timestamp: parse_time(&event.timestamp),
        })
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

fn or_default(value: &str, fallback: &str) -> String {
    non_empty(value).unwrap_or_else(|| fallback.to_owned())
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
