//! Trace projection repository for `SQLite` persistence.
//!
//! Writes go through the declarative policies in [`super::merge`]; every
//! level is an idempotent upsert on its natural key, so a bundle may be
//! written any number of times.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Sqlite, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::models::trace::{
    EventRecord, EventUpsert, GenerationRecord, GenerationUpsert, JsonMap, SpanRecord,
    SpanUpsert, TraceProjection, TraceRecord, TraceUpsert,
};
use crate::{AppError, Result};

use super::db::Database;
use super::merge::{
    strip_empty, MergePolicy, MergeRule, EVENT_POLICY, GENERATION_POLICY, SPAN_POLICY,
    TRACE_POLICY,
};

/// Repository for the trace → generation → span → event hierarchy.
#[derive(Clone)]
pub struct TraceRepo {
    db: Arc<Database>,
}

fn ingest_err(err: sqlx::Error) -> AppError {
    AppError::TraceIngest(err.to_string())
}

fn encode_map(map: &JsonMap) -> Result<String> {
    serde_json::to_string(&strip_empty(map.clone()))
        .map_err(|e| AppError::TraceIngest(format!("failed to encode metadata: {e}")))
}

fn decode_map(raw: &str) -> Result<JsonMap> {
    serde_json::from_str(raw).map_err(|e| AppError::Db(format!("invalid metadata: {e}")))
}

fn parse_time(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}

fn parse_opt_time(raw: Option<&str>, column: &str) -> Result<Option<DateTime<Utc>>> {
    raw.map(|r| parse_time(r, column)).transpose()
}

fn time_str(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(|t| t.to_rfc3339())
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct TraceRow {
    id: String,
    tenant_id: String,
    session_id: String,
    message_id: String,
    external_trace_id: String,
    trace_url: Option<String>,
    status: String,
    generation_ms: i64,
    thinking: Option<String>,
    observation_reason: Option<String>,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl TraceRow {
    fn into_record(self) -> Result<TraceRecord> {
        Ok(TraceRecord {
            metadata: decode_map(&self.metadata)?,
            created_at: parse_time(&self.created_at, "created_at")?,
            updated_at: parse_time(&self.updated_at, "updated_at")?,
            id: self.id,
            tenant_id: self.tenant_id,
            session_id: self.session_id,
            message_id: self.message_id,
            external_trace_id: self.external_trace_id,
            trace_url: self.trace_url,
            status: self.status,
            generation_ms: self.generation_ms,
            thinking: self.thinking,
            observation_reason: self.observation_reason,
        })
    }
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct GenerationRow {
    id: String,
    trace_ref_id: String,
    external_generation_id: String,
    request_id: Option<String>,
    model: Option<String>,
    provider: Option<String>,
    finish_reason: Option<String>,
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
    cached_tokens: i64,
    cost: f64,
    latency_ms: i64,
    input_text: Option<String>,
    output_text: Option<String>,
    thinking: Option<String>,
    observation_reason: Option<String>,
    metadata: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl GenerationRow {
    fn into_record(self) -> Result<GenerationRecord> {
        Ok(GenerationRecord {
            metadata: decode_map(&self.metadata)?,
            started_at: parse_opt_time(self.started_at.as_deref(), "started_at")?,
            completed_at: parse_opt_time(self.completed_at.as_deref(), "completed_at")?,
            id: self.id,
            trace_ref_id: self.trace_ref_id,
            external_generation_id: self.external_generation_id,
            request_id: self.request_id,
            model: self.model,
            provider: self.provider,
            finish_reason: self.finish_reason,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            cached_tokens: self.cached_tokens,
            cost: self.cost,
            latency_ms: self.latency_ms,
            input_text: self.input_text,
            output_text: self.output_text,
            thinking: self.thinking,
            observation_reason: self.observation_reason,
        })
    }
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SpanRow {
    id: String,
    trace_ref_id: String,
    external_span_id: String,
    parent_external_span_id: Option<String>,
    generation_external_id: Option<String>,
    name: String,
    #[sqlx(rename = "type")]
    kind: String,
    status: String,
    level: Option<String>,
    call_id: Option<String>,
    tool_name: Option<String>,
    input_text: Option<String>,
    output_text: Option<String>,
    error_text: Option<String>,
    duration_ms: i64,
    attributes: String,
}

impl SpanRow {
    fn into_record(self) -> Result<SpanRecord> {
        Ok(SpanRecord {
            attributes: decode_map(&self.attributes)?,
            id: self.id,
            trace_ref_id: self.trace_ref_id,
            external_span_id: self.external_span_id,
            parent_external_span_id: self.parent_external_span_id,
            generation_external_id: self.generation_external_id,
            name: self.name,
            kind: self.kind,
            status: self.status,
            level: self.level,
            call_id: self.call_id,
            tool_name: self.tool_name,
            input_text: self.input_text,
            output_text: self.output_text,
            error_text: self.error_text,
            duration_ms: self.duration_ms,
        })
    }
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    trace_ref_id: String,
    external_event_id: String,
    name: String,
    #[sqlx(rename = "type")]
    kind: String,
    level: Option<String>,
    message: Option<String>,
    reason: Option<String>,
    span_external_id: Option<String>,
    generation_external_id: Option<String>,
    attributes: String,
    timestamp: Option<String>,
}

impl EventRow {
    fn into_record(self) -> Result<EventRecord> {
        Ok(EventRecord {
            attributes: decode_map(&self.attributes)?,
            timestamp: parse_opt_time(self.timestamp.as_deref(), "timestamp")?,
            id: self.id,
            trace_ref_id: self.trace_ref_id,
            external_event_id: self.external_event_id,
            name: self.name,
            kind: self.kind,
            level: self.level,
            message: self.message,
            reason: self.reason,
            span_external_id: self.span_external_id,
            generation_external_id: self.generation_external_id,
        })
    }
}

impl TraceRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Write a projected bundle in one transaction.
    ///
    /// The trace row is upserted first and its surviving id is used as the
    /// parent of every child row. Generations precede spans and spans
    /// precede events. Returns the internal trace row id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::TraceIngest` on any storage failure; nothing is
    /// committed in that case.
    pub async fn write_projection(&self, projection: &TraceProjection) -> Result<String> {
        let mut tx = self.db.begin().await.map_err(ingest_err)?;
        let now = Utc::now().to_rfc3339();

        let trace_ref_id = upsert_trace(&mut tx, &projection.trace, &now).await?;
        let tenant_id = projection.trace.tenant_id.as_str();

        for generation in &projection.generations {
            upsert_generation(&mut tx, tenant_id, &trace_ref_id, generation, &now).await?;
        }
        for span in &projection.spans {
            upsert_span(&mut tx, tenant_id, &trace_ref_id, span, &now).await?;
        }
        for event in &projection.events {
            upsert_event(&mut tx, tenant_id, &trace_ref_id, event, &now).await?;
        }

        tx.commit().await.map_err(ingest_err)?;
        debug!(
            trace_ref_id = %trace_ref_id,
            generations = projection.generations.len(),
            spans = projection.spans.len(),
            events = projection.events.len(),
            "trace projection written"
        );
        Ok(trace_ref_id)
    }

    /// Fetch a trace by tenant and external id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_trace(
        &self,
        tenant_id: &str,
        external_trace_id: &str,
    ) -> Result<Option<TraceRecord>> {
        let row: Option<TraceRow> = sqlx::query_as(
            "SELECT id, tenant_id, session_id, message_id, external_trace_id, trace_url, status,
                    generation_ms, thinking, observation_reason, metadata, created_at, updated_at
             FROM trace WHERE tenant_id = ?1 AND external_trace_id = ?2",
        )
        .bind(tenant_id)
        .bind(external_trace_id)
        .fetch_optional(self.db.as_ref())
        .await?;
        row.map(TraceRow::into_record).transpose()
    }

    /// List a session's traces, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(
        &self,
        tenant_id: &str,
        session_id: &str,
    ) -> Result<Vec<TraceRecord>> {
        let rows: Vec<TraceRow> = sqlx::query_as(
            "SELECT id, tenant_id, session_id, message_id, external_trace_id, trace_url, status,
                    generation_ms, thinking, observation_reason, metadata, created_at, updated_at
             FROM trace WHERE tenant_id = ?1 AND session_id = ?2
             ORDER BY created_at ASC",
        )
        .bind(tenant_id)
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(TraceRow::into_record).collect()
    }

    /// List the generations of a trace by external id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_generations(
        &self,
        tenant_id: &str,
        trace_ref_id: &str,
    ) -> Result<Vec<GenerationRecord>> {
        let rows: Vec<GenerationRow> = sqlx::query_as(
            "SELECT id, trace_ref_id, external_generation_id, request_id, model, provider,
                    finish_reason, prompt_tokens, completion_tokens, total_tokens, cached_tokens,
                    cost, latency_ms, input_text, output_text, thinking, observation_reason,
                    metadata, started_at, completed_at
             FROM trace_generation WHERE tenant_id = ?1 AND trace_ref_id = ?2
             ORDER BY external_generation_id ASC",
        )
        .bind(tenant_id)
        .bind(trace_ref_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(GenerationRow::into_record).collect()
    }

    /// List the spans of a trace by external id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_spans(&self, tenant_id: &str, trace_ref_id: &str) -> Result<Vec<SpanRecord>> {
        let rows: Vec<SpanRow> = sqlx::query_as(
            "SELECT id, trace_ref_id, external_span_id, parent_external_span_id,
                    generation_external_id, name, type, status, level, call_id, tool_name,
                    input_text, output_text, error_text, duration_ms, attributes
             FROM trace_span WHERE tenant_id = ?1 AND trace_ref_id = ?2
             ORDER BY external_span_id ASC",
        )
        .bind(tenant_id)
        .bind(trace_ref_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(SpanRow::into_record).collect()
    }

    /// List the events of a trace by external id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_events(
        &self,
        tenant_id: &str,
        trace_ref_id: &str,
    ) -> Result<Vec<EventRecord>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT id, trace_ref_id, external_event_id, name, type, level, message, reason,
                    span_external_id, generation_external_id, attributes, timestamp
             FROM trace_event WHERE tenant_id = ?1 AND trace_ref_id = ?2
             ORDER BY external_event_id ASC",
        )
        .bind(tenant_id)
        .bind(trace_ref_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(EventRow::into_record).collect()
    }

    /// Delete traces last updated before `before`, children first.
    ///
    /// Returns the number of trace rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if any delete fails.
    pub async fn purge_older_than(&self, before: DateTime<Utc>) -> Result<u64> {
        let before_str = before.to_rfc3339();
        let mut tx = self.db.begin().await?;

        for table in ["trace_event", "trace_span", "trace_generation"] {
            // `table` comes from the literal list above.
            let sql = format!(
                "DELETE FROM {table} WHERE trace_ref_id IN \
                 (SELECT id FROM trace WHERE updated_at < ?1)"
            );
            sqlx::query(&sql).bind(&before_str).execute(&mut *tx).await?;
        }

        let result = sqlx::query("DELETE FROM trace WHERE updated_at < ?1")
            .bind(&before_str)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

async fn upsert_trace(
    tx: &mut Transaction<'_, Sqlite>,
    trace: &TraceUpsert,
    now: &str,
) -> Result<String> {
    let metadata = encode_map(&trace.metadata)?;
    let sql = TRACE_POLICY.upsert_sql();
    let (id, stored): (String, String) = sqlx::query_as(&sql)
        .bind(Uuid::new_v4().to_string())
        .bind(&trace.tenant_id)
        .bind(&trace.session_id)
        .bind(&trace.message_id)
        .bind(&trace.external_trace_id)
        .bind(&trace.trace_url)
        .bind(&trace.status)
        .bind(trace.generation_ms)
        .bind(&trace.thinking)
        .bind(&trace.observation_reason)
        .bind(&metadata)
        .bind(now)
        .bind(now)
        .fetch_one(&mut **tx)
        .await
        .map_err(ingest_err)?;
    write_union(tx, &TRACE_POLICY, &id, &stored, &trace.metadata).await?;
    Ok(id)
}

async fn upsert_generation(
    tx: &mut Transaction<'_, Sqlite>,
    tenant_id: &str,
    trace_ref_id: &str,
    generation: &GenerationUpsert,
    now: &str,
) -> Result<()> {
    let metadata = encode_map(&generation.metadata)?;
    let sql = GENERATION_POLICY.upsert_sql();
    let (id, stored): (String, String) = sqlx::query_as(&sql)
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(trace_ref_id)
        .bind(&generation.external_generation_id)
        .bind(&generation.request_id)
        .bind(&generation.model)
        .bind(&generation.provider)
        .bind(&generation.finish_reason)
        .bind(generation.prompt_tokens)
        .bind(generation.completion_tokens)
        .bind(generation.total_tokens)
        .bind(generation.cached_tokens)
        .bind(generation.cost)
        .bind(generation.latency_ms)
        .bind(&generation.input_text)
        .bind(&generation.output_text)
        .bind(&generation.thinking)
        .bind(&generation.observation_reason)
        .bind(&metadata)
        .bind(time_str(generation.started_at))
        .bind(time_str(generation.completed_at))
        .bind(now)
        .fetch_one(&mut **tx)
        .await
        .map_err(ingest_err)?;
    write_union(tx, &GENERATION_POLICY, &id, &stored, &generation.metadata).await
}

async fn upsert_span(
    tx: &mut Transaction<'_, Sqlite>,
    tenant_id: &str,
    trace_ref_id: &str,
    span: &SpanUpsert,
    now: &str,
) -> Result<()> {
    let attributes = encode_map(&span.attributes)?;
    let sql = SPAN_POLICY.upsert_sql();
    let (id, stored): (String, String) = sqlx::query_as(&sql)
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(trace_ref_id)
        .bind(&span.external_span_id)
        .bind(&span.parent_external_span_id)
        .bind(&span.generation_external_id)
        .bind(&span.name)
        .bind(&span.kind)
        .bind(&span.status)
        .bind(&span.level)
        .bind(&span.call_id)
        .bind(&span.tool_name)
        .bind(&span.input_text)
        .bind(&span.output_text)
        .bind(&span.error_text)
        .bind(span.duration_ms)
        .bind(&attributes)
        .bind(time_str(span.started_at))
        .bind(time_str(span.completed_at))
        .bind(now)
        .fetch_one(&mut **tx)
        .await
        .map_err(ingest_err)?;
    write_union(tx, &SPAN_POLICY, &id, &stored, &span.attributes).await
}

async fn upsert_event(
    tx: &mut Transaction<'_, Sqlite>,
    tenant_id: &str,
    trace_ref_id: &str,
    event: &EventUpsert,
    now: &str,
) -> Result<()> {
    let attributes = encode_map(&event.attributes)?;
    let sql = EVENT_POLICY.upsert_sql();
    let (id, stored): (String, String) = sqlx::query_as(&sql)
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(trace_ref_id)
        .bind(&event.external_event_id)
        .bind(&event.name)
        .bind(&event.kind)
        .bind(&event.level)
        .bind(&event.message)
        .bind(&event.reason)
        .bind(&event.span_external_id)
        .bind(&event.generation_external_id)
        .bind(&attributes)
        .bind(time_str(event.timestamp))
        .bind(now)
        .fetch_one(&mut **tx)
        .await
        .map_err(ingest_err)?;
    write_union(tx, &EVENT_POLICY, &id, &stored, &event.attributes).await
}

/// Write the shallow union of `incoming` over the value the upsert returned.
async fn write_union(
    tx: &mut Transaction<'_, Sqlite>,
    policy: &MergePolicy,
    row_id: &str,
    stored: &str,
    incoming: &JsonMap,
) -> Result<()> {
    let Some(sql) = policy.union_update_sql() else {
        return Ok(());
    };
    let stored: Value = serde_json::from_str(stored).map_err(|e| {
        AppError::TraceIngest(format!("invalid stored {} json: {e}", policy.table))
    })?;
    let incoming = Value::Object(strip_empty(incoming.clone()));
    let merged = MergeRule::Union.resolve(&stored, &incoming);
    if merged == stored {
        return Ok(());
    }
    let encoded = serde_json::to_string(&merged).map_err(|e| {
        AppError::TraceIngest(format!("failed to encode {} json: {e}", policy.table))
    })?;
    sqlx::query(&sql)
        .bind(encoded)
        .bind(row_id)
        .execute(&mut **tx)
        .await
        .map_err(ingest_err)?;
    Ok(())
}
