//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` and are safe
//! to re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS checkpoint (
    id                    TEXT PRIMARY KEY NOT NULL,
    tenant_id             TEXT NOT NULL,
    user_id               TEXT NOT NULL,
    session_id            TEXT NOT NULL,
    thread_id             TEXT NOT NULL,
    agent_name            TEXT NOT NULL,
    version               INTEGER NOT NULL CHECK(version > 0),
    messages              TEXT NOT NULL,
    pending_tools         TEXT NOT NULL,
    interrupt_type        TEXT,
    interrupt_data        TEXT,
    interrupt_response_id TEXT,
    previous_response_id  TEXT,
    created_at            TEXT NOT NULL,
    UNIQUE(tenant_id, thread_id, version)
);

CREATE TABLE IF NOT EXISTS artifact (
    id              TEXT PRIMARY KEY NOT NULL,
    tenant_id       TEXT NOT NULL,
    session_id      TEXT NOT NULL,
    message_id      TEXT,
    type            TEXT NOT NULL,
    name            TEXT NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('pending','ready','failed')),
    size_bytes      INTEGER NOT NULL DEFAULT 0,
    metadata        TEXT NOT NULL DEFAULT '{}',
    idempotency_key TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    UNIQUE(tenant_id, idempotency_key)
);

CREATE TABLE IF NOT EXISTS trace (
    id                 TEXT PRIMARY KEY NOT NULL,
    tenant_id          TEXT NOT NULL,
    session_id         TEXT NOT NULL,
    message_id         TEXT NOT NULL,
    external_trace_id  TEXT NOT NULL,
    trace_url          TEXT,
    status             TEXT NOT NULL,
    generation_ms      INTEGER NOT NULL DEFAULT 0,
    thinking           TEXT,
    observation_reason TEXT,
    metadata           TEXT NOT NULL DEFAULT '{}',
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    UNIQUE(tenant_id, external_trace_id)
);

CREATE TABLE IF NOT EXISTS trace_generation (
    id                     TEXT PRIMARY KEY NOT NULL,
    tenant_id              TEXT NOT NULL,
    trace_ref_id           TEXT NOT NULL REFERENCES trace(id) ON DELETE CASCADE,
    external_generation_id TEXT NOT NULL,
    request_id             TEXT,
    model                  TEXT,
    provider               TEXT,
    finish_reason          TEXT,
    prompt_tokens          INTEGER NOT NULL DEFAULT 0,
    completion_tokens      INTEGER NOT NULL DEFAULT 0,
    total_tokens           INTEGER NOT NULL DEFAULT 0,
    cached_tokens          INTEGER NOT NULL DEFAULT 0,
    cost                   REAL NOT NULL DEFAULT 0,
    latency_ms             INTEGER NOT NULL DEFAULT 0,
    input_text             TEXT,
    output_text            TEXT,
    thinking               TEXT,
    observation_reason     TEXT,
    metadata               TEXT NOT NULL DEFAULT '{}',
    started_at             TEXT,
    completed_at           TEXT,
    created_at             TEXT NOT NULL,
    UNIQUE(tenant_id, trace_ref_id, external_generation_id)
);

CREATE TABLE IF NOT EXISTS trace_span (
    id                      TEXT PRIMARY KEY NOT NULL,
    tenant_id               TEXT NOT NULL,
    trace_ref_id            TEXT NOT NULL REFERENCES trace(id) ON DELETE CASCADE,
    external_span_id        TEXT NOT NULL,
    parent_external_span_id TEXT,
    generation_external_id  TEXT,
    name                    TEXT NOT NULL,
    type                    TEXT NOT NULL,
    status                  TEXT NOT NULL,
    level                   TEXT,
    call_id                 TEXT,
    tool_name               TEXT,
    input_text              TEXT,
    output_text             TEXT,
    error_text              TEXT,
    duration_ms             INTEGER NOT NULL DEFAULT 0,
    attributes              TEXT NOT NULL DEFAULT '{}',
    started_at              TEXT,
    completed_at            TEXT,
    created_at              TEXT NOT NULL,
    UNIQUE(tenant_id, trace_ref_id, external_span_id)
);

CREATE TABLE IF NOT EXISTS trace_event (
    id                     TEXT PRIMARY KEY NOT NULL,
    tenant_id              TEXT NOT NULL,
    trace_ref_id           TEXT NOT NULL REFERENCES trace(id) ON DELETE CASCADE,
    external_event_id      TEXT NOT NULL,
    name                   TEXT NOT NULL,
    type                   TEXT NOT NULL,
    level                  TEXT,
    message                TEXT,
    reason                 TEXT,
    span_external_id       TEXT,
    generation_external_id TEXT,
    attributes             TEXT NOT NULL DEFAULT '{}',
    timestamp              TEXT,
    created_at             TEXT NOT NULL,
    UNIQUE(tenant_id, trace_ref_id, external_event_id)
);

CREATE INDEX IF NOT EXISTS idx_checkpoint_thread ON checkpoint(tenant_id, thread_id, version);
CREATE INDEX IF NOT EXISTS idx_artifact_session ON artifact(tenant_id, session_id, created_at);
CREATE INDEX IF NOT EXISTS idx_trace_session ON trace(tenant_id, session_id);
CREATE INDEX IF NOT EXISTS idx_generation_trace ON trace_generation(trace_ref_id);
CREATE INDEX IF NOT EXISTS idx_span_trace ON trace_span(trace_ref_id);
CREATE INDEX IF NOT EXISTS idx_event_trace ON trace_event(trace_ref_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
