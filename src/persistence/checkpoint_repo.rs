//! Checkpoint repository for `SQLite` persistence.
//!
//! Every save inserts a new row with the next version; rows are never
//! updated in place. The row with the highest version is the current
//! checkpoint of its thread, older rows are audit history.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::models::checkpoint::{Checkpoint, InterruptRecord, PendingToolCall, ThreadScope};
use crate::models::message::Message;
use crate::models::payload::RawPayload;
use crate::{AppError, Result};

use super::db::Database;

const SELECT_COLUMNS: &str = "id, tenant_id, user_id, session_id, thread_id, agent_name, version,
     messages, pending_tools, interrupt_type, interrupt_data, interrupt_response_id,
     previous_response_id, created_at";

/// Repository wrapper around `SQLite` for checkpoint records.
#[derive(Clone)]
pub struct CheckpointRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct CheckpointRow {
    id: String,
    tenant_id: String,
    user_id: String,
    session_id: String,
    thread_id: String,
    agent_name: String,
    version: i64,
    messages: String,
    pending_tools: String,
    interrupt_type: Option<String>,
    interrupt_data: Option<String>,
    interrupt_response_id: Option<String>,
    previous_response_id: Option<String>,
    created_at: String,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<Checkpoint> {
        let messages: Vec<Message> = serde_json::from_str(&self.messages).map_err(|e| {
            AppError::CorruptCheckpoint(format!("checkpoint {}: invalid messages: {e}", self.id))
        })?;
        let pending_tools: Vec<PendingToolCall> = serde_json::from_str(&self.pending_tools)
            .map_err(|e| {
                AppError::CorruptCheckpoint(format!(
                    "checkpoint {}: invalid pending tools: {e}",
                    self.id
                ))
            })?;

        let interrupt = match (self.interrupt_type, self.interrupt_data) {
            (Some(kind), data) => {
                let data = data
                    .map(RawPayload::from_json)
                    .transpose()
                    .map_err(|e| {
                        AppError::CorruptCheckpoint(format!(
                            "checkpoint {}: invalid interrupt data: {e}",
                            self.id
                        ))
                    })?;
                Some(InterruptRecord::new(kind, data, self.interrupt_response_id))
            }
            (None, Some(_)) => {
                return Err(AppError::CorruptCheckpoint(format!(
                    "checkpoint {}: interrupt data without type",
                    self.id
                )));
            }
            (None, None) => None,
        };

        let created_at = chrono::DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| AppError::Db(format!("invalid created_at: {e}")))?
            .with_timezone(&Utc);

        Ok(Checkpoint {
            id: self.id,
            tenant_id: self.tenant_id,
            user_id: self.user_id,
            session_id: self.session_id,
            thread_id: self.thread_id,
            agent_name: self.agent_name,
            version: self.version,
            messages,
            pending_tools,
            interrupt,
            previous_response_id: self.previous_response_id,
            created_at,
        })
    }
}

fn encode<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| AppError::CorruptCheckpoint(format!("failed to encode {what}: {e}")))
}

impl CheckpointRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Return the latest checkpoint of a thread, or an empty one.
    ///
    /// Absence is not an error: a thread with no history gets a version-0
    /// checkpoint with no messages and no pending state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails, or
    /// `AppError::CorruptCheckpoint` if the stored row cannot be decoded.
    pub async fn load_or_init(&self, scope: &ThreadScope, agent_name: &str) -> Result<Checkpoint> {
        match self.latest(&scope.tenant_id, &scope.thread_id).await? {
            Some(checkpoint) => Ok(checkpoint),
            None => Ok(Checkpoint::empty(scope, agent_name)),
        }
    }

    /// Return the latest checkpoint of a thread, if any was saved.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails, or
    /// `AppError::CorruptCheckpoint` if the stored row cannot be decoded.
    pub async fn latest(&self, tenant_id: &str, thread_id: &str) -> Result<Option<Checkpoint>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM checkpoint
             WHERE tenant_id = ?1 AND thread_id = ?2
             ORDER BY version DESC LIMIT 1"
        );
        let row: Option<CheckpointRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(thread_id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    /// Persist a new snapshot superseding the caller's version.
    ///
    /// The caller passes the checkpoint it loaded (with its modifications);
    /// the stored row receives a fresh id, `version + 1`, and the current
    /// time. The saved checkpoint is returned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if another writer saved a newer version
    /// of the thread since the caller loaded it, `AppError::CorruptCheckpoint`
    /// if the snapshot cannot be encoded, or `AppError::Db` on storage failure.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<Checkpoint> {
        let span = info_span!(
            "save_checkpoint",
            thread_id = %checkpoint.thread_id,
            version = checkpoint.version
        );
        self.save_inner(checkpoint).instrument(span).await
    }

    async fn save_inner(&self, checkpoint: &Checkpoint) -> Result<Checkpoint> {
        let messages = encode(&checkpoint.messages, "messages")?;
        let pending_tools = encode(&checkpoint.pending_tools, "pending tools")?;
        let (interrupt_type, interrupt_data, interrupt_response_id) = match &checkpoint.interrupt {
            Some(record) => (
                Some(record.kind.as_str()),
                record.data.as_ref().map(RawPayload::get),
                record.previous_response_id.as_deref(),
            ),
            None => (None, None, None),
        };

        let mut saved = checkpoint.clone();
        saved.id = Uuid::new_v4().to_string();
        saved.version = checkpoint.version + 1;
        saved.created_at = Utc::now();

        let mut tx = self.db.begin().await?;

        let (latest,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM checkpoint
             WHERE tenant_id = ?1 AND thread_id = ?2",
        )
        .bind(&checkpoint.tenant_id)
        .bind(&checkpoint.thread_id)
        .fetch_one(&mut *tx)
        .await?;

        if latest != checkpoint.version {
            return Err(AppError::Conflict(format!(
                "thread {} is at version {latest}, save was based on version {}",
                checkpoint.thread_id, checkpoint.version
            )));
        }

        let insert = sqlx::query(
            "INSERT INTO checkpoint (id, tenant_id, user_id, session_id, thread_id, agent_name,
                 version, messages, pending_tools, interrupt_type, interrupt_data,
                 interrupt_response_id, previous_response_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(&saved.id)
        .bind(&saved.tenant_id)
        .bind(&saved.user_id)
        .bind(&saved.session_id)
        .bind(&saved.thread_id)
        .bind(&saved.agent_name)
        .bind(saved.version)
        .bind(&messages)
        .bind(&pending_tools)
        .bind(interrupt_type)
        .bind(interrupt_data)
        .bind(interrupt_response_id)
        .bind(&saved.previous_response_id)
        .bind(saved.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        match insert {
            Ok(_) => {}
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                return Err(AppError::Conflict(format!(
                    "thread {} version {} was written concurrently",
                    saved.thread_id, saved.version
                )));
            }
            Err(err) => return Err(err.into()),
        }

        tx.commit().await?;
        debug!(checkpoint_id = %saved.id, version = saved.version, "checkpoint saved");
        Ok(saved)
    }

    /// Retrieve a checkpoint by identifier within a tenant.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the checkpoint does not exist, or
    /// `AppError::CorruptCheckpoint` if it cannot be decoded.
    pub async fn get_by_id(&self, tenant_id: &str, id: &str) -> Result<Checkpoint> {
        let sql =
            format!("SELECT {SELECT_COLUMNS} FROM checkpoint WHERE tenant_id = ?1 AND id = ?2");
        let row: Option<CheckpointRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.ok_or_else(|| AppError::NotFound(format!("checkpoint {id} not found")))?
            .into_checkpoint()
    }

    /// List all stored versions of a thread, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails, or
    /// `AppError::CorruptCheckpoint` if any row cannot be decoded.
    pub async fn history(&self, tenant_id: &str, thread_id: &str) -> Result<Vec<Checkpoint>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM checkpoint
             WHERE tenant_id = ?1 AND thread_id = ?2
             ORDER BY version DESC"
        );
        let rows: Vec<CheckpointRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(thread_id)
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
    }

    /// Delete every stored version of a thread.
    ///
    /// Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_thread(&self, tenant_id: &str, thread_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM checkpoint WHERE tenant_id = ?1 AND thread_id = ?2")
            .bind(tenant_id)
            .bind(thread_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete superseded versions written before `before`.
    ///
    /// The latest version of every thread is kept regardless of age.
    /// Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn purge_superseded(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM checkpoint WHERE created_at < ?1 AND version < (
                 SELECT MAX(latest.version) FROM checkpoint AS latest
                 WHERE latest.tenant_id = checkpoint.tenant_id
                   AND latest.thread_id = checkpoint.thread_id)",
        )
        .bind(before.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected())
    }
}
