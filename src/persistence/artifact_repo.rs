//! Artifact repository for `SQLite` persistence.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::models::artifact::{Artifact, ArtifactStatus};
use crate::{AppError, Result};

use super::db::Database;

const SELECT_COLUMNS: &str = "id, tenant_id, session_id, message_id, type, name, status,
     size_bytes, metadata, idempotency_key, created_at, updated_at";

/// Repository for artifact records.
#[derive(Clone)]
pub struct ArtifactRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ArtifactRow {
    id: String,
    tenant_id: String,
    session_id: String,
    message_id: Option<String>,
    #[sqlx(rename = "type")]
    kind: String,
    name: String,
    status: String,
    size_bytes: i64,
    metadata: String,
    idempotency_key: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ArtifactRow {
    fn into_artifact(self) -> Result<Artifact> {
        let status = parse_status(&self.status)?;
        let metadata: BTreeMap<String, serde_json::Value> = serde_json::from_str(&self.metadata)
            .map_err(|e| AppError::Db(format!("invalid artifact metadata: {e}")))?;
        let created_at = parse_time(&self.created_at, "created_at")?;
        let updated_at = parse_time(&self.updated_at, "updated_at")?;

        Ok(Artifact {
            id: self.id,
            tenant_id: self.tenant_id,
            session_id: self.session_id,
            message_id: self.message_id,
            kind: self.kind,
            name: self.name,
            status,
            size_bytes: self.size_bytes,
            metadata,
            idempotency_key: self.idempotency_key,
            created_at,
            updated_at,
        })
    }
}

fn parse_time(raw: &str, column: &str) -> Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}

fn parse_status(s: &str) -> Result<ArtifactStatus> {
    match s {
        "pending" => Ok(ArtifactStatus::Pending),
        "ready" => Ok(ArtifactStatus::Ready),
        "failed" => Ok(ArtifactStatus::Failed),
        other => Err(AppError::Db(format!("invalid artifact status: {other}"))),
    }
}

fn status_str(status: ArtifactStatus) -> &'static str {
    match status {
        ArtifactStatus::Pending => "pending",
        ArtifactStatus::Ready => "ready",
        ArtifactStatus::Failed => "failed",
    }
}

impl ArtifactRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert an artifact, collapsing duplicate requests.
    ///
    /// When an artifact with the same tenant and idempotency key already
    /// exists, the stored artifact is returned and nothing is written.
    /// Artifacts without a key are always inserted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert or lookup fails.
    pub async fn create(&self, artifact: &Artifact) -> Result<Artifact> {
        let metadata = serde_json::to_string(&artifact.metadata)
            .map_err(|e| AppError::Db(format!("failed to encode artifact metadata: {e}")))?;

        let result = sqlx::query(
            "INSERT INTO artifact (id, tenant_id, session_id, message_id, type, name, status,
                 size_bytes, metadata, idempotency_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(tenant_id, idempotency_key) DO NOTHING",
        )
        .bind(&artifact.id)
        .bind(&artifact.tenant_id)
        .bind(&artifact.session_id)
        .bind(&artifact.message_id)
        .bind(&artifact.kind)
        .bind(&artifact.name)
        .bind(status_str(artifact.status))
        .bind(artifact.size_bytes)
        .bind(&metadata)
        .bind(&artifact.idempotency_key)
        .bind(artifact.created_at.to_rfc3339())
        .bind(artifact.updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(artifact.clone());
        }

        let key = artifact.idempotency_key.as_deref().unwrap_or_default();
        debug!(idempotency_key = key, "duplicate artifact request collapsed");
        self.find_by_idempotency_key(&artifact.tenant_id, key)
            .await?
            .ok_or_else(|| AppError::Db(format!("artifact with key {key} vanished after conflict")))
    }

    /// Look up an artifact by its idempotency key.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<Artifact>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM artifact WHERE tenant_id = ?1 AND idempotency_key = ?2"
        );
        let row: Option<ArtifactRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(key)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(ArtifactRow::into_artifact).transpose()
    }

    /// Retrieve an artifact by identifier within a tenant.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such artifact exists for the tenant.
    pub async fn get(&self, tenant_id: &str, id: &str) -> Result<Artifact> {
        let sql = format!("SELECT {SELECT_COLUMNS} FROM artifact WHERE tenant_id = ?1 AND id = ?2");
        let row: Option<ArtifactRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.ok_or_else(|| AppError::NotFound(format!("artifact {id} not found")))?
            .into_artifact()
    }

    /// List a session's artifacts, newest first.
    ///
    /// `kind` restricts the result to one artifact type.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(
        &self,
        tenant_id: &str,
        session_id: &str,
        kind: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Artifact>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM artifact
             WHERE tenant_id = ?1 AND session_id = ?2 AND (?3 IS NULL OR type = ?3)
             ORDER BY created_at DESC, id DESC
             LIMIT ?4 OFFSET ?5"
        );
        let rows: Vec<ArtifactRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(session_id)
            .bind(kind)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(ArtifactRow::into_artifact).collect()
    }

    /// Move an artifact out of `pending`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the artifact does not exist, or
    /// `AppError::InvalidTransition` if the current status does not permit
    /// the move.
    pub async fn update_status(
        &self,
        tenant_id: &str,
        id: &str,
        status: ArtifactStatus,
        size_bytes: Option<i64>,
    ) -> Result<Artifact> {
        let current = self.get(tenant_id, id).await?;
        if !current.status.can_transition_to(status) {
            return Err(AppError::InvalidTransition(format!(
                "artifact {id} cannot move from {} to {}",
                status_str(current.status),
                status_str(status)
            )));
        }

        let updated_at = Utc::now();
        let size_bytes = size_bytes.unwrap_or(current.size_bytes);
        let result = sqlx::query(
            "UPDATE artifact SET status = ?1, size_bytes = ?2, updated_at = ?3
             WHERE tenant_id = ?4 AND id = ?5 AND status = ?6",
        )
        .bind(status_str(status))
        .bind(size_bytes)
        .bind(updated_at.to_rfc3339())
        .bind(tenant_id)
        .bind(id)
        .bind(status_str(current.status))
        .execute(self.db.as_ref())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::InvalidTransition(format!(
                "artifact {id} changed status concurrently"
            )));
        }

        Ok(Artifact {
            status,
            size_bytes,
            updated_at,
            ..current
        })
    }

    /// Delete one artifact.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such artifact exists for the tenant.
    pub async fn delete(&self, tenant_id: &str, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM artifact WHERE tenant_id = ?1 AND id = ?2")
            .bind(tenant_id)
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("artifact {id} not found")));
        }
        Ok(())
    }

    /// Delete every artifact of a session.
    ///
    /// Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_for_session(&self, tenant_id: &str, session_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM artifact WHERE tenant_id = ?1 AND session_id = ?2")
            .bind(tenant_id)
            .bind(session_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }
}
