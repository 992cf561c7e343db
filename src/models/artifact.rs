//! Artifact model for generated or uploaded files tied to a chat session.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an artifact.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Creation requested; bytes not available yet.
    Pending,
    /// Bytes stored and retrievable.
    Ready,
    /// Generation or upload failed.
    Failed,
}

impl ArtifactStatus {
    /// Determine whether a status transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: ArtifactStatus) -> bool {
        matches!(
            (self, next),
            (
                ArtifactStatus::Pending,
                ArtifactStatus::Ready | ArtifactStatus::Failed
            )
        )
    }
}

/// A generated or uploaded object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Artifact {
    /// Unique record identifier.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Chat session the artifact belongs to.
    pub session_id: String,
    /// Message that produced the artifact, if any.
    pub message_id: Option<String>,
    /// Artifact type, e.g. `chart` or `export`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Display name.
    pub name: String,
    /// Lifecycle status.
    pub status: ArtifactStatus,
    /// Stored size in bytes.
    pub size_bytes: i64,
    /// Free-form key-value metadata.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Client-supplied key identifying one logical creation request.
    pub idempotency_key: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    /// Construct a pending artifact with a generated identifier.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        session_id: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            session_id: session_id.into(),
            message_id: None,
            kind: kind.into(),
            name: name.into(),
            status: ArtifactStatus::Pending,
            size_bytes: 0,
            metadata: BTreeMap::new(),
            idempotency_key: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Link the artifact to the message that produced it.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Set the idempotency key used to collapse duplicate creation requests.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Set the stored size.
    #[must_use]
    pub fn with_size_bytes(mut self, size_bytes: i64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
