//! Checkpoint model: the complete resumable snapshot of one agent thread.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::{Message, ToolCall};
use super::payload::RawPayload;
use crate::{AppError, Result};

/// Tool invocation issued by the agent whose result has not returned yet.
pub type PendingToolCall = ToolCall;

/// Interrupt type for clarifying questions posed to the human.
pub const ASK_USER_QUESTION: &str = "ask_user_question";

/// Outstanding suspension waiting for human input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct InterruptRecord {
    /// Interrupt kind, e.g. [`ASK_USER_QUESTION`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Kind-specific payload such as the pending questions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RawPayload>,
    /// Provider continuation handle captured at suspension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
}

impl InterruptRecord {
    /// Construct an interrupt record.
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        data: Option<RawPayload>,
        previous_response_id: Option<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            data,
            previous_response_id,
        }
    }

    /// Question identifiers an [`ASK_USER_QUESTION`] interrupt expects answers for.
    ///
    /// Other interrupt kinds expect none.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CorruptCheckpoint` if the payload of a question
    /// interrupt is missing or malformed.
    pub fn question_ids(&self) -> Result<BTreeSet<String>> {
        if self.kind != ASK_USER_QUESTION {
            return Ok(BTreeSet::new());
        }
        let data = self.data.as_ref().ok_or_else(|| {
            AppError::CorruptCheckpoint("ask_user_question interrupt without data".into())
        })?;
        let payload: QuestionPayload = data.decode().map_err(|err| {
            AppError::CorruptCheckpoint(format!("invalid ask_user_question payload: {err}"))
        })?;
        Ok(payload.questions.into_iter().map(|q| q.id).collect())
    }
}

#[derive(Deserialize)]
struct QuestionPayload {
    #[serde(default)]
    questions: Vec<QuestionRef>,
}

#[derive(Deserialize)]
struct QuestionRef {
    id: String,
}

/// Identity of the thread a checkpoint belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub struct ThreadScope {
    /// Owning tenant.
    pub tenant_id: String,
    /// User driving the conversation.
    pub user_id: String,
    /// Chat session the thread lives in.
    pub session_id: String,
    /// Agent thread identifier.
    pub thread_id: String,
}

impl ThreadScope {
    /// Construct a thread scope.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        thread_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            thread_id: thread_id.into(),
        }
    }
}

/// Execution phase of an agent thread.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    /// The agent loop may call the model.
    Running,
    /// Waiting for results of recorded tool calls.
    ToolPending,
    /// Waiting for a human to answer or cancel.
    InterruptPending,
    /// Final answer produced; terminal for this invocation.
    Completed,
}

impl AgentPhase {
    /// Determine whether a transition is permitted within one invocation.
    #[must_use]
    pub fn can_transition_to(self, next: AgentPhase) -> bool {
        matches!(
            (self, next),
            (
                AgentPhase::Running,
                AgentPhase::ToolPending | AgentPhase::InterruptPending | AgentPhase::Completed
            ) | (
                AgentPhase::ToolPending | AgentPhase::InterruptPending,
                AgentPhase::Running
            ) | (AgentPhase::InterruptPending, AgentPhase::InterruptPending)
        )
    }

    /// Whether a new user turn (a fresh invocation) may start from this phase.
    #[must_use]
    pub fn accepts_user_turn(self) -> bool {
        matches!(
            self,
            AgentPhase::Running | AgentPhase::Completed | AgentPhase::InterruptPending
        )
    }
}

/// Atomic unit of resumability for one agent thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Checkpoint {
    /// Unique record identifier.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// User driving the conversation.
    pub user_id: String,
    /// Chat session the thread lives in.
    pub session_id: String,
    /// Agent thread identifier.
    pub thread_id: String,
    /// Agent that owns the thread.
    pub agent_name: String,
    /// Monotonic write counter; 0 means never saved.
    pub version: i64,
    /// Conversation so far.
    pub messages: Vec<Message>,
    /// Tool calls recorded but not yet answered.
    pub pending_tools: Vec<PendingToolCall>,
    /// Outstanding interrupt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<InterruptRecord>,
    /// Latest provider continuation handle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Empty, never-saved checkpoint for a thread with no history.
    #[must_use]
    pub fn empty(scope: &ThreadScope, agent_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: scope.tenant_id.clone(),
            user_id: scope.user_id.clone(),
            session_id: scope.session_id.clone(),
            thread_id: scope.thread_id.clone(),
            agent_name: agent_name.into(),
            version: 0,
            messages: Vec::new(),
            pending_tools: Vec::new(),
            interrupt: None,
            previous_response_id: None,
            created_at: Utc::now(),
        }
    }

    /// The thread this checkpoint belongs to.
    #[must_use]
    pub fn scope(&self) -> ThreadScope {
        ThreadScope::new(
            self.tenant_id.clone(),
            self.user_id.clone(),
            self.session_id.clone(),
            self.thread_id.clone(),
        )
    }

    /// Phase implied by the snapshot's pending state.
    #[must_use]
    pub fn phase(&self) -> AgentPhase {
        if self.interrupt.is_some() {
            return AgentPhase::InterruptPending;
        }
        if !self.pending_tools.is_empty() {
            return AgentPhase::ToolPending;
        }
        match self.messages.last() {
            Some(Message::Assistant(msg)) if msg.tool_calls.is_empty() => AgentPhase::Completed,
            _ => AgentPhase::Running,
        }
    }

    /// Encode the full snapshot as a JSON document.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CorruptCheckpoint` if a message cannot be encoded.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|err| {
            AppError::CorruptCheckpoint(format!("failed to encode checkpoint: {err}"))
        })
    }

    /// Decode a snapshot produced by [`Checkpoint::to_json`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::CorruptCheckpoint` on unknown roles or malformed payloads.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| {
            AppError::CorruptCheckpoint(format!("failed to decode checkpoint: {err}"))
        })
    }
}
