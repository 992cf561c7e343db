//! Interrupt/resume state machine for one agent thread.
//!
//! [`ThreadRun`] owns the current checkpoint of a thread and applies each
//! suspend or resume as a whole-snapshot write. The in-memory checkpoint is
//! replaced only after the write succeeds, so a failed save leaves the run
//! exactly as it was before the call.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::config::RetryConfig;
use crate::models::checkpoint::{
    AgentPhase, Checkpoint, InterruptRecord, ThreadScope, ASK_USER_QUESTION,
};
use crate::models::message::{Message, ToolCall};
use crate::persistence::checkpoint_repo::CheckpointRepo;
use crate::retry::with_backoff;
use crate::{AppError, Result};

/// Result content recorded for a question call whose interrupt was cancelled.
pub const CANCELLED_ANSWER: &str = r#"{"cancelled":true}"#;

/// Live state of one thread during an invocation.
pub struct ThreadRun {
    store: CheckpointRepo,
    retry: RetryConfig,
    checkpoint: Checkpoint,
}

impl ThreadRun {
    /// Load the thread's latest checkpoint, or start an empty one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CorruptCheckpoint` if the stored snapshot cannot be
    /// decoded, or `AppError::Db` if loading fails after retries.
    pub async fn open(
        store: CheckpointRepo,
        retry: RetryConfig,
        scope: &ThreadScope,
        agent_name: &str,
    ) -> Result<Self> {
        let checkpoint = with_backoff(&retry, "checkpoint load", || {
            store.load_or_init(scope, agent_name)
        })
        .await?;
        Ok(Self {
            store,
            retry,
            checkpoint,
        })
    }

    /// Current snapshot.
    #[must_use]
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Phase implied by the current snapshot.
    #[must_use]
    pub fn phase(&self) -> AgentPhase {
        self.checkpoint.phase()
    }

    /// Drop local state and re-read the latest checkpoint.
    ///
    /// Used after `AppError::Conflict` before retrying the turn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CorruptCheckpoint` or `AppError::Db` like [`ThreadRun::open`].
    pub async fn reload(&mut self) -> Result<()> {
        let scope = self.checkpoint.scope();
        let agent_name = self.checkpoint.agent_name.clone();
        self.checkpoint = with_backoff(&self.retry, "checkpoint load", || {
            self.store.load_or_init(&scope, &agent_name)
        })
        .await?;
        Ok(())
    }

    /// Start a new user turn.
    ///
    /// An outstanding interrupt is cancelled implicitly. The turn is not
    /// persisted until the next suspend or completion.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if tool results are still
    /// outstanding.
    pub fn begin_turn(&mut self, message: Message) -> Result<()> {
        let phase = self.phase();
        if !phase.accepts_user_turn() {
            return Err(AppError::InvalidTransition(format!(
                "thread {} cannot accept a user turn while {phase:?}",
                self.checkpoint.thread_id
            )));
        }
        if phase == AgentPhase::InterruptPending {
            info!(thread_id = %self.checkpoint.thread_id, "new user turn cancels interrupt");
            clear_interrupt(&mut self.checkpoint, CANCELLED_ANSWER);
        }
        self.checkpoint.messages.push(message);
        Ok(())
    }

    /// Record tool calls requested by the model and persist them before
    /// any of them runs.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the thread is not running or
    /// `calls` is empty, and any persistence error from the save.
    pub async fn request_tools(
        &mut self,
        content: &str,
        calls: Vec<ToolCall>,
        response_id: Option<String>,
    ) -> Result<()> {
        self.ensure_transition(AgentPhase::ToolPending)?;
        if calls.is_empty() {
            return Err(AppError::InvalidTransition(
                "tool request without tool calls".into(),
            ));
        }

        let mut next = self.checkpoint.clone();
        let assistant =
            Message::assistant(&next.session_id, content).with_tool_calls(calls.clone());
        next.messages.push(assistant);
        next.pending_tools = calls;
        if response_id.is_some() {
            next.previous_response_id = response_id;
        }
        self.persist(next).await
    }

    /// Fold tool results into the conversation and resume.
    ///
    /// `results` maps call ids to tool output and must cover the pending
    /// set exactly. Tool messages are appended in the order the calls were
    /// issued.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if no tool results are awaited or
    /// the result set does not match the pending calls, and any persistence
    /// error from the save.
    pub async fn resume_tools(&mut self, results: &BTreeMap<String, String>) -> Result<()> {
        if self.phase() != AgentPhase::ToolPending {
            return Err(AppError::InvalidTransition(format!(
                "thread {} has no pending tool calls",
                self.checkpoint.thread_id
            )));
        }
        self.ensure_transition(AgentPhase::Running)?;

        let mut pending: Vec<&str> = self
            .checkpoint
            .pending_tools
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        pending.sort_unstable();
        let supplied: Vec<&str> = results.keys().map(String::as_str).collect();
        if pending != supplied {
            return Err(AppError::InvalidTransition(format!(
                "tool results {supplied:?} do not match pending calls {pending:?}"
            )));
        }

        let mut next = self.checkpoint.clone();
        for call in std::mem::take(&mut next.pending_tools) {
            let output = results.get(&call.id).cloned().unwrap_or_default();
            next.messages.push(Message::tool(&next.session_id, &call.id, output));
        }
        self.persist(next).await
    }

    /// Suspend the thread for human input.
    ///
    /// For [`ASK_USER_QUESTION`] interrupts the model's question call is
    /// recorded as a pending tool call, so answers fold back as its result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the thread is not running,
    /// `AppError::CorruptCheckpoint` if a question interrupt carries no
    /// readable questions, and any persistence error from the save.
    pub async fn interrupt(
        &mut self,
        record: InterruptRecord,
        question_call: Option<ToolCall>,
    ) -> Result<()> {
        if self.phase() != AgentPhase::Running {
            return Err(AppError::InvalidTransition(format!(
                "thread {} cannot be interrupted while {:?}",
                self.checkpoint.thread_id,
                self.phase()
            )));
        }
        self.ensure_transition(AgentPhase::InterruptPending)?;
        record.question_ids()?;

        let mut next = self.checkpoint.clone();
        if let Some(call) = question_call {
            let assistant =
                Message::assistant(&next.session_id, "").with_tool_calls(vec![call.clone()]);
            next.messages.push(assistant);
            next.pending_tools.push(call);
        }
        if record.previous_response_id.is_some() {
            next.previous_response_id.clone_from(&record.previous_response_id);
        }
        next.interrupt = Some(record);
        self.persist(next).await
    }

    /// Resume an interrupt with answers keyed by question id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyConsumed` if no interrupt is outstanding,
    /// `AppError::InvalidAnswers` if the answers do not match the question
    /// ids exactly, and any persistence error from the save.
    pub async fn submit_answers(&mut self, answers: &BTreeMap<String, String>) -> Result<()> {
        let Some(interrupt) = self.checkpoint.interrupt.as_ref() else {
            return Err(AppError::AlreadyConsumed(format!(
                "thread {} has no outstanding interrupt",
                self.checkpoint.thread_id
            )));
        };

        let expected = interrupt.question_ids()?;
        let missing: Vec<&String> = expected
            .iter()
            .filter(|id| !answers.contains_key(*id))
            .collect();
        if !missing.is_empty() {
            return Err(AppError::InvalidAnswers(format!(
                "missing answers for {missing:?}"
            )));
        }
        let unknown: Vec<&String> = answers
            .keys()
            .filter(|id| !expected.contains(*id))
            .collect();
        if !unknown.is_empty() {
            return Err(AppError::InvalidAnswers(format!(
                "unknown questions {unknown:?}"
            )));
        }

        let folded = serde_json::to_string(&answers)
            .map_err(|e| AppError::InvalidAnswers(format!("failed to encode answers: {e}")))?;

        let mut next = self.checkpoint.clone();
        if !fold_into_question_call(&mut next, &folded) {
            let user = Message::user(&next.session_id, folded, Vec::new());
            next.messages.push(user);
        }
        if let Some(record) = next.interrupt.take() {
            if record.previous_response_id.is_some() {
                next.previous_response_id = record.previous_response_id;
            }
        }
        self.persist(next).await
    }

    /// Clear the outstanding interrupt without answers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyConsumed` if no interrupt is outstanding,
    /// and any persistence error from the save.
    pub async fn cancel_interrupt(&mut self) -> Result<()> {
        if self.checkpoint.interrupt.is_none() {
            return Err(AppError::AlreadyConsumed(format!(
                "thread {} has no outstanding interrupt",
                self.checkpoint.thread_id
            )));
        }
        let mut next = self.checkpoint.clone();
        clear_interrupt(&mut next, CANCELLED_ANSWER);
        self.persist(next).await
    }

    /// Record the final answer of the turn with the provider continuation
    /// handle for the next model call.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the thread is not running,
    /// and any persistence error from the save.
    pub async fn complete(&mut self, answer: Message, response_id: Option<String>) -> Result<()> {
        self.ensure_transition(AgentPhase::Completed)?;
        if !matches!(&answer, Message::Assistant(m) if m.tool_calls.is_empty()) {
            return Err(AppError::InvalidTransition(
                "final answer must be an assistant message without tool calls".into(),
            ));
        }
        let mut next = self.checkpoint.clone();
        next.messages.push(answer);
        if response_id.is_some() {
            next.previous_response_id = response_id;
        }
        self.persist(next).await
    }

    fn ensure_transition(&self, next: AgentPhase) -> Result<()> {
        let current = self.phase();
        if current.can_transition_to(next) {
            Ok(())
        } else {
            Err(AppError::InvalidTransition(format!(
                "thread {} cannot move from {current:?} to {next:?}",
                self.checkpoint.thread_id
            )))
        }
    }

    async fn persist(&mut self, next: Checkpoint) -> Result<()> {
        let saved = with_backoff(&self.retry, "checkpoint save", || self.store.save(&next))
            .await
            .inspect_err(|err| {
                if matches!(err, AppError::Conflict(_)) {
                    warn!(thread_id = %next.thread_id, %err, "stale checkpoint; reload required");
                }
            })?;
        info!(
            thread_id = %saved.thread_id,
            version = saved.version,
            phase = ?saved.phase(),
            "checkpoint written"
        );
        self.checkpoint = saved;
        Ok(())
    }
}

/// Answer the pending question call with `content`, if there is one.
fn fold_into_question_call(checkpoint: &mut Checkpoint, content: &str) -> bool {
    let Some(pos) = checkpoint
        .pending_tools
        .iter()
        .position(|call| call.name == ASK_USER_QUESTION)
    else {
        return false;
    };
    let call = checkpoint.pending_tools.remove(pos);
    let reply = Message::tool(&checkpoint.session_id, call.id, content);
    checkpoint.messages.push(reply);
    true
}

fn clear_interrupt(checkpoint: &mut Checkpoint, content: &str) {
    fold_into_question_call(checkpoint, content);
    checkpoint.interrupt = None;
}
