//! Bounded agent loop driving one thread turn to its next suspend point.
//!
//! The model and the tool runtime are opaque collaborators behind
//! [`ChatModel`] and [`ToolExecutor`]. Every suspend or completion is
//! written through [`ThreadRun`] before control returns to the caller.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};

use super::thread_run::ThreadRun;
use crate::config::{AgentConfig, RetryConfig};
use crate::models::checkpoint::{
    InterruptRecord, PendingToolCall, ThreadScope, ASK_USER_QUESTION,
};
use crate::models::message::{Message, ToolCall};
use crate::models::payload::RawPayload;
use crate::observability::projection::TraceProjector;
use crate::persistence::checkpoint_repo::CheckpointRepo;
use crate::Result;

/// Conversation state handed to the model for one call.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    /// Messages so far, oldest first.
    pub messages: &'a [Message],
    /// Continuation handle from the previous call, if the provider issued one.
    pub previous_response_id: Option<&'a str>,
}

/// What the model decided to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelStep {
    /// Final answer; ends the turn.
    Answer {
        /// Answer text.
        content: String,
        /// Execution trace bundle for the turn.
        debug_trace: Option<RawPayload>,
    },
    /// Tools to run before the next model call.
    ToolCalls {
        /// Text emitted alongside the calls.
        content: String,
        /// Requested calls.
        calls: Vec<ToolCall>,
    },
    /// Clarifying questions for the human.
    AskUser {
        /// The model's question call; answers come back as its result.
        call: ToolCall,
        /// `{"questions":[{"id":..}, ..]}` payload.
        questions: RawPayload,
    },
}

/// One model call result.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    /// Decision.
    pub step: ModelStep,
    /// Continuation handle for the next call.
    pub response_id: Option<String>,
}

/// Opaque model provider.
pub trait ChatModel: Send + Sync {
    /// Produce the next step, streaming answer tokens into `tokens`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` when the provider call fails.
    fn generate<'a>(
        &'a self,
        request: ModelRequest<'a>,
        tokens: mpsc::Sender<String>,
    ) -> Pin<Box<dyn Future<Output = Result<ModelReply>> + Send + 'a>>;
}

/// Result of handing a tool call to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    /// The tool ran in-process; here is its output.
    Completed(String),
    /// The result will arrive later through [`AgentLoop::resume_tools`].
    Deferred,
}

/// Opaque tool runtime.
pub trait ToolExecutor: Send + Sync {
    /// Run or dispatch one tool call.
    ///
    /// # Errors
    ///
    /// Any error is reported to the model as the tool's result.
    fn execute<'a>(
        &'a self,
        call: &'a ToolCall,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutcome>> + Send + 'a>>;
}

/// Where a turn stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The model answered; the thread is completed.
    Completed {
        /// Final assistant message.
        answer: Message,
    },
    /// Some tool results are owed by an external actor.
    ToolPending {
        /// Calls awaiting results.
        calls: Vec<PendingToolCall>,
        /// Results already produced in-process, to resubmit with the rest.
        completed: BTreeMap<String, String>,
    },
    /// The thread waits for a human.
    Interrupted {
        /// Outstanding interrupt.
        interrupt: InterruptRecord,
    },
    /// The step budget ran out; the thread stays running.
    StepLimitReached {
        /// Model calls made.
        steps: u32,
    },
}

/// Drives threads through model and tool calls.
#[derive(Clone)]
pub struct AgentLoop {
    model: Arc<dyn ChatModel>,
    tools: Arc<dyn ToolExecutor>,
    store: CheckpointRepo,
    projector: TraceProjector,
    agent: AgentConfig,
    retry: RetryConfig,
}

impl AgentLoop {
    /// Create a loop over the given collaborators.
    #[must_use]
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: Arc<dyn ToolExecutor>,
        store: CheckpointRepo,
        projector: TraceProjector,
        agent: AgentConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            model,
            tools,
            store,
            projector,
            agent,
            retry,
        }
    }

    /// Run a new user turn on the thread.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Conflict` if another writer advanced the thread,
    /// `AppError::InvalidTransition` if tool results are outstanding, and any
    /// model or persistence failure.
    pub async fn run_turn(
        &self,
        scope: &ThreadScope,
        agent_name: &str,
        message: Message,
        tokens: mpsc::Sender<String>,
    ) -> Result<TurnOutcome> {
        let span = info_span!("run_turn", thread_id = %scope.thread_id);
        async {
            let mut run = self.open(scope, agent_name).await?;
            run.begin_turn(message)?;
            self.drive(&mut run, &scope.tenant_id, tokens).await
        }
        .instrument(span)
        .await
    }

    /// Deliver externally produced tool results and continue the turn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the results do not match the
    /// pending calls, and any model or persistence failure.
    pub async fn resume_tools(
        &self,
        scope: &ThreadScope,
        agent_name: &str,
        results: &BTreeMap<String, String>,
        tokens: mpsc::Sender<String>,
    ) -> Result<TurnOutcome> {
        let span = info_span!("resume_tools", thread_id = %scope.thread_id);
        async {
            let mut run = self.open(scope, agent_name).await?;
            run.resume_tools(results).await?;
            self.drive(&mut run, &scope.tenant_id, tokens).await
        }
        .instrument(span)
        .await
    }

    /// Answer the thread's interrupt and continue the turn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyConsumed` if the interrupt was already
    /// cleared, `AppError::InvalidAnswers` if answers are missing or unknown,
    /// and any model or persistence failure.
    pub async fn submit_answers(
        &self,
        scope: &ThreadScope,
        agent_name: &str,
        answers: &BTreeMap<String, String>,
        tokens: mpsc::Sender<String>,
    ) -> Result<TurnOutcome> {
        let span = info_span!("submit_answers", thread_id = %scope.thread_id);
        async {
            let mut run = self.open(scope, agent_name).await?;
            run.submit_answers(answers).await?;
            self.drive(&mut run, &scope.tenant_id, tokens).await
        }
        .instrument(span)
        .await
    }

    /// Cancel the thread's interrupt without continuing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyConsumed` if no interrupt is outstanding,
    /// and any persistence failure.
    pub async fn cancel_interrupt(&self, scope: &ThreadScope, agent_name: &str) -> Result<()> {
        let mut run = self.open(scope, agent_name).await?;
        run.cancel_interrupt().await
    }

    async fn open(&self, scope: &ThreadScope, agent_name: &str) -> Result<ThreadRun> {
        ThreadRun::open(self.store.clone(), self.retry.clone(), scope, agent_name).await
    }

    async fn drive(
        &self,
        run: &mut ThreadRun,
        tenant_id: &str,
        tokens: mpsc::Sender<String>,
    ) -> Result<TurnOutcome> {
        for step in 0..self.agent.max_steps {
            let reply = {
                let checkpoint = run.checkpoint();
                let request = ModelRequest {
                    messages: &checkpoint.messages,
                    previous_response_id: checkpoint.previous_response_id.as_deref(),
                };
                self.model.generate(request, tokens.clone()).await?
            };

            match reply.step {
                ModelStep::Answer {
                    content,
                    debug_trace,
                } => {
                    let mut answer = Message::assistant(&run.checkpoint().session_id, content);
                    if let Some(trace) = debug_trace {
                        answer = answer.with_debug_trace(trace);
                    }
                    run.complete(answer.clone(), reply.response_id).await?;
                    if let Err(err) = self.projector.ingest_with_retry(tenant_id, &answer).await {
                        warn!(%err, message_id = %answer.id(), "trace projection failed");
                    }
                    info!(steps = step + 1, "turn completed");
                    return Ok(TurnOutcome::Completed { answer });
                }
                ModelStep::ToolCalls { content, calls } => {
                    run.request_tools(&content, calls.clone(), reply.response_id)
                        .await?;
                    let (completed, deferred) = self.execute_tools(&calls).await;
                    if deferred {
                        info!(pending = calls.len(), "tool results deferred");
                        return Ok(TurnOutcome::ToolPending { calls, completed });
                    }
                    run.resume_tools(&completed).await?;
                }
                ModelStep::AskUser { call, questions } => {
                    let record =
                        InterruptRecord::new(ASK_USER_QUESTION, Some(questions), reply.response_id);
                    run.interrupt(record.clone(), Some(call)).await?;
                    info!("turn interrupted for user input");
                    return Ok(TurnOutcome::Interrupted { interrupt: record });
                }
            }
        }

        warn!(max_steps = self.agent.max_steps, "step limit reached");
        Ok(TurnOutcome::StepLimitReached {
            steps: self.agent.max_steps,
        })
    }

    /// Run every call; failures become error results for the model.
    async fn execute_tools(&self, calls: &[ToolCall]) -> (BTreeMap<String, String>, bool) {
        let mut completed = BTreeMap::new();
        let mut deferred = false;
        for call in calls {
            match self.tools.execute(call).await {
                Ok(ToolOutcome::Completed(output)) => {
                    completed.insert(call.id.clone(), output);
                }
                Ok(ToolOutcome::Deferred) => deferred = true,
                Err(err) => {
                    warn!(%err, tool = %call.name, call_id = %call.id, "tool execution failed");
                    let output = serde_json::json!({ "error": err.to_string() }).to_string();
                    completed.insert(call.id.clone(), output);
                }
            }
        }
        (completed, deferred)
    }
}
