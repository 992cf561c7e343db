//! Streaming session orchestrator: the client-side owner of one
//! conversation's live state.
//!
//! One send is in flight at a time. While it streams, the local message
//! list holds an optimistic copy of the user turn; once the backend reports
//! `done`, the list is replaced by the reloaded authoritative session.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::rate_limit::{Admission, RateLimiter};
use super::transport::{ChatTransport, PendingInterrupt, SendRequest, StreamChunk};
use crate::config::RateLimitConfig;
use crate::models::message::{Attachment, Message};
use crate::{AppError, Result};

/// Result of a send attempt. Only `Failed` restores the draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The reply finished and the session was reconciled.
    Completed,
    /// Another send is in flight; nothing was sent.
    Busy,
    /// The request budget is exhausted; nothing was sent.
    RateLimited {
        /// Wait before the next attempt can be admitted.
        retry_after: Duration,
    },
    /// Added to the send queue behind the in-flight request.
    Queued {
        /// Queue length after insertion.
        position: usize,
    },
    /// The user cancelled the reply.
    Cancelled,
    /// The send failed; the optimistic message was rolled back.
    Failed {
        /// Error shown to the user.
        error: String,
    },
}

#[derive(Debug, Clone)]
struct QueuedSend {
    content: String,
    attachments: Vec<Attachment>,
}

/// Point-in-time copy of the orchestrator state for rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionView {
    /// Session identifier once the backend assigned one.
    pub session_id: Option<String>,
    /// Draft input text.
    pub input: String,
    /// Committed messages plus the optimistic user turn, if any.
    pub messages: Vec<Message>,
    /// Assistant text streamed so far.
    pub streaming_content: String,
    /// A reply stream is open.
    pub is_streaming: bool,
    /// A send is in flight.
    pub is_loading: bool,
    /// Outstanding interrupt.
    pub interrupt: Option<PendingInterrupt>,
    /// Last error shown to the user.
    pub error: Option<String>,
    /// Sends waiting behind the in-flight one.
    pub queued: usize,
}

struct SessionState {
    view: SessionView,
    optimistic_id: Option<String>,
    queue: VecDeque<QueuedSend>,
    cancel: Option<CancellationToken>,
    limiter: RateLimiter,
}

enum StreamEnd {
    Done(String),
    Cancelled,
    Failed(String),
}

/// Owns one open conversation.
#[derive(Clone)]
pub struct SessionOrchestrator {
    transport: Arc<dyn ChatTransport>,
    state: Arc<Mutex<SessionState>>,
}

impl SessionOrchestrator {
    /// Create an orchestrator for a new conversation.
    #[must_use]
    pub fn new(transport: Arc<dyn ChatTransport>, rate_limit: &RateLimitConfig) -> Self {
        let state = SessionState {
            view: SessionView::default(),
            optimistic_id: None,
            queue: VecDeque::new(),
            cancel: None,
            limiter: RateLimiter::new(rate_limit),
        };
        Self {
            transport,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Open an existing session and load its committed state.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the session cannot be loaded.
    pub async fn open(
        transport: Arc<dyn ChatTransport>,
        rate_limit: &RateLimitConfig,
        session_id: &str,
    ) -> Result<Self> {
        let orchestrator = Self::new(transport, rate_limit);
        orchestrator.reload(session_id).await?;
        Ok(orchestrator)
    }

    /// Snapshot of the current state.
    pub async fn view(&self) -> SessionView {
        let state = self.state.lock().await;
        let mut view = state.view.clone();
        view.queued = state.queue.len();
        view
    }

    /// Current message list.
    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.view.messages.clone()
    }

    /// Draft input text.
    pub async fn input(&self) -> String {
        self.state.lock().await.view.input.clone()
    }

    /// Replace the draft input text.
    pub async fn set_input(&self, text: impl Into<String>) {
        self.state.lock().await.view.input = text.into();
    }

    /// Assistant text streamed so far.
    pub async fn streaming_content(&self) -> String {
        self.state.lock().await.view.streaming_content.clone()
    }

    /// Outstanding interrupt.
    pub async fn interrupt(&self) -> Option<PendingInterrupt> {
        self.state.lock().await.view.interrupt.clone()
    }

    /// Whether a send is in flight.
    pub async fn is_loading(&self) -> bool {
        self.state.lock().await.view.is_loading
    }

    /// Send a user turn and stream the reply.
    ///
    /// Rejected without I/O when another send is in flight or the rate
    /// limit is exhausted. After a completed reply, queued sends are drained
    /// in order.
    pub async fn send(&self, content: &str, attachments: Vec<Attachment>) -> SendOutcome {
        let outcome = self.send_one(content, attachments).await;
        if outcome == SendOutcome::Completed {
            self.flush_queue().await;
        }
        outcome
    }

    /// Send now if idle, otherwise queue behind the in-flight send and any
    /// turns already waiting.
    pub async fn enqueue(&self, content: &str, attachments: Vec<Attachment>) -> SendOutcome {
        {
            let mut state = self.state.lock().await;
            if state.view.is_loading || !state.queue.is_empty() {
                state.queue.push_back(QueuedSend {
                    content: content.to_owned(),
                    attachments,
                });
                let position = state.queue.len();
                debug!(position, "send queued");
                return SendOutcome::Queued { position };
            }
        }
        self.send(content, attachments).await
    }

    /// Abort the in-flight reply stream.
    ///
    /// Returns `false` when nothing is streaming.
    pub async fn cancel(&self) -> bool {
        let state = self.state.lock().await;
        match &state.cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Re-send the user turn behind `message_id` as a new turn.
    ///
    /// For an assistant message the closest preceding user turn is used.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such user turn exists locally.
    pub async fn regenerate(&self, message_id: &str) -> Result<SendOutcome> {
        let (content, attachments) = {
            let state = self.state.lock().await;
            let messages = &state.view.messages;
            let pos = messages
                .iter()
                .position(|m| m.id() == message_id)
                .ok_or_else(|| AppError::NotFound(format!("message {message_id} not found")))?;
            messages[..=pos]
                .iter()
                .rev()
                .find_map(|m| match m {
                    Message::User(user) => Some((user.content.clone(), user.attachments.clone())),
                    _ => None,
                })
                .ok_or_else(|| {
                    AppError::NotFound(format!("no user turn precedes message {message_id}"))
                })?
        };
        Ok(self.send(&content, attachments).await)
    }

    /// Send edited content for a past user turn as a new turn.
    ///
    /// History is never rewritten; the original turn stays in place.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `message_id` is not a local user turn.
    pub async fn edit(&self, message_id: &str, content: &str) -> Result<SendOutcome> {
        let attachments = {
            let state = self.state.lock().await;
            state
                .view
                .messages
                .iter()
                .find_map(|m| match m {
                    Message::User(user) if user.id == message_id => Some(user.attachments.clone()),
                    _ => None,
                })
                .ok_or_else(|| AppError::NotFound(format!("user message {message_id} not found")))?
        };
        Ok(self.send(content, attachments).await)
    }

    /// Answer the outstanding interrupt `interrupt_id`.
    ///
    /// The interrupt is cleared locally first and restored, with the error
    /// surfaced, if the backend rejects the answers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyConsumed` without contacting the backend if
    /// `interrupt_id` is not the outstanding interrupt, or the backend's
    /// rejection.
    pub async fn submit_answers(
        &self,
        interrupt_id: &str,
        answers: &BTreeMap<String, String>,
    ) -> Result<()> {
        let (session_id, interrupt) = self.take_interrupt(interrupt_id).await?;
        let result = self
            .transport
            .submit_answers(&session_id, &interrupt.id, answers)
            .await;
        self.settle_interrupt(&session_id, interrupt, result).await
    }

    /// Cancel the outstanding interrupt `interrupt_id` without answers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyConsumed` without contacting the backend if
    /// `interrupt_id` is not the outstanding interrupt, or the backend's
    /// rejection.
    pub async fn cancel_interrupt(&self, interrupt_id: &str) -> Result<()> {
        let (session_id, interrupt) = self.take_interrupt(interrupt_id).await?;
        let result = self
            .transport
            .cancel_interrupt(&session_id, &interrupt.id)
            .await;
        self.settle_interrupt(&session_id, interrupt, result).await
    }

    /// Replace local state with the backend's committed session.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the session cannot be loaded.
    pub async fn reload(&self, session_id: &str) -> Result<()> {
        let snapshot = self.transport.load_session(session_id).await?;
        let mut state = self.state.lock().await;
        state.view.session_id = Some(snapshot.session_id);
        state.view.messages = snapshot.messages;
        state.view.interrupt = snapshot.interrupt;
        state.optimistic_id = None;
        Ok(())
    }

    async fn take_interrupt(&self, interrupt_id: &str) -> Result<(String, PendingInterrupt)> {
        let mut state = self.state.lock().await;
        let session_id = state
            .view
            .session_id
            .clone()
            .ok_or_else(|| AppError::AlreadyConsumed("session has no interrupt".into()))?;
        match state.view.interrupt.as_ref() {
            None => {
                return Err(AppError::AlreadyConsumed(format!(
                    "interrupt {interrupt_id} is no longer outstanding"
                )));
            }
            Some(current) if current.id != interrupt_id => {
                return Err(AppError::AlreadyConsumed(format!(
                    "interrupt {interrupt_id} was superseded by {}",
                    current.id
                )));
            }
            Some(_) => {}
        }
        let interrupt = state
            .view
            .interrupt
            .take()
            .ok_or_else(|| AppError::AlreadyConsumed("no outstanding interrupt".into()))?;
        state.view.error = None;
        Ok((session_id, interrupt))
    }

    async fn settle_interrupt(
        &self,
        session_id: &str,
        interrupt: PendingInterrupt,
        result: Result<()>,
    ) -> Result<()> {
        if let Err(err) = result {
            warn!(%err, interrupt_id = %interrupt.id, "interrupt resolution rejected");
            let mut state = self.state.lock().await;
            state.view.interrupt = Some(interrupt);
            state.view.error = Some(err.to_string());
            return Err(err);
        }
        if let Err(err) = self.reload(session_id).await {
            warn!(%err, session_id, "reload after interrupt resolution failed");
        }
        Ok(())
    }

    /// Send queued turns until the queue is empty or a send does not complete.
    ///
    /// A queued turn that could not be admitted stays at the head of the
    /// queue; call this again once the rate limit allows.
    pub async fn flush_queue(&self) -> Option<SendOutcome> {
        let mut last = None;
        loop {
            let next = self.state.lock().await.queue.pop_front();
            let Some(queued) = next else {
                return last;
            };
            let outcome = self
                .send_one(&queued.content, queued.attachments.clone())
                .await;
            debug!(?outcome, "queued send finished");
            match outcome {
                SendOutcome::Completed => {}
                SendOutcome::Busy | SendOutcome::RateLimited { .. } => {
                    let mut state = self.state.lock().await;
                    if let SendOutcome::RateLimited { retry_after } = &outcome {
                        state.view.error = Some(format!(
                            "queued message held back; retry in {}s",
                            retry_after.as_secs().max(1)
                        ));
                    }
                    state.queue.push_front(queued);
                    return Some(outcome);
                }
                // The draft already holds the failed content.
                SendOutcome::Queued { .. }
                | SendOutcome::Cancelled
                | SendOutcome::Failed { .. } => return Some(outcome),
            }
            last = Some(outcome);
        }
    }

    async fn send_one(&self, content: &str, attachments: Vec<Attachment>) -> SendOutcome {
        let span = info_span!("send", content_len = content.len());
        async {
            let (request, cancel) = match self.admit(content, attachments).await {
                Ok(admitted) => admitted,
                Err(rejected) => return rejected,
            };
            let end = self.stream_reply(request, cancel).await;
            self.finish(content, end).await
        }
        .instrument(span)
        .await
    }

    /// Single-flight and rate-limit checks, then the optimistic append.
    async fn admit(
        &self,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> std::result::Result<(SendRequest, CancellationToken), SendOutcome> {
        let mut state = self.state.lock().await;
        if state.view.is_loading {
            debug!("send rejected: request in flight");
            return Err(SendOutcome::Busy);
        }
        if let Admission::Limited { retry_after } = state.limiter.try_acquire() {
            debug!(?retry_after, "send rejected: rate limited");
            return Err(SendOutcome::RateLimited { retry_after });
        }

        let session_id = state.view.session_id.clone();
        let optimistic = Message::user(
            session_id.clone().unwrap_or_default(),
            content,
            attachments.clone(),
        );
        state.optimistic_id = Some(optimistic.id().to_owned());
        state.view.messages.push(optimistic);
        state.view.input.clear();
        state.view.error = None;
        state.view.streaming_content.clear();
        state.view.is_loading = true;
        state.view.is_streaming = true;

        let cancel = CancellationToken::new();
        state.cancel = Some(cancel.clone());

        let request = SendRequest {
            session_id,
            content: content.to_owned(),
            attachments,
        };
        Ok((request, cancel))
    }

    async fn stream_reply(&self, request: SendRequest, cancel: CancellationToken) -> StreamEnd {
        let mut stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return StreamEnd::Cancelled,
            opened = self.transport.open_stream(request, cancel.clone()) => match opened {
                Ok(stream) => stream,
                Err(err) => return StreamEnd::Failed(err.to_string()),
            },
        };

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!("stream cancelled by user");
                    return StreamEnd::Cancelled;
                }

                item = stream.next() => match item {
                    None => {
                        return StreamEnd::Failed("stream ended without a terminal chunk".into());
                    }
                    Some(Err(err)) => return StreamEnd::Failed(err.to_string()),
                    Some(Ok(StreamChunk::Chunk { content })) => {
                        self.state.lock().await.view.streaming_content.push_str(&content);
                    }
                    Some(Ok(StreamChunk::UserMessage { session_id })) => {
                        let mut state = self.state.lock().await;
                        if state.view.session_id.is_none() {
                            state.view.session_id = Some(session_id);
                        }
                    }
                    Some(Ok(StreamChunk::Done { session_id })) => {
                        return StreamEnd::Done(session_id);
                    }
                    Some(Ok(StreamChunk::Error { message })) => return StreamEnd::Failed(message),
                },
            }
        }
    }

    async fn finish(&self, content: &str, end: StreamEnd) -> SendOutcome {
        let outcome = match end {
            StreamEnd::Done(session_id) => {
                if let Err(err) = self.reload(&session_id).await {
                    warn!(%err, session_id, "reload after reply failed; keeping optimistic state");
                    self.state.lock().await.view.error = Some(err.to_string());
                }
                info!(session_id, "reply completed");
                SendOutcome::Completed
            }
            StreamEnd::Cancelled => {
                info!("reply cancelled");
                self.state.lock().await.optimistic_id = None;
                SendOutcome::Cancelled
            }
            StreamEnd::Failed(error) => {
                warn!(%error, "send failed; restoring draft");
                let mut state = self.state.lock().await;
                if let Some(id) = state.optimistic_id.take() {
                    state.view.messages.retain(|m| m.id() != id);
                }
                state.view.input = content.to_owned();
                state.view.error = Some(error.clone());
                SendOutcome::Failed { error }
            }
        };

        let mut state = self.state.lock().await;
        state.view.is_loading = false;
        state.view.is_streaming = false;
        state.view.streaming_content.clear();
        state.cancel = None;
        outcome
    }
}
