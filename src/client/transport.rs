//! Streaming transport boundary between the session orchestrator and the
//! backend agent loop.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::models::message::{Attachment, Message};
use crate::models::payload::RawPayload;
use crate::Result;

/// One frame of a streamed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Partial assistant text.
    Chunk {
        /// Token text to append.
        content: String,
    },
    /// The backend committed the user message to this session.
    UserMessage {
        /// Session the message was stored in.
        session_id: String,
    },
    /// The reply finished; the session can be reloaded.
    Done {
        /// Session to reload.
        session_id: String,
    },
    /// The backend gave up on the reply.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

/// Boxed chunk stream returned by [`ChatTransport::open_stream`].
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// Payload of one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// Target session; `None` asks the backend to create one.
    pub session_id: Option<String>,
    /// Message text.
    pub content: String,
    /// Uploaded attachments.
    pub attachments: Vec<Attachment>,
}

/// Interrupt surfaced to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInterrupt {
    /// Opaque identifier echoed back when answering.
    pub id: String,
    /// Interrupt kind, e.g. `ask_user_question`.
    pub kind: String,
    /// Kind-specific payload such as the questions.
    pub data: Option<RawPayload>,
}

/// Server-authoritative view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session identifier.
    pub session_id: String,
    /// Committed messages, oldest first.
    pub messages: Vec<Message>,
    /// Outstanding interrupt, if any.
    pub interrupt: Option<PendingInterrupt>,
}

/// Backend calls used by the orchestrator.
pub trait ChatTransport: Send + Sync {
    /// Start a reply stream. Implementations stop yielding once `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the stream cannot be opened.
    fn open_stream(
        &self,
        request: SendRequest,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<ChunkStream>> + Send + '_>>;

    /// Fetch the committed state of a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown sessions or
    /// `AppError::Transport` on failure.
    fn load_session(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<SessionSnapshot>> + Send + '_>>;

    /// Answer an interrupt.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyConsumed` or `AppError::InvalidAnswers` when
    /// the backend rejects the answers, or `AppError::Transport` on failure.
    fn submit_answers(
        &self,
        session_id: &str,
        interrupt_id: &str,
        answers: &BTreeMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Cancel an interrupt without answers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::AlreadyConsumed` when nothing is outstanding, or
    /// `AppError::Transport` on failure.
    fn cancel_interrupt(
        &self,
        session_id: &str,
        interrupt_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
