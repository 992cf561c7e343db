//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// A newer checkpoint was written for the thread; reload and retry the turn.
    Conflict(String),
    /// A stored checkpoint could not be decoded. Never retried.
    CorruptCheckpoint(String),
    /// The requested move is not permitted from the thread's current phase.
    InvalidTransition(String),
    /// Submitted answers do not cover the outstanding interrupt.
    InvalidAnswers(String),
    /// Interrupt or tool call has already been resolved.
    AlreadyConsumed(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Storage failure while projecting a trace bundle.
    TraceIngest(String),
    /// A trace bundle is present but cannot be decoded. Never retried.
    MalformedTrace(String),
    /// Streaming transport or backend call failure.
    Transport(String),
    /// Stream was cancelled by the user.
    StreamAborted(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether the failure is worth retrying with backoff.
    ///
    /// Storage and transport failures are transient; corrupt state,
    /// conflicts, and rejected answers are semantic and surface as-is.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Db(_) | Self::TraceIngest(_) | Self::Transport(_) | Self::Io(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::CorruptCheckpoint(msg) => write!(f, "corrupt checkpoint: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::InvalidAnswers(msg) => write!(f, "invalid answers: {msg}"),
            Self::AlreadyConsumed(msg) => write!(f, "already consumed: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::TraceIngest(msg) => write!(f, "trace ingest: {msg}"),
            Self::MalformedTrace(msg) => write!(f, "malformed trace: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::StreamAborted(msg) => write!(f, "stream aborted: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}
