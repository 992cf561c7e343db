//! Conversation message union and its role-tagged wire encoding.
//!
//! Every encoded message carries an explicit `role` discriminator. Decoding
//! reads the flat [`MessageRecord`] first, then switches on `role` to build
//! the concrete variant, rejecting fields that do not belong to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::payload::RawPayload;

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Human turn.
    User,
    /// Model turn.
    Assistant,
    /// Result of a tool invocation.
    Tool,
    /// Instructions injected by the application.
    System,
}

impl Role {
    /// Wire name of the role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ToolCall {
    /// Provider-assigned call identifier, echoed by the tool result.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Call arguments exactly as the provider produced them.
    pub arguments: String,
}

impl ToolCall {
    /// Construct a tool call.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// File attached to a user turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Attachment {
    /// Original file name.
    pub name: String,
    /// MIME type reported by the uploader.
    pub mime_type: String,
    /// Size in bytes.
    pub size_bytes: i64,
    /// Where the uploaded bytes can be fetched, once stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Human turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    /// Unique message identifier.
    pub id: String,
    /// Owning chat session.
    pub session_id: String,
    /// Message text.
    pub content: String,
    /// Uploaded files.
    pub attachments: Vec<Attachment>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Model turn, optionally requesting tools and carrying its trace bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantMessage {
    /// Unique message identifier.
    pub id: String,
    /// Owning chat session.
    pub session_id: String,
    /// Message text.
    pub content: String,
    /// Tool calls the model asked for in this turn.
    pub tool_calls: Vec<ToolCall>,
    /// Execution-trace bundle for observability, if the provider produced one.
    pub debug_trace: Option<RawPayload>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Tool result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolMessage {
    /// Unique message identifier.
    pub id: String,
    /// Owning chat session.
    pub session_id: String,
    /// Tool output.
    pub content: String,
    /// Identifier of the [`ToolCall`] this result answers.
    pub tool_call_id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Application-injected instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemMessage {
    /// Unique message identifier.
    pub id: String,
    /// Owning chat session.
    pub session_id: String,
    /// Instruction text.
    pub content: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Closed set of conversation messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MessageRecord", into = "MessageRecord")]
pub enum Message {
    /// Human turn.
    User(UserMessage),
    /// Model turn.
    Assistant(AssistantMessage),
    /// Tool result.
    Tool(ToolMessage),
    /// Application instructions.
    System(SystemMessage),
}

impl Message {
    /// Build a user message with a fresh identifier.
    #[must_use]
    pub fn user(
        session_id: impl Into<String>,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self::User(UserMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            content: content.into(),
            attachments,
            created_at: Utc::now(),
        })
    }

    /// Build an assistant message with no tool calls and no trace.
    #[must_use]
    pub fn assistant(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Assistant(AssistantMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            content: content.into(),
            tool_calls: Vec::new(),
            debug_trace: None,
            created_at: Utc::now(),
        })
    }

    /// Build a tool result answering `tool_call_id`.
    #[must_use]
    pub fn tool(
        session_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::Tool(ToolMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            content: content.into(),
            tool_call_id: tool_call_id.into(),
            created_at: Utc::now(),
        })
    }

    /// Build a system message.
    #[must_use]
    pub fn system(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::System(SystemMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            content: content.into(),
            created_at: Utc::now(),
        })
    }

    /// Attach tool calls; no-op on non-assistant variants.
    #[must_use]
    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        if let Self::Assistant(ref mut msg) = self {
            msg.tool_calls = calls;
        }
        self
    }

    /// Attach a trace bundle; no-op on non-assistant variants.
    #[must_use]
    pub fn with_debug_trace(mut self, trace: RawPayload) -> Self {
        if let Self::Assistant(ref mut msg) = self {
            msg.debug_trace = Some(trace);
        }
        self
    }

    /// Message discriminator.
    #[must_use]
    pub fn role(&self) -> Role {
        match self {
            Self::User(_) => Role::User,
            Self::Assistant(_) => Role::Assistant,
            Self::Tool(_) => Role::Tool,
            Self::System(_) => Role::System,
        }
    }

    /// Unique message identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::User(m) => &m.id,
            Self::Assistant(m) => &m.id,
            Self::Tool(m) => &m.id,
            Self::System(m) => &m.id,
        }
    }

    /// Owning chat session.
    #[must_use]
    pub fn session_id(&self) -> &str {
        match self {
            Self::User(m) => &m.session_id,
            Self::Assistant(m) => &m.session_id,
            Self::Tool(m) => &m.session_id,
            Self::System(m) => &m.session_id,
        }
    }

    /// Message text.
    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::User(m) => &m.content,
            Self::Assistant(m) => &m.content,
            Self::Tool(m) => &m.content,
            Self::System(m) => &m.content,
        }
    }

    /// Creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::User(m) => m.created_at,
            Self::Assistant(m) => m.created_at,
            Self::Tool(m) => m.created_at,
            Self::System(m) => m.created_at,
        }
    }

    /// Tool call answered by this message, for tool results.
    #[must_use]
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Self::Tool(m) => Some(&m.tool_call_id),
            _ => None,
        }
    }

    /// Trace bundle, for assistant turns that carry one.
    #[must_use]
    pub fn debug_trace(&self) -> Option<&RawPayload> {
        match self {
            Self::Assistant(m) => m.debug_trace.as_ref(),
            _ => None,
        }
    }
}

/// Flat wire shape shared by every message variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MessageRecord {
    /// Variant discriminator; always present.
    pub role: Role,
    /// Unique message identifier.
    pub id: String,
    /// Owning chat session.
    pub session_id: String,
    /// Message text.
    pub content: String,
    /// Tool results only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Assistant turns only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// User turns only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Assistant turns only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_trace: Option<RawPayload>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    fn reject_foreign_fields(&self) -> Result<(), String> {
        let role = self.role.as_str();
        if self.role != Role::Tool && self.tool_call_id.is_some() {
            return Err(format!("tool_call_id is not allowed on {role} messages"));
        }
        if self.role != Role::Assistant && !self.tool_calls.is_empty() {
            return Err(format!("tool_calls are not allowed on {role} messages"));
        }
        if self.role != Role::Assistant && self.debug_trace.is_some() {
            return Err(format!("debug_trace is not allowed on {role} messages"));
        }
        if self.role != Role::User && !self.attachments.is_empty() {
            return Err(format!("attachments are not allowed on {role} messages"));
        }
        Ok(())
    }
}

impl TryFrom<MessageRecord> for Message {
    type Error = String;

    fn try_from(record: MessageRecord) -> Result<Self, Self::Error> {
        record.reject_foreign_fields()?;
        let message = match record.role {
            Role::User => Self::User(UserMessage {
                id: record.id,
                session_id: record.session_id,
                content: record.content,
                attachments: record.attachments,
                created_at: record.created_at,
            }),
            Role::Assistant => Self::Assistant(AssistantMessage {
                id: record.id,
                session_id: record.session_id,
                content: record.content,
                tool_calls: record.tool_calls,
                debug_trace: record.debug_trace,
                created_at: record.created_at,
            }),
            Role::Tool => {
                let tool_call_id = record
                    .tool_call_id
                    .filter(|id| !id.trim().is_empty())
                    .ok_or_else(|| "tool messages require a tool_call_id".to_owned())?;
                Self::Tool(ToolMessage {
                    id: record.id,
                    session_id: record.session_id,
                    content: record.content,
                    tool_call_id,
                    created_at: record.created_at,
                })
            }
            Role::System => Self::System(SystemMessage {
                id: record.id,
                session_id: record.session_id,
                content: record.content,
                created_at: record.created_at,
            }),
        };
        Ok(message)
    }
}

impl From<Message> for MessageRecord {
    fn from(message: Message) -> Self {
        let role = message.role();
        match message {
            Message::User(m) => Self {
                role,
                id: m.id,
                session_id: m.session_id,
                content: m.content,
                tool_call_id: None,
                tool_calls: Vec::new(),
                attachments: m.attachments,
                debug_trace: None,
                created_at: m.created_at,
            },
            Message::Assistant(m) => Self {
                role,
                id: m.id,
                session_id: m.session_id,
                content: m.content,
                tool_call_id: None,
                tool_calls: m.tool_calls,
                attachments: Vec::new(),
                debug_trace: m.debug_trace,
                created_at: m.created_at,
            },
            Message::Tool(m) => Self {
                role,
                id: m.id,
                session_id: m.session_id,
                content: m.content,
                tool_call_id: Some(m.tool_call_id),
                tool_calls: Vec::new(),
                attachments: Vec::new(),
                debug_trace: None,
                created_at: m.created_at,
            },
            Message::System(m) => Self {
                role,
                id: m.id,
                session_id: m.session_id,
                content: m.content,
                tool_call_id: None,
                tool_calls: Vec::new(),
                attachments: Vec::new(),
                debug_trace: None,
                created_at: m.created_at,
            },
        }
    }
}
