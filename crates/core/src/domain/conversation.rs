use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::context::ExecutionContext;
use crate::domain::hitl::HitlState;
use crate::errors::DomainError;

/// Stable identity of one conversation; exactly one actor owns each key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey(pub String);

impl ConversationKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Key used when a platform adapter does not supply its own scoping.
    pub fn for_chat(platform: &str, chat_id: &str) -> Self {
        Self(format!("{platform}:{chat_id}"))
    }

    /// Validates an externally supplied key: non-empty, at most 256
    /// characters, no whitespace or control characters.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let valid = !raw.is_empty()
            && raw.chars().count() <= 256
            && !raw.chars().any(|c| c.is_whitespace() || c.is_control());
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(DomainError::InvalidConversationKey(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }
}

/// Durable state owned by one conversation actor.
///
/// `pending_context` holds a message that was received but not yet started;
/// `active_context` holds the one currently executing. Each slot holds at
/// most one context. `pending_context` may fill (or be replaced) while a run
/// is active, and a new run never starts while `active_context` is occupied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationActorState {
    pub version: u64,
    pub messages: Vec<ChatMessage>,
    pub hitl: HitlState,
    pub pending_context: Option<ExecutionContext>,
    pub active_context: Option<ExecutionContext>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationActorState {
    pub fn new(session_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            version: 0,
            messages: Vec::new(),
            hitl: HitlState::new(session_id, now),
            pending_context: None,
            active_context: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends one message and evicts the oldest entries beyond `max_len`.
    pub fn push_message(&mut self, message: ChatMessage, max_len: usize) {
        self.messages.push(message);
        trim_history(&mut self.messages, max_len);
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
    }

    /// Moves the pending context into the active slot.
    ///
    /// Returns `false` (and changes nothing) when there is nothing pending or
    /// a run is already active.
    pub fn begin_processing(&mut self) -> bool {
        if self.active_context.is_some() {
            return false;
        }
        match self.pending_context.take() {
            Some(context) => {
                self.active_context = Some(context);
                true
            }
            None => false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.pending_context.is_none() && self.active_context.is_none()
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.updated_at = now;
    }
}

/// FIFO trim: keeps only the most recent `max_len` messages.
pub fn trim_history(messages: &mut Vec<ChatMessage>, max_len: usize) {
    if messages.len() > max_len {
        let overflow = messages.len() - max_len;
        messages.drain(..overflow);
    }
}
