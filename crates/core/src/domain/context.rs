use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::conversation::ChatMessage;
use crate::domain::io::ParsedInput;
use crate::trace::TraceAccumulator;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(pub String);

impl SpanId {
    pub fn generate() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(raw[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider/model pair the responder should use for this message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub provider: String,
    pub model: String,
}

/// Per-message bundle carried from `receive_message` through processing.
///
/// `deadline` is a soft budget: nothing here cancels work when it passes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub platform: String,
    pub user_id: String,
    pub chat_id: String,
    pub message_ref: Option<String>,
    pub selection: ModelSelection,
    pub query: String,
    pub history: Vec<ChatMessage>,
    pub trace: TraceAccumulator,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn from_input(
        input: &ParsedInput,
        history: Vec<ChatMessage>,
        selection: ModelSelection,
        budget: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            trace_id: TraceId::generate(),
            span_id: SpanId::generate(),
            parent_span_id: None,
            platform: input.platform().to_string(),
            user_id: input.user_id.clone(),
            chat_id: input.chat_id.clone(),
            message_ref: input.message_ref.clone(),
            selection,
            query: input.text.trim().to_string(),
            history,
            trace: TraceAccumulator::default(),
            started_at: now,
            deadline: now + budget,
        }
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    /// Fresh span id for a nested unit of work under this context's span.
    pub fn child_span(&self) -> SpanId {
        SpanId::generate()
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }

    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((now - self.started_at).num_milliseconds()).unwrap_or(0)
    }
}
