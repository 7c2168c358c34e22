use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::context::TraceId;

/// Normalised inbound message produced by a platform adapter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedInput {
    pub text: String,
    pub user_id: String,
    pub chat_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub message_ref: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ParsedInput {
    pub const PLATFORM_KEY: &'static str = "platform";

    pub fn new(
        text: impl Into<String>,
        user_id: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            user_id: user_id.into(),
            chat_id: chat_id.into(),
            ..Self::default()
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.metadata.insert(Self::PLATFORM_KEY.to_string(), platform.into());
        self
    }

    pub fn platform(&self) -> &str {
        self.metadata.get(Self::PLATFORM_KEY).map(String::as_str).unwrap_or("unknown")
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    #[default]
    Complete,
    AwaitConfirmation,
}

impl NextAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::AwaitConfirmation => "await_confirmation",
        }
    }
}

/// Outcome handed to the platform sender.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub trace_id: TraceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub next_action: NextAction,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<serde_json::Value>,
}

impl AgentResult {
    pub fn completed(
        trace_id: TraceId,
        content: impl Into<String>,
        next_action: NextAction,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: true,
            trace_id,
            content: Some(content.into()),
            error: None,
            next_action,
            duration_ms,
            debug: None,
        }
    }

    pub fn failed(trace_id: TraceId, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            trace_id,
            content: None,
            error: Some(error.into()),
            next_action: NextAction::Complete,
            duration_ms,
            debug: None,
        }
    }
}

/// Acknowledgement returned by `receive_message`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveReceipt {
    pub trace_id: TraceId,
}
