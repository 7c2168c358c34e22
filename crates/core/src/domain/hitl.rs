use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Key/value arguments for one tool invocation.
pub type ToolArguments = serde_json::Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfirmationId(pub String);

impl ConfirmationId {
    pub const PREFIX: &'static str = "cfm_";

    pub fn generate() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(format!("{}{}", Self::PREFIX, &raw[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfirmationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ConfirmationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A risky tool call waiting for a human decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolConfirmation {
    pub id: ConfirmationId,
    pub tool_name: String,
    pub arguments: ToolArguments,
    pub description: String,
    pub risk_level: RiskLevel,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ConfirmationStatus,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

impl ToolConfirmation {
    pub fn pending(
        tool_name: impl Into<String>,
        arguments: ToolArguments,
        description: impl Into<String>,
        risk_level: RiskLevel,
        created_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            id: ConfirmationId::generate(),
            tool_name: tool_name.into(),
            arguments,
            description: description.into(),
            risk_level,
            created_at,
            expires_at: created_at + ttl,
            status: ConfirmationStatus::Pending,
            rejection_reason: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlStatus {
    #[default]
    Idle,
    AwaitingConfirmation,
    Executing,
    Completed,
}

impl HitlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Executing => "executing",
            Self::Completed => "completed",
        }
    }
}

/// Result of running one tool. Appended once, never edited.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionEntry {
    #[serde(default)]
    pub confirmation_id: Option<ConfirmationId>,
    pub tool_name: String,
    pub arguments: ToolArguments,
    pub success: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Human-in-the-loop state for one conversation.
///
/// State changes go through `hitl::machine::transition`; `trim_logs` only
/// drops the oldest entries of the resolved and executed logs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HitlState {
    pub version: u64,
    pub status: HitlStatus,
    pub session_id: String,
    pub pending_confirmations: Vec<ToolConfirmation>,
    /// Approved confirmations not yet executed, in approval order.
    #[serde(default)]
    pub approved: Vec<ToolConfirmation>,
    /// Rejected and expired confirmations.
    #[serde(default)]
    pub resolved: Vec<ToolConfirmation>,
    pub completed_executions: Vec<ToolExecutionEntry>,
    pub last_activity_at: DateTime<Utc>,
}

impl HitlState {
    pub fn new(session_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            version: 0,
            status: HitlStatus::Idle,
            session_id: session_id.into(),
            pending_confirmations: Vec::new(),
            approved: Vec::new(),
            resolved: Vec::new(),
            completed_executions: Vec::new(),
            last_activity_at: now,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_confirmations.is_empty()
    }

    pub fn pending(&self, id: &ConfirmationId) -> Option<&ToolConfirmation> {
        self.pending_confirmations.iter().find(|confirmation| &confirmation.id == id)
    }

    pub fn resolved(&self, id: &ConfirmationId) -> Option<&ToolConfirmation> {
        self.resolved.iter().find(|confirmation| &confirmation.id == id)
    }

    pub fn pending_ids(&self) -> Vec<ConfirmationId> {
        self.pending_confirmations.iter().map(|confirmation| confirmation.id.clone()).collect()
    }

    /// Keeps the newest `max` entries of `resolved` and `completed_executions`.
    /// Pending and approved confirmations are never dropped.
    pub fn trim_logs(&mut self, max: usize) {
        trim_front(&mut self.resolved, max);
        trim_front(&mut self.completed_executions, max);
    }
}

fn trim_front<T>(items: &mut Vec<T>, max: usize) {
    if items.len() > max {
        let overflow = items.len() - max;
        items.drain(..overflow);
    }
}
