//! Append-only execution record for one inbound message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::context::SpanId;
use crate::domain::hitl::ToolExecutionEntry;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub agent: String,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceAccumulator {
    spans: Vec<SpanRecord>,
    tool_calls: Vec<ToolExecutionEntry>,
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl TraceAccumulator {
    pub fn record_span(
        &mut self,
        agent: impl Into<String>,
        span_id: SpanId,
        duration_ms: u64,
        parent_span_id: Option<SpanId>,
    ) {
        self.spans.push(SpanRecord {
            agent: agent.into(),
            span_id,
            parent_span_id,
            duration_ms,
            recorded_at: Utc::now(),
        });
    }

    pub fn record_tool_call(&mut self, entry: ToolExecutionEntry) {
        self.tool_calls.push(entry);
    }

    pub fn add_warning(&mut self, text: impl Into<String>) {
        self.warnings.push(text.into());
    }

    pub fn add_error(&mut self, text: impl Into<String>) {
        self.errors.push(text.into());
    }

    pub fn spans(&self) -> &[SpanRecord] {
        &self.spans
    }

    pub fn tool_calls(&self) -> &[ToolExecutionEntry] {
        &self.tool_calls
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Compact JSON view attached to `AgentResult::debug`.
    pub fn to_debug_json(&self) -> serde_json::Value {
        serde_json::json!({
            "spans": self.spans.iter().map(|span| serde_json::json!({
                "agent": span.agent,
                "span_id": span.span_id.as_str(),
                "parent_span_id": span.parent_span_id.as_ref().map(SpanId::as_str),
                "duration_ms": span.duration_ms,
            })).collect::<Vec<_>>(),
            "tool_calls": self.tool_calls.iter().map(|entry| serde_json::json!({
                "tool": entry.tool_name,
                "success": entry.success,
                "duration_ms": entry.duration_ms,
            })).collect::<Vec<_>>(),
            "warnings": self.warnings,
            "errors": self.errors,
        })
    }
}
