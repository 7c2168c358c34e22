pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod hitl;
pub mod risk;
pub mod trace;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use domain::context::{ExecutionContext, ModelSelection, SpanId, TraceId};
pub use domain::conversation::{ChatMessage, ConversationActorState, ConversationKey, Role};
pub use domain::hitl::{
    ConfirmationId, ConfirmationStatus, HitlState, HitlStatus, RiskLevel, ToolArguments,
    ToolConfirmation, ToolExecutionEntry,
};
pub use domain::io::{AgentResult, NextAction, ParsedInput, ReceiveReceipt};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use hitl::{parse_confirmation_response, transition, ConfirmationReply, HitlEvent, ReplyAction};
pub use risk::{requires_confirmation, RiskClassifier};
pub use trace::TraceAccumulator;
