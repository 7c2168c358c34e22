//! Agent runtime: the async shell around the pure conversation core.
//!
//! A message flows through the crate like this:
//! 1. **Ingress** (`actor`) - `receive_message` parks the message as the
//!    conversation's pending context and arms one wake-up (`scheduler`)
//! 2. **Processing** (`actor`) - the wake moves pending into active, starts the
//!    still-working rotator (`progress`) and dispatches to a `Responder`
//! 3. **Responding** (`responder`) - the router picks a strategy; the HITL
//!    responder calls the LLM (`llm`), classifies proposed tool calls and either
//!    asks for confirmation or runs them (`coordinator`, `tools`)
//! 4. **Completion** (`actor`) - history is appended and trimmed, the active
//!    slot cleared, and the `AgentResult` delivered through the `ChatSink`
//!
//! `registry` owns one actor per conversation key and dispatches wake-ups.

pub mod actor;
pub mod coordinator;
pub mod llm;
pub mod progress;
pub mod registry;
pub mod responder;
pub mod scheduler;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_support;

pub use actor::{ActorEnvironment, ActorError, ActorSettings, ConversationActor, ProcessOutcome};
pub use coordinator::{
    CheckpointError, ExecutionBatchResult, FailurePolicy, HitlCheckpoint, NoCheckpoint,
    ToolExecutionCoordinator,
};
pub use llm::{LlmError, LlmProvider, LlmResponse, LoopbackProvider, ProposedToolCall};
pub use progress::{ChatSink, RecordingChatSink, StillWorkingRotator, TracingChatSink};
pub use registry::ActorRegistry;
pub use responder::{
    responder_from_config, AgentError, HandleOutcome, HitlResponder, HitlSettings,
    QueryClassifier, Responder, RouterResponder, SimpleResponder,
};
pub use scheduler::{ManualWakeScheduler, TokioWakeScheduler, WakeScheduler};
pub use tools::{Tool, ToolError, ToolExecutor, ToolOutcome, ToolRegistry};
