use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use parley_core::domain::context::{ExecutionContext, ModelSelection};
use parley_core::domain::conversation::{ChatMessage, ConversationActorState, ConversationKey};
use parley_core::domain::hitl::ToolArguments;
use parley_core::domain::io::ParsedInput;
use parley_db::{ConversationStore, InMemoryConversationStore, RepositoryError};

use crate::llm::{LlmError, LlmProvider, LlmResponse};
use crate::tools::{ToolExecutor, ToolOutcome};

/// Records every call; tools named in `failing` report failure.
#[derive(Default)]
pub(crate) struct RecordingExecutor {
    calls: Mutex<Vec<String>>,
    failing: BTreeSet<String>,
}

impl RecordingExecutor {
    pub(crate) fn failing(tools: &[&str]) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: tools.iter().map(|tool| tool.to_string()).collect(),
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl ToolExecutor for RecordingExecutor {
    async fn execute(&self, tool_name: &str, _arguments: &ToolArguments) -> ToolOutcome {
        match self.calls.lock() {
            Ok(mut calls) => calls.push(tool_name.to_string()),
            Err(poisoned) => poisoned.into_inner().push(tool_name.to_string()),
        }
        if self.failing.contains(tool_name) {
            ToolOutcome::failure(format!("{tool_name} exploded"))
        } else {
            ToolOutcome::ok(json!({ "tool": tool_name }))
        }
    }
}

/// Replays queued responses in order; errors once the script runs out.
#[derive(Default)]
pub(crate) struct ScriptedLlm {
    script: Mutex<VecDeque<Result<LlmResponse, String>>>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    pub(crate) fn new(script: Vec<Result<LlmResponse, String>>) -> Self {
        Self { script: Mutex::new(script.into()), seen: Mutex::new(Vec::new()) }
    }

    pub(crate) fn call_count(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<LlmResponse, LlmError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }
        let next = self.script.lock().ok().and_then(|mut script| script.pop_front());
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => {
                Err(LlmError::Request { provider: "scripted".to_string(), message })
            }
            None => Err(LlmError::Request {
                provider: "scripted".to_string(),
                message: "script exhausted".to_string(),
            }),
        }
    }
}

/// In-memory store whose writes can be switched to fail.
#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: InMemoryConversationStore,
    fail_puts: AtomicBool,
}

impl FlakyStore {
    pub(crate) fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConversationStore for FlakyStore {
    async fn get(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<ConversationActorState>, RepositoryError> {
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &ConversationKey,
        state: ConversationActorState,
    ) -> Result<(), RepositoryError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(RepositoryError::Decode("simulated write failure".to_string()));
        }
        self.inner.put(key, state).await
    }

    async fn pending_keys(&self) -> Result<Vec<ConversationKey>, RepositoryError> {
        self.inner.pending_keys().await
    }
}

pub(crate) fn context_for(query: &str, history: Vec<ChatMessage>) -> ExecutionContext {
    ExecutionContext::from_input(
        &ParsedInput::new(query, "user-1", "chat-1").with_platform("test"),
        history,
        ModelSelection { provider: "scripted".to_string(), model: "test".to_string() },
        chrono::Duration::seconds(60),
        chrono::Utc::now(),
    )
}

pub(crate) fn args(value: serde_json::Value) -> ToolArguments {
    value.as_object().cloned().unwrap_or_default()
}
