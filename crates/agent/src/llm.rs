use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use parley_core::config::LlmConfig;
use parley_core::domain::conversation::{ChatMessage, Role};
use parley_core::domain::hitl::ToolArguments;

/// A tool invocation suggested by the model. Nothing runs until the
/// responder has classified it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProposedToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: ToolArguments,
    #[serde(default)]
    pub description: Option<String>,
}

impl ProposedToolCall {
    pub fn new(name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self { name: name.into(), arguments, description: None }
    }

    pub fn describe(&self) -> String {
        match &self.description {
            Some(description) if !description.trim().is_empty() => description.clone(),
            _ if self.arguments.is_empty() => format!("run `{}`", self.name),
            _ => format!(
                "run `{}` with {}",
                self.name,
                serde_json::Value::Object(self.arguments.clone())
            ),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ProposedToolCall>,
}

impl LlmResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), tool_calls: Vec::new() }
    }
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider `{provider}` request failed: {message}")]
    Request { provider: String, message: String },
    #[error("provider returned malformed output: {0}")]
    Malformed(String),
    #[error("unsupported llm provider `{0}`")]
    Unsupported(String),
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn chat(&self, messages: &[ChatMessage]) -> Result<LlmResponse, LlmError>;
}

/// Local provider: echoes the latest user message, and turns
/// `/call <tool> [json-object]` into a proposed tool call.
#[derive(Clone, Debug, Default)]
pub struct LoopbackProvider;

impl LoopbackProvider {
    pub const NAME: &'static str = "loopback";

    fn parse_call(command: &str) -> Result<ProposedToolCall, LlmError> {
        let command = command.trim();
        let (tool, raw_args) = match command.split_once(char::is_whitespace) {
            Some((tool, rest)) => (tool, rest.trim()),
            None => (command, ""),
        };
        if tool.is_empty() {
            return Err(LlmError::Malformed("`/call` needs a tool name".to_string()));
        }

        let arguments = if raw_args.is_empty() {
            ToolArguments::new()
        } else {
            match serde_json::from_str::<serde_json::Value>(raw_args) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(_) => {
                    return Err(LlmError::Malformed(
                        "tool arguments must be a JSON object".to_string(),
                    ))
                }
                Err(error) => {
                    return Err(LlmError::Malformed(format!("invalid tool arguments: {error}")))
                }
            }
        };

        Ok(ProposedToolCall::new(tool, arguments))
    }
}

#[async_trait]
impl LlmProvider for LoopbackProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<LlmResponse, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.trim())
            .unwrap_or_default();

        if let Some(command) = last_user.strip_prefix("/call") {
            let call = Self::parse_call(command)?;
            return Ok(LlmResponse {
                content: format!("Preparing to run `{}`.", call.name),
                tool_calls: vec![call],
            });
        }

        Ok(LlmResponse::text(format!("You said: {last_user}")))
    }
}

pub fn provider_from_config(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.provider.trim().to_ascii_lowercase().as_str() {
        LoopbackProvider::NAME => Ok(Arc::new(LoopbackProvider)),
        other => Err(LlmError::Unsupported(other.to_string())),
    }
}
