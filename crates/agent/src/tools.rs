use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use parley_core::domain::hitl::ToolArguments;

#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self { success: true, result: Some(result), error: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, result: None, error: Some(error.into()) }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("no executor configured for tool `{0}`")]
    NotConfigured(String),
    #[error("tool `{tool}` failed: {message}")]
    Failed { tool: String, message: String },
}

/// Performs a tool's side effect. Failures are reported in the outcome,
/// never raised.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool_name: &str, arguments: &ToolArguments) -> ToolOutcome;
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, input: &ToolArguments) -> Result<Value>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Registry with the side-effect free tools available to local runs.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::default();
        registry.register(EchoTool);
        registry.register(CurrentTimeTool);
        registry
    }

    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, tool_name: &str, arguments: &ToolArguments) -> ToolOutcome {
        let Some(tool) = self.tools.get(tool_name) else {
            return ToolOutcome::failure(ToolError::NotConfigured(tool_name.to_string()).to_string());
        };

        match tool.execute(arguments).await {
            Ok(result) => ToolOutcome::ok(result),
            Err(error) => ToolOutcome::failure(
                ToolError::Failed { tool: tool_name.to_string(), message: format!("{error:#}") }
                    .to_string(),
            ),
        }
    }
}

/// Returns its arguments unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn execute(&self, input: &ToolArguments) -> Result<Value> {
        Ok(Value::Object(input.clone()))
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &'static str {
        "get_time"
    }

    async fn execute(&self, _input: &ToolArguments) -> Result<Value> {
        Ok(Value::String(Utc::now().to_rfc3339()))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use parley_core::domain::hitl::ToolArguments;

    use super::{Tool, ToolExecutor, ToolRegistry};

    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn execute(&self, _input: &ToolArguments) -> Result<Value> {
            Err(anyhow!("disk full"))
        }
    }

    #[tokio::test]
    async fn unknown_tool_yields_deterministic_failure() {
        let registry = ToolRegistry::default();
        let outcome = registry.execute("shell", &ToolArguments::new()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("no executor configured for tool `shell`"));
    }

    #[tokio::test]
    async fn tool_errors_become_failed_outcomes() {
        let mut registry = ToolRegistry::default();
        registry.register(BrokenTool);

        let outcome = registry.execute("broken", &ToolArguments::new()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("tool `broken` failed: disk full"));
    }

    #[tokio::test]
    async fn builtin_echo_returns_arguments() {
        let registry = ToolRegistry::with_builtin_tools();
        assert_eq!(registry.names(), vec!["echo", "get_time"]);

        let args = json!({ "text": "hi" }).as_object().cloned().unwrap_or_default();
        let outcome = registry.execute("echo", &args).await;
        assert!(outcome.success);
        assert_eq!(outcome.result, Some(json!({ "text": "hi" })));
    }
}
