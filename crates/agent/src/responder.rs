//! Responder strategies composed by the conversation actor.
//!
//! Each strategy implements `Responder::handle`; the router picks one per
//! message and the HITL responder owns the confirmation gate.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use parley_core::config::{AgentConfig, AppConfig};
use parley_core::domain::context::ExecutionContext;
use parley_core::domain::conversation::ChatMessage;
use parley_core::domain::hitl::{
    ConfirmationId, HitlState, RiskLevel, ToolConfirmation, ToolExecutionEntry,
};
use parley_core::domain::io::NextAction;
use parley_core::hitl::{
    expire_due, parse_confirmation_response, render_pending_prompt, transition, HitlEvent,
    ReplyAction,
};
use parley_core::risk::RiskClassifier;

use crate::coordinator::{
    settle_interrupted, CheckpointError, FailurePolicy, HitlCheckpoint, ToolExecutionCoordinator,
};
use crate::llm::{LlmError, LlmProvider};
use crate::progress::ChatSink;
use crate::tools::ToolExecutor;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("responder `{responder}` failed: {message}")]
    Responder { responder: String, message: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct HandleOutcome {
    pub content: String,
    pub next_action: NextAction,
    pub hitl: HitlState,
}

impl HandleOutcome {
    pub fn complete(content: impl Into<String>, hitl: HitlState) -> Self {
        Self { content: content.into(), next_action: NextAction::Complete, hitl }
    }

    pub fn awaiting(content: impl Into<String>, hitl: HitlState) -> Self {
        Self { content: content.into(), next_action: NextAction::AwaitConfirmation, hitl }
    }

    fn settle(lines: Vec<String>, hitl: HitlState) -> Self {
        if hitl.has_pending() {
            let mut lines = lines;
            lines.push(render_pending_prompt(&hitl));
            Self::awaiting(lines.join("\n\n"), hitl)
        } else {
            Self::complete(lines.join("\n\n"), hitl)
        }
    }

    fn with_notice(mut self, notice: Option<String>) -> Self {
        if let Some(notice) = notice {
            self.content = if self.content.is_empty() {
                notice
            } else {
                format!("{notice}\n\n{}", self.content)
            };
        }
        self
    }
}

#[async_trait]
pub trait Responder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produces the reply for `query`. `hitl` is the conversation's current
    /// confirmation state; the returned outcome carries its successor.
    /// Changes that must survive a crash mid-turn go through `checkpoint`.
    async fn handle(
        &self,
        query: &str,
        context: &mut ExecutionContext,
        hitl: HitlState,
        checkpoint: &dyn HitlCheckpoint,
    ) -> Result<HandleOutcome, AgentError>;
}

fn build_messages(
    system_prompt: Option<&str>,
    history: &[ChatMessage],
    query: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    if let Some(prompt) = system_prompt {
        messages.push(ChatMessage::system(prompt));
    }
    messages.extend(history.iter().cloned());
    messages.push(ChatMessage::user(query));
    messages
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Plain LLM round trip. Proposed tool calls are ignored.
pub struct SimpleResponder {
    llm: Arc<dyn LlmProvider>,
    system_prompt: Option<String>,
}

impl SimpleResponder {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm, system_prompt: None }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

#[async_trait]
impl Responder for SimpleResponder {
    fn name(&self) -> &'static str {
        "simple"
    }

    async fn handle(
        &self,
        query: &str,
        context: &mut ExecutionContext,
        hitl: HitlState,
        _checkpoint: &dyn HitlCheckpoint,
    ) -> Result<HandleOutcome, AgentError> {
        let started = Instant::now();
        let messages = build_messages(self.system_prompt.as_deref(), &context.history, query);
        let response = self.llm.chat(&messages).await;
        context.trace.record_span(
            self.name(),
            context.child_span(),
            elapsed_ms(started),
            Some(context.span_id.clone()),
        );

        let response = response?;
        if !response.tool_calls.is_empty() {
            context.trace.add_warning(format!(
                "simple responder ignored {} proposed tool call(s)",
                response.tool_calls.len()
            ));
        }
        Ok(HandleOutcome::complete(response.content, hitl))
    }
}

/// Keyword routing table; the first route with a matching keyword wins.
#[derive(Clone, Debug, Default)]
pub struct QueryClassifier {
    routes: Vec<(String, Vec<String>)>,
}

impl QueryClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, name: impl Into<String>, keywords: &[&str]) -> Self {
        let keywords = keywords.iter().map(|keyword| keyword.trim().to_lowercase()).collect();
        self.routes.push((name.into(), keywords));
        self
    }

    pub fn classify(&self, query: &str) -> Option<&str> {
        let normalized = query.to_lowercase();
        let words: Vec<&str> = normalized
            .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '/')
            .filter(|word| !word.is_empty())
            .collect();

        self.routes
            .iter()
            .find(|(_, keywords)| {
                keywords.iter().any(|keyword| {
                    if keyword.contains(' ') {
                        normalized.contains(keyword.as_str())
                    } else {
                        words.contains(&keyword.as_str())
                    }
                })
            })
            .map(|(name, _)| name.as_str())
    }
}

/// Picks a strategy per message. While confirmations are pending every
/// message goes to the confirmation handler.
pub struct RouterResponder {
    classifier: QueryClassifier,
    confirmations: Arc<dyn Responder>,
    routes: Vec<(String, Arc<dyn Responder>)>,
    fallback: Arc<dyn Responder>,
}

impl RouterResponder {
    pub fn new(confirmations: Arc<dyn Responder>, fallback: Arc<dyn Responder>) -> Self {
        Self { classifier: QueryClassifier::new(), confirmations, routes: Vec::new(), fallback }
    }

    pub fn with_route(
        mut self,
        name: impl Into<String>,
        keywords: &[&str],
        responder: Arc<dyn Responder>,
    ) -> Self {
        let name = name.into();
        self.classifier = self.classifier.route(name.clone(), keywords);
        self.routes.push((name, responder));
        self
    }

    fn select(&self, query: &str, hitl: &HitlState) -> &Arc<dyn Responder> {
        if hitl.has_pending() {
            return &self.confirmations;
        }
        self.classifier
            .classify(query)
            .and_then(|route| {
                self.routes.iter().find(|(name, _)| name == route).map(|(_, responder)| responder)
            })
            .unwrap_or(&self.fallback)
    }
}

#[async_trait]
impl Responder for RouterResponder {
    fn name(&self) -> &'static str {
        "router"
    }

    async fn handle(
        &self,
        query: &str,
        context: &mut ExecutionContext,
        hitl: HitlState,
        checkpoint: &dyn HitlCheckpoint,
    ) -> Result<HandleOutcome, AgentError> {
        let started = Instant::now();
        let selected = Arc::clone(self.select(query, &hitl));
        info!(
            event_name = "router.selected",
            trace_id = %context.trace_id(),
            responder = selected.name(),
            "responder selected"
        );

        let outcome = selected.handle(query, context, hitl, checkpoint).await;
        context.trace.record_span(
            self.name(),
            context.child_span(),
            elapsed_ms(started),
            Some(context.span_id.clone()),
        );
        outcome
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HitlSettings {
    pub threshold: RiskLevel,
    pub confirmation_ttl: chrono::Duration,
    pub system_prompt: Option<String>,
}

impl Default for HitlSettings {
    fn default() -> Self {
        Self {
            threshold: RiskLevel::High,
            confirmation_ttl: chrono::Duration::minutes(5),
            system_prompt: None,
        }
    }
}

impl HitlSettings {
    pub fn from_config(agent: &AgentConfig) -> Self {
        Self {
            threshold: agent.risk_threshold,
            confirmation_ttl: chrono::Duration::seconds(
                i64::try_from(agent.confirmation_ttl_secs).unwrap_or(i64::MAX / 1_000),
            ),
            system_prompt: None,
        }
    }
}

/// LLM responder with the human-in-the-loop gate in front of risky tools.
pub struct HitlResponder {
    llm: Arc<dyn LlmProvider>,
    executor: Arc<dyn ToolExecutor>,
    classifier: RiskClassifier,
    coordinator: ToolExecutionCoordinator,
    sink: Arc<dyn ChatSink>,
    settings: HitlSettings,
}

impl HitlResponder {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        executor: Arc<dyn ToolExecutor>,
        sink: Arc<dyn ChatSink>,
    ) -> Self {
        Self {
            llm,
            executor,
            classifier: RiskClassifier::default(),
            coordinator: ToolExecutionCoordinator::default(),
            sink,
            settings: HitlSettings::default(),
        }
    }

    pub fn with_classifier(mut self, classifier: RiskClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_coordinator(mut self, coordinator: ToolExecutionCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    pub fn with_settings(mut self, settings: HitlSettings) -> Self {
        self.settings = settings;
        self
    }

    async fn resolve_reply(
        &self,
        query: &str,
        context: &mut ExecutionContext,
        hitl: HitlState,
        checkpoint: &dyn HitlCheckpoint,
    ) -> Result<HandleOutcome, AgentError> {
        let Some(reply) = parse_confirmation_response(query) else {
            return Ok(HandleOutcome::awaiting(
                format!("I need a decision before continuing.\n\n{}", render_pending_prompt(&hitl)),
                hitl,
            ));
        };

        let targets: Vec<ConfirmationId> = match &reply.target {
            Some(id) if hitl.pending(id).is_some() => vec![id.clone()],
            Some(id) => {
                return Ok(HandleOutcome::awaiting(
                    format!(
                        "There is no pending confirmation `{id}`.\n\n{}",
                        render_pending_prompt(&hitl)
                    ),
                    hitl,
                ))
            }
            None => hitl.pending_ids(),
        };

        let now = Utc::now();
        let mut hitl = hitl;
        let mut lines = Vec::new();

        match reply.action {
            ReplyAction::Reject => {
                for id in &targets {
                    hitl = transition(
                        &hitl,
                        &HitlEvent::UserRejected {
                            confirmation_id: id.clone(),
                            reason: reply.reason.clone(),
                        },
                        now,
                    );
                    let tool =
                        hitl.resolved(id).map(|item| item.tool_name.as_str()).unwrap_or("tool");
                    lines.push(match &reply.reason {
                        Some(reason) => format!("Cancelled `{tool}` ({reason})."),
                        None => format!("Cancelled `{tool}`."),
                    });
                    info!(
                        event_name = "hitl.confirmation_rejected",
                        trace_id = %context.trace_id(),
                        confirmation_id = %id,
                        tool,
                        "confirmation rejected"
                    );
                }
            }
            ReplyAction::Approve => {
                for id in &targets {
                    hitl = transition(
                        &hitl,
                        &HitlEvent::UserApproved { confirmation_id: id.clone() },
                        now,
                    );
                    info!(
                        event_name = "hitl.confirmation_approved",
                        trace_id = %context.trace_id(),
                        confirmation_id = %id,
                        "confirmation approved"
                    );
                }

                // The approvals must be durable before any tool runs.
                checkpoint.save(&hitl).await?;

                let batch_items = hitl.approved.clone();
                let chat_id = context.chat_id.clone();
                let sink = &self.sink;
                let batch = self
                    .coordinator
                    .execute_approved(
                        hitl,
                        &batch_items,
                        self.executor.as_ref(),
                        checkpoint,
                        |entry, index, total| {
                            if total > 1 {
                                let line =
                                    format!("[{}/{}] {}", index + 1, total, summarize_entry(entry));
                                sink.progress(&chat_id, &line);
                            }
                        },
                    )
                    .await?;

                for entry in &batch.entries {
                    if !entry.success {
                        context.trace.add_warning(summarize_entry(entry));
                    }
                    context.trace.record_tool_call(entry.clone());
                    lines.push(summarize_entry(entry));
                }
                hitl = batch.state;
            }
        }

        Ok(HandleOutcome::settle(lines, hitl))
    }

    async fn respond(
        &self,
        query: &str,
        context: &mut ExecutionContext,
        hitl: HitlState,
    ) -> Result<HandleOutcome, AgentError> {
        let messages =
            build_messages(self.settings.system_prompt.as_deref(), &context.history, query);
        let started = Instant::now();
        let response = self.llm.chat(&messages).await;
        context.trace.record_span(
            format!("llm:{}", self.llm.name()),
            context.child_span(),
            elapsed_ms(started),
            Some(context.span_id.clone()),
        );
        let response = response?;

        let now = Utc::now();
        let mut hitl = hitl;
        let mut lines = Vec::new();
        if !response.content.trim().is_empty() {
            lines.push(response.content.clone());
        }

        for call in &response.tool_calls {
            let level = self.classifier.classify(&call.name, &call.arguments);
            if level >= self.settings.threshold {
                let confirmation = ToolConfirmation::pending(
                    &call.name,
                    call.arguments.clone(),
                    call.describe(),
                    level,
                    now,
                    self.settings.confirmation_ttl,
                );
                info!(
                    event_name = "hitl.confirmation_requested",
                    trace_id = %context.trace_id(),
                    confirmation_id = %confirmation.id,
                    tool = %call.name,
                    risk_level = level.as_str(),
                    "tool call requires confirmation"
                );
                hitl = transition(&hitl, &HitlEvent::RequestConfirmation { confirmation }, now);
            } else {
                let entry = self
                    .coordinator
                    .run_one(self.executor.as_ref(), None, &call.name, &call.arguments)
                    .await;
                context.trace.record_tool_call(entry.clone());
                lines.push(summarize_entry(&entry));
            }
        }

        Ok(HandleOutcome::settle(lines, hitl))
    }
}

#[async_trait]
impl Responder for HitlResponder {
    fn name(&self) -> &'static str {
        "hitl"
    }

    async fn handle(
        &self,
        query: &str,
        context: &mut ExecutionContext,
        hitl: HitlState,
        checkpoint: &dyn HitlCheckpoint,
    ) -> Result<HandleOutcome, AgentError> {
        let started = Instant::now();
        let now = Utc::now();
        let (hitl, interrupted) = settle_interrupted(&hitl, now);
        let (hitl, expired) = expire_due(&hitl, now);

        let mut notices = Vec::new();
        if !interrupted.is_empty() {
            let tools: Vec<String> =
                interrupted.iter().map(|entry| format!("`{}`", entry.tool_name)).collect();
            for entry in &interrupted {
                context.trace.record_tool_call(entry.clone());
            }
            notices.push(format!(
                "An earlier run of {} was interrupted and will not be repeated automatically.",
                tools.join(", ")
            ));
        }

        // Expired ids stay out of the reply; only live confirmations are enumerated.
        let mut expired_tools = Vec::new();
        for confirmation in expired.iter().filter_map(|id| hitl.resolved(id)) {
            context.trace.add_warning(format!(
                "confirmation for `{}` ({}) expired",
                confirmation.tool_name, confirmation.id
            ));
            expired_tools.push(format!("`{}`", confirmation.tool_name));
        }
        if !expired_tools.is_empty() {
            notices.push(format!(
                "The confirmation for {} expired and nothing was executed.",
                expired_tools.join(", ")
            ));
        }
        let notice = (!notices.is_empty()).then(|| notices.join(" "));
        let stale_reply = !(expired.is_empty() && interrupted.is_empty())
            && parse_confirmation_response(query).is_some();

        let outcome = if hitl.has_pending() {
            self.resolve_reply(query, context, hitl, checkpoint).await?
        } else if stale_reply {
            HandleOutcome::complete("Ask again if you still want it done.", hitl)
        } else {
            self.respond(query, context, hitl).await?
        };

        context.trace.record_span(
            self.name(),
            context.child_span(),
            elapsed_ms(started),
            Some(context.span_id.clone()),
        );
        Ok(outcome.with_notice(notice))
    }
}

/// Standard responder stack. Every message passes the HITL gate; keyword
/// routes to ungated responders are left to callers that want them.
pub fn responder_from_config(
    config: &AppConfig,
    llm: Arc<dyn LlmProvider>,
    executor: Arc<dyn ToolExecutor>,
    sink: Arc<dyn ChatSink>,
) -> RouterResponder {
    let hitl: Arc<dyn Responder> = Arc::new(
        HitlResponder::new(llm, executor, sink)
            .with_classifier(
                RiskClassifier::default().with_overrides(config.agent.tool_risk.clone()),
            )
            .with_coordinator(ToolExecutionCoordinator::new(FailurePolicy::from_stop_flag(
                config.agent.stop_on_tool_failure,
            )))
            .with_settings(HitlSettings::from_config(&config.agent)),
    );
    RouterResponder::new(Arc::clone(&hitl), hitl)
}

fn summarize_entry(entry: &ToolExecutionEntry) -> String {
    if entry.success {
        match &entry.result {
            Some(Value::String(text)) => format!("`{}` succeeded: {text}", entry.tool_name),
            Some(Value::Null) | None => format!("`{}` succeeded.", entry.tool_name),
            Some(value) => format!("`{}` succeeded: {value}", entry.tool_name),
        }
    } else {
        format!(
            "`{}` failed: {}",
            entry.tool_name,
            entry.error.as_deref().unwrap_or("unknown error")
        )
    }
}
