//! The conversation actor: single writer of one conversation's durable state.
//!
//! `receive_message` only parks the message in the pending slot and arms a
//! wake-up; all LLM and tool work happens in `on_process_message`. Short
//! critical sections around the store are serialized by `gate`; the run
//! itself holds no lock, so new messages can be received while it is busy.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use parley_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use parley_core::config::AppConfig;
use parley_core::domain::context::{ExecutionContext, ModelSelection, TraceId};
use parley_core::domain::conversation::{ChatMessage, ConversationActorState, ConversationKey};
use parley_core::domain::hitl::{ConfirmationId, HitlState};
use parley_core::domain::io::{AgentResult, NextAction, ParsedInput, ReceiveReceipt};
use parley_core::errors::{ApplicationError, DomainError};
use parley_db::{ConversationStore, RepositoryError};

use crate::coordinator::{CheckpointError, HitlCheckpoint};
use crate::progress::{ChatSink, StillWorkingRotator};
use crate::responder::{AgentError, HandleOutcome, Responder};
use crate::scheduler::WakeScheduler;

#[derive(Debug, Error)]
pub enum ActorError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("conversation store failure: {0}")]
    Store(#[from] RepositoryError),
}

impl From<ActorError> for ApplicationError {
    fn from(error: ActorError) -> Self {
        match error {
            ActorError::Domain(error) => Self::Domain(error),
            ActorError::Store(error) => Self::Persistence(error.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActorSettings {
    pub max_history_length: usize,
    pub wake_delay: Duration,
    pub rotator_interval: Duration,
    pub context_budget: chrono::Duration,
    /// Age after which an active context with no live run is considered orphaned.
    pub stale_active: chrono::Duration,
    pub include_debug: bool,
    pub selection: ModelSelection,
}

impl ActorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let agent = &config.agent;
        Self {
            max_history_length: agent.max_history_length,
            wake_delay: Duration::from_millis(agent.wake_delay_ms),
            rotator_interval: Duration::from_secs(agent.rotator_interval_secs),
            context_budget: chrono::Duration::seconds(to_i64(agent.context_budget_secs)),
            stale_active: chrono::Duration::seconds(to_i64(agent.stale_active_secs)),
            include_debug: agent.include_debug,
            selection: ModelSelection {
                provider: config.llm.provider.clone(),
                model: config.llm.model.clone(),
            },
        }
    }
}

impl Default for ActorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

fn to_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1_000)
}

/// Ports and settings shared by every actor in a process.
pub struct ActorEnvironment {
    pub store: Arc<dyn ConversationStore>,
    pub scheduler: Arc<dyn WakeScheduler>,
    pub responder: Arc<dyn Responder>,
    pub sink: Arc<dyn ChatSink>,
    pub audit: Arc<dyn AuditSink>,
    pub settings: ActorSettings,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProcessOutcome {
    /// Nothing was pending.
    Idle,
    /// Another run owns the active slot; a wake-up has been re-armed if needed.
    Busy,
    Processed(AgentResult),
}

enum Claim {
    Run(ExecutionContext, HitlState),
    Busy,
    Idle,
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ConversationActor {
    key: ConversationKey,
    env: Arc<ActorEnvironment>,
    gate: Mutex<()>,
    running: AtomicBool,
}

impl ConversationActor {
    pub fn new(key: ConversationKey, env: Arc<ActorEnvironment>) -> Self {
        Self { key, env, gate: Mutex::new(()), running: AtomicBool::new(false) }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Parks `input` as the pending context, replacing any earlier pending
    /// message, and arms a wake-up unless one is already outstanding.
    pub async fn receive_message(&self, input: ParsedInput) -> Result<ReceiveReceipt, ActorError> {
        if input.text.trim().is_empty() {
            return Err(DomainError::EmptyMessage.into());
        }

        let now = Utc::now();
        let settings = &self.env.settings;
        let (trace_id, superseded) = {
            let _gate = self.gate.lock().await;
            let mut state = self.load(now).await?;
            let context = ExecutionContext::from_input(
                &input,
                state.messages.clone(),
                settings.selection.clone(),
                settings.context_budget,
                now,
            );
            let trace_id = context.trace_id().clone();
            let superseded =
                state.pending_context.replace(context).map(|previous| previous.trace_id().clone());
            state.touch(now);
            self.env.store.put(&self.key, state).await?;
            (trace_id, superseded)
        };

        if let Some(previous) = superseded {
            warn!(
                event_name = "actor.pending_superseded",
                conversation_key = %self.key,
                trace_id = %trace_id,
                superseded_trace_id = %previous,
                "pending message replaced before it was processed"
            );
            self.audit(
                Some(&trace_id),
                "actor.pending_superseded",
                AuditCategory::Ingress,
                AuditOutcome::Rejected,
                &[("superseded_trace_id", previous.as_str())],
            );
        }

        let armed = self.env.scheduler.schedule_once(&self.key, settings.wake_delay);
        info!(
            event_name = "actor.message_received",
            conversation_key = %self.key,
            trace_id = %trace_id,
            wake_armed = armed,
            "message queued"
        );
        self.audit(
            Some(&trace_id),
            "actor.message_received",
            AuditCategory::Ingress,
            AuditOutcome::Success,
            &[],
        );

        Ok(ReceiveReceipt { trace_id })
    }

    /// Wake-up handler: runs the pending message, if any, to completion.
    pub async fn on_process_message(&self) -> Result<ProcessOutcome, ActorError> {
        let started = Instant::now();
        let (context, hitl) = match self.claim().await? {
            Claim::Run(context, hitl) => (context, hitl),
            Claim::Busy => return Ok(ProcessOutcome::Busy),
            Claim::Idle => return Ok(ProcessOutcome::Idle),
        };
        let _running = RunningFlag(&self.running);

        let trace_id = context.trace_id().clone();
        info!(
            event_name = "actor.processing_started",
            conversation_key = %self.key,
            trace_id = %trace_id,
            "processing message"
        );
        self.audit(
            Some(&trace_id),
            "actor.processing_started",
            AuditCategory::Actor,
            AuditOutcome::Success,
            &[],
        );

        let mut context = context;
        let rotator = StillWorkingRotator::start(
            Arc::clone(&self.env.sink),
            context.chat_id.clone(),
            self.env.settings.rotator_interval,
        );
        let query = context.query.clone();
        let before = hitl.clone();
        let checkpoint = StoreCheckpoint { actor: self };
        let handled = self.env.responder.handle(&query, &mut context, hitl, &checkpoint).await;
        rotator.stop();

        if let Ok(outcome) = &handled {
            self.audit_confirmations(&trace_id, &before, &outcome.hitl);
        }
        let result = self.finish(context, handled, started).await?;
        Ok(ProcessOutcome::Processed(result))
    }

    pub async fn get_history(&self) -> Result<Vec<ChatMessage>, ActorError> {
        let state = self.env.store.get(&self.key).await?;
        Ok(state.map(|state| state.messages).unwrap_or_default())
    }

    /// Drops the stored messages. Pending work and confirmations are kept.
    pub async fn clear_history(&self) -> Result<(), ActorError> {
        let now = Utc::now();
        {
            let _gate = self.gate.lock().await;
            let Some(mut state) = self.env.store.get(&self.key).await? else {
                return Ok(());
            };
            state.clear_messages();
            state.touch(now);
            self.env.store.put(&self.key, state).await?;
        }

        info!(
            event_name = "actor.history_cleared",
            conversation_key = %self.key,
            "history cleared"
        );
        self.audit(None, "actor.history_cleared", AuditCategory::Actor, AuditOutcome::Success, &[]);
        Ok(())
    }

    async fn load(&self, now: chrono::DateTime<Utc>) -> Result<ConversationActorState, ActorError> {
        Ok(self
            .env
            .store
            .get(&self.key)
            .await?
            .unwrap_or_else(|| ConversationActorState::new(self.key.as_str(), now)))
    }

    /// Moves pending into active and persists that before any other work.
    async fn claim(&self) -> Result<Claim, ActorError> {
        let now = Utc::now();
        let _gate = self.gate.lock().await;
        if self.is_running() {
            debug!(
                event_name = "actor.wake_while_running",
                conversation_key = %self.key,
                "run in progress"
            );
            return Ok(Claim::Busy);
        }

        let mut state = self.load(now).await?;
        let mut recovered = false;
        if let Some(active) = &state.active_context {
            let age = now - active.started_at;
            if age < self.env.settings.stale_active {
                let remaining = (self.env.settings.stale_active - age).to_std().unwrap_or_default();
                self.env.scheduler.schedule_once(&self.key, remaining);
                debug!(
                    event_name = "actor.active_not_stale",
                    conversation_key = %self.key,
                    trace_id = %active.trace_id(),
                    "active context still fresh, re-armed wake-up"
                );
                return Ok(Claim::Busy);
            }
            recovered = true;
            self.recover_stale(&mut state);
        }

        if !state.begin_processing() {
            if recovered {
                state.touch(now);
                self.env.store.put(&self.key, state).await?;
            }
            return Ok(Claim::Idle);
        }

        let messages = state.messages.clone();
        let Some(context) = state.active_context.as_mut().map(|active| {
            active.history = messages;
            active.clone()
        }) else {
            return Ok(Claim::Idle);
        };
        let hitl = state.hitl.clone();
        state.touch(now);
        self.env.store.put(&self.key, state).await?;
        self.running.store(true, Ordering::SeqCst);
        Ok(Claim::Run(context, hitl))
    }

    fn recover_stale(&self, state: &mut ConversationActorState) {
        let Some(stale) = state.active_context.take() else {
            return;
        };
        let stale_trace = stale.trace_id().clone();
        let requeued = state.pending_context.is_none();
        if requeued {
            state.pending_context = Some(stale);
        }

        warn!(
            event_name = "actor.stale_active_recovered",
            conversation_key = %self.key,
            trace_id = %stale_trace,
            requeued,
            "recovered orphaned active context"
        );
        self.audit(
            Some(&stale_trace),
            "actor.stale_active_recovered",
            AuditCategory::Persistence,
            if requeued { AuditOutcome::Success } else { AuditOutcome::Rejected },
            &[("requeued", if requeued { "true" } else { "false" })],
        );
    }

    async fn finish(
        &self,
        mut context: ExecutionContext,
        handled: Result<HandleOutcome, AgentError>,
        started: Instant,
    ) -> Result<AgentResult, ActorError> {
        let now = Utc::now();
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let max_len = self.env.settings.max_history_length;
        let trace_id = context.trace_id().clone();

        let (mut result, rearm) = {
            let _gate = self.gate.lock().await;
            let mut state = self.load(now).await?;
            state.push_message(ChatMessage::user(context.query.clone()), max_len);

            let result = match handled {
                Ok(outcome) => {
                    state.hitl = outcome.hitl;
                    state.hitl.trim_logs(max_len);
                    if outcome.next_action == NextAction::Complete {
                        state.push_message(
                            ChatMessage::assistant(outcome.content.clone()),
                            max_len,
                        );
                    }
                    AgentResult::completed(
                        trace_id.clone(),
                        outcome.content,
                        outcome.next_action,
                        duration_ms,
                    )
                }
                Err(error) => {
                    let message = error.to_string();
                    warn!(
                        event_name = "actor.responder_failed",
                        conversation_key = %self.key,
                        trace_id = %trace_id,
                        error = %message,
                        "responder failed; recording error turn"
                    );
                    context.trace.add_error(message.clone());
                    state.push_message(
                        ChatMessage::assistant(format!("Error: {message}")),
                        max_len,
                    );
                    AgentResult::failed(trace_id.clone(), message, duration_ms)
                }
            };

            state.active_context = None;
            state.touch(now);
            let rearm = state.pending_context.is_some();
            self.env.store.put(&self.key, state).await?;
            (result, rearm)
        };

        context.trace.record_span(
            "conversation_actor",
            context.span_id.clone(),
            duration_ms,
            context.parent_span_id.clone(),
        );
        if self.env.settings.include_debug {
            result.debug = Some(context.trace.to_debug_json());
        }

        if rearm {
            self.env.scheduler.schedule_once(&self.key, self.env.settings.wake_delay);
        }

        info!(
            event_name = "actor.processing_finished",
            conversation_key = %self.key,
            trace_id = %trace_id,
            success = result.success,
            next_action = result.next_action.as_str(),
            duration_ms,
            tool_calls = context.trace.tool_calls().len(),
            "message processed"
        );
        self.audit(
            Some(&trace_id),
            "actor.processing_finished",
            AuditCategory::Actor,
            if result.success { AuditOutcome::Success } else { AuditOutcome::Failed },
            &[("next_action", result.next_action.as_str())],
        );
        for entry in context.trace.tool_calls() {
            self.audit(
                Some(&trace_id),
                "tool.executed",
                AuditCategory::Execution,
                if entry.success { AuditOutcome::Success } else { AuditOutcome::Failed },
                &[("tool", entry.tool_name.as_str())],
            );
        }

        self.env.sink.deliver(&context.chat_id, &result).await;
        Ok(result)
    }

    fn audit_confirmations(&self, trace_id: &TraceId, before: &HitlState, after: &HitlState) {
        for confirmation in &after.pending_confirmations {
            if before.pending_confirmations.iter().any(|known| known.id == confirmation.id) {
                continue;
            }
            self.audit(
                Some(trace_id),
                "confirmation.requested",
                AuditCategory::Confirmation,
                AuditOutcome::Success,
                &[
                    ("confirmation_id", confirmation.id.as_str()),
                    ("tool", confirmation.tool_name.as_str()),
                    ("risk_level", confirmation.risk_level.as_str()),
                ],
            );
        }

        // The logs are trimmed from the front, so compare by id rather than length.
        let known_resolved: HashSet<&ConfirmationId> =
            before.resolved.iter().map(|confirmation| &confirmation.id).collect();
        for confirmation in
            after.resolved.iter().filter(|confirmation| !known_resolved.contains(&confirmation.id))
        {
            self.audit(
                Some(trace_id),
                "confirmation.resolved",
                AuditCategory::Confirmation,
                AuditOutcome::Rejected,
                &[
                    ("confirmation_id", confirmation.id.as_str()),
                    ("tool", confirmation.tool_name.as_str()),
                    ("status", confirmation.status.as_str()),
                ],
            );
        }

        let known_executed: HashSet<&ConfirmationId> = before
            .completed_executions
            .iter()
            .filter_map(|entry| entry.confirmation_id.as_ref())
            .collect();
        for entry in after.completed_executions.iter().filter(|entry| {
            !entry.confirmation_id.as_ref().is_some_and(|id| known_executed.contains(id))
        }) {
            self.audit(
                Some(trace_id),
                "confirmation.executed",
                AuditCategory::Confirmation,
                if entry.success { AuditOutcome::Success } else { AuditOutcome::Failed },
                &[("tool", entry.tool_name.as_str())],
            );
        }
    }

    /// Writes `hitl` into the stored state mid-run, leaving both context
    /// slots and the messages as they are.
    async fn save_hitl(&self, hitl: &HitlState) -> Result<(), ActorError> {
        let now = Utc::now();
        let _gate = self.gate.lock().await;
        let mut state = self.load(now).await?;
        state.hitl = hitl.clone();
        state.hitl.trim_logs(self.env.settings.max_history_length);
        state.touch(now);
        self.env.store.put(&self.key, state).await?;
        debug!(
            event_name = "actor.hitl_checkpointed",
            conversation_key = %self.key,
            approved = hitl.approved.len(),
            executed = hitl.completed_executions.len(),
            "confirmation state saved"
        );
        Ok(())
    }

    fn audit(
        &self,
        trace_id: Option<&TraceId>,
        event_type: &str,
        category: AuditCategory,
        outcome: AuditOutcome,
        metadata: &[(&str, &str)],
    ) {
        let context =
            AuditContext::new(Some(self.key.clone()), trace_id.cloned(), "conversation_actor");
        let event = metadata
            .iter()
            .fold(context.event(event_type, category, outcome), |event, (key, value)| {
                event.with_metadata(*key, *value)
            });
        self.env.audit.emit(event);
    }
}

/// Persists confirmation progress through the owning actor while a run is
/// in flight.
struct StoreCheckpoint<'a> {
    actor: &'a ConversationActor,
}

#[async_trait]
impl HitlCheckpoint for StoreCheckpoint<'_> {
    async fn save(&self, state: &HitlState) -> Result<(), CheckpointError> {
        self.actor.save_hitl(state).await.map_err(|error| CheckpointError(error.to_string()))
    }
}
