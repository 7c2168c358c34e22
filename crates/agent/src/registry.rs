use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use parley_core::domain::conversation::{ChatMessage, ConversationKey};
use parley_core::domain::io::{ParsedInput, ReceiveReceipt};
use parley_db::RepositoryError;

use crate::actor::{ActorEnvironment, ActorError, ConversationActor, ProcessOutcome};

/// Owns one `ConversationActor` per key and routes wake-ups to it.
///
/// Actors live only while a call or a run needs them; all durable state is
/// in the store, so an evicted actor is rebuilt on its next message.
pub struct ActorRegistry {
    env: Arc<ActorEnvironment>,
    actors: RwLock<HashMap<ConversationKey, Arc<ConversationActor>>>,
}

impl ActorRegistry {
    pub fn new(env: Arc<ActorEnvironment>) -> Self {
        Self { env, actors: RwLock::new(HashMap::new()) }
    }

    pub fn environment(&self) -> &Arc<ActorEnvironment> {
        &self.env
    }

    pub async fn actor(&self, key: &ConversationKey) -> Arc<ConversationActor> {
        if let Some(actor) = self.actors.read().await.get(key) {
            return Arc::clone(actor);
        }

        let mut actors = self.actors.write().await;
        let actor = actors.entry(key.clone()).or_insert_with(|| {
            Arc::new(ConversationActor::new(key.clone(), Arc::clone(&self.env)))
        });
        Arc::clone(actor)
    }

    /// Number of actors currently held in memory.
    pub async fn len(&self) -> usize {
        self.actors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.actors.read().await.is_empty()
    }

    /// Drops the actor for `key` once nothing else holds it and no run is
    /// in flight.
    async fn release(&self, key: &ConversationKey) {
        let mut actors = self.actors.write().await;
        let idle = actors
            .get(key)
            .is_some_and(|actor| Arc::strong_count(actor) == 1 && !actor.is_running());
        if idle {
            actors.remove(key);
            debug!(event_name = "registry.actor_evicted", conversation_key = %key, "actor evicted");
        }
    }

    pub async fn receive(
        &self,
        key: &ConversationKey,
        input: ParsedInput,
    ) -> Result<ReceiveReceipt, ActorError> {
        let result = self.actor(key).await.receive_message(input).await;
        self.release(key).await;
        result
    }

    /// Reads the stored messages without materializing an actor.
    pub async fn history(&self, key: &ConversationKey) -> Result<Vec<ChatMessage>, ActorError> {
        let state = self.env.store.get(key).await?;
        Ok(state.map(|state| state.messages).unwrap_or_default())
    }

    pub async fn clear_history(&self, key: &ConversationKey) -> Result<(), ActorError> {
        let result = self.actor(key).await.clear_history().await;
        self.release(key).await;
        result
    }

    pub async fn dispatch_wake(&self, key: &ConversationKey) -> Result<ProcessOutcome, ActorError> {
        let result = self.actor(key).await.on_process_message().await;
        self.release(key).await;
        result
    }

    /// Consumes fired wake-ups until the channel closes. Each wake runs on
    /// its own task so one slow conversation never delays another.
    pub fn run_wakeups(
        self: Arc<Self>,
        mut fired: mpsc::UnboundedReceiver<ConversationKey>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(key) = fired.recv().await {
                let registry = Arc::clone(&self);
                tokio::spawn(async move {
                    match registry.dispatch_wake(&key).await {
                        Ok(ProcessOutcome::Processed(result)) => debug!(
                            event_name = "registry.wake_processed",
                            conversation_key = %key,
                            trace_id = %result.trace_id,
                            "wake-up processed a message"
                        ),
                        Ok(outcome) => debug!(
                            event_name = "registry.wake_skipped",
                            conversation_key = %key,
                            outcome = ?outcome,
                            "wake-up had nothing to run"
                        ),
                        Err(err) => error!(
                            event_name = "registry.wake_failed",
                            conversation_key = %key,
                            error = %err,
                            "wake-up failed"
                        ),
                    }
                });
            }
            info!(event_name = "registry.dispatcher_stopped", "wake-up dispatcher stopped");
        })
    }

    /// Re-arms wake-ups for conversations left with queued or in-flight work,
    /// e.g. after a restart. Returns how many wake-ups were armed.
    pub async fn recover_pending(&self) -> Result<usize, RepositoryError> {
        let keys = self.env.store.pending_keys().await?;
        let armed = keys
            .iter()
            .filter(|key| self.env.scheduler.schedule_once(key, self.env.settings.wake_delay))
            .count();

        info!(
            event_name = "registry.pending_recovered",
            candidates = keys.len(),
            armed,
            "re-armed wake-ups for unfinished conversations"
        );
        Ok(armed)
    }
}
