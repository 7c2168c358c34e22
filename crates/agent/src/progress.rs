use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

use parley_core::domain::io::AgentResult;

pub const STILL_WORKING_MESSAGES: &[&str] = &[
    "Still working on it...",
    "Thinking this through...",
    "Pulling the pieces together...",
    "Almost there...",
];

/// Outbound port to the chat platform.
///
/// `progress` must not block: implementations queue or drop the update.
#[async_trait]
pub trait ChatSink: Send + Sync {
    fn progress(&self, chat_id: &str, text: &str);
    async fn deliver(&self, chat_id: &str, result: &AgentResult);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingChatSink;

#[async_trait]
impl ChatSink for TracingChatSink {
    fn progress(&self, chat_id: &str, text: &str) {
        info!(event_name = "chat.progress", chat_id, text, "progress update");
    }

    async fn deliver(&self, chat_id: &str, result: &AgentResult) {
        info!(
            event_name = "chat.deliver",
            chat_id,
            trace_id = %result.trace_id,
            success = result.success,
            next_action = result.next_action.as_str(),
            duration_ms = result.duration_ms,
            "agent result delivered"
        );
    }
}

/// Keeps everything it is given; used by the CLI and tests.
#[derive(Clone, Default)]
pub struct RecordingChatSink {
    progress: Arc<Mutex<Vec<(String, String)>>>,
    delivered: Arc<Mutex<Vec<(String, AgentResult)>>>,
}

impl RecordingChatSink {
    pub fn progress_updates(&self) -> Vec<(String, String)> {
        match self.progress.lock() {
            Ok(updates) => updates.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn delivered(&self) -> Vec<(String, AgentResult)> {
        match self.delivered.lock() {
            Ok(results) => results.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn last_result(&self) -> Option<AgentResult> {
        self.delivered().pop().map(|(_, result)| result)
    }
}

#[async_trait]
impl ChatSink for RecordingChatSink {
    fn progress(&self, chat_id: &str, text: &str) {
        let update = (chat_id.to_string(), text.to_string());
        match self.progress.lock() {
            Ok(mut updates) => updates.push(update),
            Err(poisoned) => poisoned.into_inner().push(update),
        }
    }

    async fn deliver(&self, chat_id: &str, result: &AgentResult) {
        let record = (chat_id.to_string(), result.clone());
        match self.delivered.lock() {
            Ok(mut results) => results.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
    }
}

/// Background ticker posting rotating "still working" notices until stopped.
///
/// The first notice goes out one interval after `start`. Dropping the
/// rotator stops it as well.
pub struct StillWorkingRotator {
    handle: Option<JoinHandle<()>>,
}

impl StillWorkingRotator {
    pub fn start(sink: Arc<dyn ChatSink>, chat_id: impl Into<String>, every: Duration) -> Self {
        let chat_id = chat_id.into();
        let every = every.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            for message in STILL_WORKING_MESSAGES.iter().cycle() {
                ticker.tick().await;
                sink.progress(&chat_id, message);
            }
        });
        Self { handle: Some(handle) }
    }

    pub fn stop(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for StillWorkingRotator {
    fn drop(&mut self) {
        self.abort();
    }
}
