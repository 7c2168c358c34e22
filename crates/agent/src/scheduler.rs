//! One-shot wake-ups per conversation.
//!
//! At most one wake-up is outstanding per key. A fired wake-up is disarmed
//! before it is delivered, so the run it triggers can arm the next one.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use parley_core::domain::conversation::ConversationKey;

pub trait WakeScheduler: Send + Sync {
    /// Arms a wake-up for `key` unless one is already outstanding.
    /// Returns `true` when a new wake-up was armed.
    fn schedule_once(&self, key: &ConversationKey, delay: Duration) -> bool;
    fn is_scheduled(&self, key: &ConversationKey) -> bool;
}

type ArmedSet = Arc<Mutex<HashSet<ConversationKey>>>;

fn lock(armed: &ArmedSet) -> MutexGuard<'_, HashSet<ConversationKey>> {
    match armed.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Timer-backed scheduler; fired keys arrive on the receiver returned by `new`.
#[derive(Clone)]
pub struct TokioWakeScheduler {
    armed: ArmedSet,
    fired: mpsc::UnboundedSender<ConversationKey>,
}

impl TokioWakeScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConversationKey>) {
        let (fired, receiver) = mpsc::unbounded_channel();
        (Self { armed: Arc::default(), fired }, receiver)
    }
}

impl WakeScheduler for TokioWakeScheduler {
    fn schedule_once(&self, key: &ConversationKey, delay: Duration) -> bool {
        if !lock(&self.armed).insert(key.clone()) {
            return false;
        }

        let armed = Arc::clone(&self.armed);
        let fired = self.fired.clone();
        let key = key.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            lock(&armed).remove(&key);
            debug!(event_name = "scheduler.wake_fired", conversation_key = %key, "wake-up fired");
            if fired.send(key.clone()).is_err() {
                warn!(
                    event_name = "scheduler.receiver_closed",
                    conversation_key = %key,
                    "wake-up dropped because the dispatcher is gone"
                );
            }
        });
        true
    }

    fn is_scheduled(&self, key: &ConversationKey) -> bool {
        lock(&self.armed).contains(key)
    }
}

/// Scheduler driven by hand: wake-ups fire only when `fire` is called.
#[derive(Clone, Default)]
pub struct ManualWakeScheduler {
    armed: ArmedSet,
    requested: Arc<Mutex<Vec<(ConversationKey, Duration)>>>,
}

impl ManualWakeScheduler {
    /// Disarms `key`; returns whether a wake-up was outstanding.
    pub fn fire(&self, key: &ConversationKey) -> bool {
        lock(&self.armed).remove(key)
    }

    /// Every accepted `schedule_once` call, in order.
    pub fn requests(&self) -> Vec<(ConversationKey, Duration)> {
        match self.requested.lock() {
            Ok(requested) => requested.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl WakeScheduler for ManualWakeScheduler {
    fn schedule_once(&self, key: &ConversationKey, delay: Duration) -> bool {
        if !lock(&self.armed).insert(key.clone()) {
            return false;
        }
        match self.requested.lock() {
            Ok(mut requested) => requested.push((key.clone(), delay)),
            Err(poisoned) => poisoned.into_inner().push((key.clone(), delay)),
        }
        true
    }

    fn is_scheduled(&self, key: &ConversationKey) -> bool {
        lock(&self.armed).contains(key)
    }
}
