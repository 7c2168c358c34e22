//! Runs approved confirmations one at a time, folding each result back into
//! the HITL state before the next call starts.
//!
//! Every folded result is written through a `HitlCheckpoint` before the next
//! tool runs. Approvals still listed in `HitlState::approved` when a turn
//! starts belong to a run that never finished; `settle_interrupted` closes
//! them out without calling the executor again.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use parley_core::domain::hitl::{
    ConfirmationId, HitlState, ToolArguments, ToolConfirmation, ToolExecutionEntry,
};
use parley_core::hitl::{transition, HitlEvent};

use crate::tools::ToolExecutor;

#[derive(Debug, Error)]
#[error("could not persist confirmation state: {0}")]
pub struct CheckpointError(pub String);

/// Durable write-through for confirmation state changed in the middle of a turn.
#[async_trait]
pub trait HitlCheckpoint: Send + Sync {
    async fn save(&self, state: &HitlState) -> Result<(), CheckpointError>;
}

/// Keeps nothing. For callers that persist the final state themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCheckpoint;

#[async_trait]
impl HitlCheckpoint for NoCheckpoint {
    async fn save(&self, _state: &HitlState) -> Result<(), CheckpointError> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    #[default]
    ContinueOnError,
    StopOnFirstFailure,
}

impl FailurePolicy {
    pub fn from_stop_flag(stop_on_failure: bool) -> Self {
        if stop_on_failure {
            Self::StopOnFirstFailure
        } else {
            Self::ContinueOnError
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionBatchResult {
    pub state: HitlState,
    /// One entry per runnable confirmation, in submission order.
    pub entries: Vec<ToolExecutionEntry>,
    pub stopped_early: bool,
}

impl ExecutionBatchResult {
    pub fn all_succeeded(&self) -> bool {
        self.entries.iter().all(|entry| entry.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ToolExecutionEntry> {
        self.entries.iter().filter(|entry| !entry.success)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ToolExecutionCoordinator {
    policy: FailurePolicy,
}

impl ToolExecutionCoordinator {
    pub fn new(policy: FailurePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Executes one call and times it. Never fails; executor errors land in the entry.
    pub async fn run_one(
        &self,
        executor: &dyn ToolExecutor,
        confirmation_id: Option<ConfirmationId>,
        tool_name: &str,
        arguments: &ToolArguments,
    ) -> ToolExecutionEntry {
        let started = Instant::now();
        let outcome = executor.execute(tool_name, arguments).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        ToolExecutionEntry {
            confirmation_id,
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
            success: outcome.success,
            result: outcome.result,
            error: if outcome.success {
                None
            } else {
                outcome.error.or_else(|| Some("tool failed".to_string()))
            },
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    /// Runs `confirmations` strictly in order. Confirmations that are not
    /// currently approved in `state` are ignored. A failed checkpoint stops
    /// the batch; confirmations not yet run stay in `approved`.
    pub async fn execute_approved<F>(
        &self,
        state: HitlState,
        confirmations: &[ToolConfirmation],
        executor: &dyn ToolExecutor,
        checkpoint: &dyn HitlCheckpoint,
        mut progress: F,
    ) -> Result<ExecutionBatchResult, CheckpointError>
    where
        F: FnMut(&ToolExecutionEntry, usize, usize) + Send,
    {
        let runnable: Vec<&ToolConfirmation> = confirmations
            .iter()
            .filter(|confirmation| {
                let approved = state.approved.iter().any(|item| item.id == confirmation.id);
                if !approved {
                    warn!(
                        event_name = "coordinator.confirmation_not_approved",
                        confirmation_id = %confirmation.id,
                        tool = %confirmation.tool_name,
                        "skipping confirmation that is not awaiting execution"
                    );
                }
                approved
            })
            .collect();

        let total = runnable.len();
        let mut state = state;
        let mut entries = Vec::with_capacity(total);
        let mut failed_tool: Option<String> = None;

        for (index, confirmation) in runnable.into_iter().enumerate() {
            let entry = match (&failed_tool, self.policy) {
                (Some(failed), FailurePolicy::StopOnFirstFailure) => {
                    skipped_entry(confirmation, failed)
                }
                _ => {
                    self.run_one(
                        executor,
                        Some(confirmation.id.clone()),
                        &confirmation.tool_name,
                        &confirmation.arguments,
                    )
                    .await
                }
            };

            info!(
                event_name = "coordinator.tool_executed",
                confirmation_id = %confirmation.id,
                tool = %entry.tool_name,
                success = entry.success,
                duration_ms = entry.duration_ms,
                index,
                total,
                "tool execution recorded"
            );

            if !entry.success && failed_tool.is_none() {
                failed_tool = Some(entry.tool_name.clone());
            }

            state = transition(
                &state,
                &HitlEvent::ExecutionCompleted { entry: entry.clone() },
                Utc::now(),
            );
            checkpoint.save(&state).await?;
            progress(&entry, index, total);
            entries.push(entry);
        }

        let stopped_early = entries.iter().any(is_skipped);

        Ok(ExecutionBatchResult { state, entries, stopped_early })
    }
}

const INTERRUPTED_PREFIX: &str = "interrupted:";

/// Records a failed entry for every approval left over from an unfinished
/// run. The executor is never called for them.
pub fn settle_interrupted(
    state: &HitlState,
    now: DateTime<Utc>,
) -> (HitlState, Vec<ToolExecutionEntry>) {
    let entries: Vec<ToolExecutionEntry> = state
        .approved
        .iter()
        .map(|confirmation| ToolExecutionEntry {
            confirmation_id: Some(confirmation.id.clone()),
            tool_name: confirmation.tool_name.clone(),
            arguments: confirmation.arguments.clone(),
            success: false,
            result: None,
            error: Some(format!(
                "{INTERRUPTED_PREFIX} the turn that approved it did not finish; not run again"
            )),
            duration_ms: 0,
            timestamp: now,
        })
        .collect();

    for entry in &entries {
        warn!(
            event_name = "coordinator.approval_interrupted",
            tool = %entry.tool_name,
            "approved tool from an unfinished run will not be retried"
        );
    }

    let next = entries.iter().fold(state.clone(), |current, entry| {
        transition(&current, &HitlEvent::ExecutionCompleted { entry: entry.clone() }, now)
    });
    (next, entries)
}

pub fn is_interrupted(entry: &ToolExecutionEntry) -> bool {
    entry.error.as_deref().is_some_and(|error| error.starts_with(INTERRUPTED_PREFIX))
}

const SKIPPED_PREFIX: &str = "skipped:";

fn skipped_entry(confirmation: &ToolConfirmation, failed_tool: &str) -> ToolExecutionEntry {
    ToolExecutionEntry {
        confirmation_id: Some(confirmation.id.clone()),
        tool_name: confirmation.tool_name.clone(),
        arguments: confirmation.arguments.clone(),
        success: false,
        result: None,
        error: Some(format!("{SKIPPED_PREFIX} earlier tool `{failed_tool}` failed")),
        duration_ms: 0,
        timestamp: Utc::now(),
    }
}

pub fn is_skipped(entry: &ToolExecutionEntry) -> bool {
    entry.error.as_deref().is_some_and(|error| error.starts_with(SKIPPED_PREFIX))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use std::sync::Mutex;

    use async_trait::async_trait;

    use parley_core::domain::hitl::{HitlState, HitlStatus, RiskLevel, ToolConfirmation};
    use parley_core::hitl::{transition, HitlEvent};

    use super::{
        is_interrupted, is_skipped, settle_interrupted, CheckpointError, FailurePolicy,
        HitlCheckpoint, NoCheckpoint, ToolExecutionCoordinator,
    };
    use crate::test_support::RecordingExecutor;

    /// Keeps every saved state; fails once `fail_after` saves succeeded.
    #[derive(Default)]
    struct RecordingCheckpoint {
        saved: Mutex<Vec<HitlState>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl HitlCheckpoint for RecordingCheckpoint {
        async fn save(&self, state: &HitlState) -> Result<(), CheckpointError> {
            let mut saved = self.saved.lock().expect("checkpoint lock");
            if self.fail_after.is_some_and(|limit| saved.len() >= limit) {
                return Err(CheckpointError("disk full".to_string()));
            }
            saved.push(state.clone());
            Ok(())
        }
    }

    fn approved_state(tools: &[&str]) -> (HitlState, Vec<ToolConfirmation>) {
        let mut state = HitlState::new("session", Utc::now());
        let mut confirmations = Vec::new();
        for tool in tools {
            let confirmation = ToolConfirmation::pending(
                *tool,
                json!({ "target": tool }).as_object().cloned().unwrap_or_default(),
                format!("run {tool}"),
                RiskLevel::High,
                Utc::now(),
                Duration::minutes(5),
            );
            state = transition(
                &state,
                &HitlEvent::RequestConfirmation { confirmation: confirmation.clone() },
                Utc::now(),
            );
            confirmations.push(confirmation);
        }
        for confirmation in &confirmations {
            state = transition(
                &state,
                &HitlEvent::UserApproved { confirmation_id: confirmation.id.clone() },
                Utc::now(),
            );
        }
        let approved = state.approved.clone();
        (state, approved)
    }

    #[tokio::test]
    async fn executes_in_submission_order_with_progress() {
        let executor = RecordingExecutor::default();
        let (state, confirmations) = approved_state(&["first", "second", "third"]);
        let mut progress = Vec::new();

        let result = ToolExecutionCoordinator::default()
            .execute_approved(
                state,
                &confirmations,
                &executor,
                &NoCheckpoint,
                |entry, index, total| {
                    progress.push((entry.tool_name.clone(), index, total));
                },
            )
            .await
            .expect("batch");

        assert_eq!(executor.calls(), vec!["first", "second", "third"]);
        assert_eq!(
            progress,
            vec![
                ("first".to_string(), 0, 3),
                ("second".to_string(), 1, 3),
                ("third".to_string(), 2, 3)
            ]
        );
        assert_eq!(result.state.completed_executions.len(), 3);
        assert_eq!(result.state.status, HitlStatus::Completed);
        assert!(result.state.approved.is_empty());
        assert!(result.all_succeeded());
    }

    #[tokio::test]
    async fn continue_on_error_runs_every_confirmation() {
        let executor = RecordingExecutor::failing(&["second"]);
        let (state, confirmations) = approved_state(&["first", "second", "third"]);

        let result = ToolExecutionCoordinator::new(FailurePolicy::ContinueOnError)
            .execute_approved(state, &confirmations, &executor, &NoCheckpoint, |_, _, _| {})
            .await
            .expect("batch");

        assert_eq!(executor.calls(), vec!["first", "second", "third"]);
        assert_eq!(result.failures().count(), 1);
        assert!(!result.stopped_early);
        assert_eq!(result.state.completed_executions.len(), 3);
    }

    #[tokio::test]
    async fn stop_on_first_failure_still_records_one_entry_each() {
        let executor = RecordingExecutor::failing(&["first"]);
        let (state, confirmations) = approved_state(&["first", "second"]);

        let result = ToolExecutionCoordinator::new(FailurePolicy::StopOnFirstFailure)
            .execute_approved(state, &confirmations, &executor, &NoCheckpoint, |_, _, _| {})
            .await
            .expect("batch");

        assert_eq!(executor.calls(), vec!["first"]);
        assert!(result.stopped_early);
        assert_eq!(result.state.completed_executions.len(), 2);
        assert!(is_skipped(&result.entries[1]));
        assert_eq!(result.state.status, HitlStatus::Completed);
    }

    #[tokio::test]
    async fn confirmations_not_approved_are_not_executed() {
        let executor = RecordingExecutor::default();
        let (state, mut confirmations) = approved_state(&["first"]);
        let stray = ToolConfirmation::pending(
            "stray",
            Default::default(),
            "not approved",
            RiskLevel::Critical,
            Utc::now(),
            Duration::minutes(5),
        );
        confirmations.push(stray);

        let result = ToolExecutionCoordinator::default()
            .execute_approved(state, &confirmations, &executor, &NoCheckpoint, |_, _, _| {})
            .await
            .expect("batch");

        assert_eq!(executor.calls(), vec!["first"]);
        assert_eq!(result.entries.len(), 1);
    }

    #[tokio::test]
    async fn rerunning_a_finished_batch_does_nothing() {
        let executor = RecordingExecutor::default();
        let (state, confirmations) = approved_state(&["first"]);
        let coordinator = ToolExecutionCoordinator::default();

        let first = coordinator
            .execute_approved(state, &confirmations, &executor, &NoCheckpoint, |_, _, _| {})
            .await
            .expect("first batch");
        let second = coordinator
            .execute_approved(
                first.state.clone(),
                &confirmations,
                &executor,
                &NoCheckpoint,
                |_, _, _| {},
            )
            .await
            .expect("second batch");

        assert_eq!(executor.calls(), vec!["first"]);
        assert_eq!(second.state.completed_executions.len(), 1);
    }

    #[tokio::test]
    async fn every_entry_is_checkpointed_before_the_next_tool_runs() {
        let executor = RecordingExecutor::default();
        let checkpoint = RecordingCheckpoint::default();
        let (state, confirmations) = approved_state(&["first", "second"]);

        ToolExecutionCoordinator::default()
            .execute_approved(state, &confirmations, &executor, &checkpoint, |_, _, _| {})
            .await
            .expect("batch");

        let saved = checkpoint.saved.lock().expect("checkpoint lock").clone();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].completed_executions.len(), 1);
        assert_eq!(saved[0].approved.len(), 1);
        assert!(saved[1].approved.is_empty());
    }

    #[tokio::test]
    async fn failed_checkpoint_stops_the_batch() {
        let executor = RecordingExecutor::default();
        let checkpoint = RecordingCheckpoint { fail_after: Some(0), ..Default::default() };
        let (state, confirmations) = approved_state(&["first", "second"]);

        let result = ToolExecutionCoordinator::default()
            .execute_approved(state, &confirmations, &executor, &checkpoint, |_, _, _| {})
            .await;

        assert!(result.is_err());
        assert_eq!(executor.calls(), vec!["first"]);
    }

    #[test]
    fn leftover_approvals_are_closed_without_running() {
        let (state, confirmations) = approved_state(&["first", "second"]);

        let (settled, entries) = settle_interrupted(&state, Utc::now());

        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|entry| !entry.success && is_interrupted(entry)));
        assert!(settled.approved.is_empty());
        assert_eq!(settled.completed_executions.len(), 2);
        assert_eq!(
            settled.completed_executions[0].confirmation_id,
            Some(confirmations[0].id.clone())
        );

        let (again, none) = settle_interrupted(&settled, Utc::now());
        assert!(none.is_empty());
        assert_eq!(again, settled);
    }
}
