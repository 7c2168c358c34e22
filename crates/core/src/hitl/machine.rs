//! Pure transition function for the human-in-the-loop gate.
//!
//! `transition` never fails: events naming an unknown confirmation id return
//! the input state unchanged (same version).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::hitl::{
    ConfirmationId, ConfirmationStatus, HitlState, HitlStatus, ToolConfirmation,
    ToolExecutionEntry,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HitlEvent {
    RequestConfirmation { confirmation: ToolConfirmation },
    UserApproved { confirmation_id: ConfirmationId },
    UserRejected { confirmation_id: ConfirmationId, reason: Option<String> },
    ConfirmationExpired { confirmation_id: ConfirmationId },
    ExecutionCompleted { entry: ToolExecutionEntry },
}

impl HitlEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestConfirmation { .. } => "REQUEST_CONFIRMATION",
            Self::UserApproved { .. } => "USER_APPROVED",
            Self::UserRejected { .. } => "USER_REJECTED",
            Self::ConfirmationExpired { .. } => "CONFIRMATION_EXPIRED",
            Self::ExecutionCompleted { .. } => "EXECUTION_COMPLETED",
        }
    }
}

pub fn transition(state: &HitlState, event: &HitlEvent, now: DateTime<Utc>) -> HitlState {
    let mut next = state.clone();
    let changed = match event {
        HitlEvent::RequestConfirmation { confirmation } => request(&mut next, confirmation),
        HitlEvent::UserApproved { confirmation_id } => approve(&mut next, confirmation_id),
        HitlEvent::UserRejected { confirmation_id, reason } => resolve(
            &mut next,
            confirmation_id,
            ConfirmationStatus::Rejected,
            reason.clone(),
        ),
        HitlEvent::ConfirmationExpired { confirmation_id } => {
            resolve(&mut next, confirmation_id, ConfirmationStatus::Expired, None)
        }
        HitlEvent::ExecutionCompleted { entry } => complete(&mut next, entry),
    };

    if !changed {
        return state.clone();
    }

    next.status = settle_status(&next, event);
    next.version += 1;
    next.last_activity_at = now;
    next
}

/// Expires every pending confirmation whose deadline is at or before `now`.
pub fn expire_due(state: &HitlState, now: DateTime<Utc>) -> (HitlState, Vec<ConfirmationId>) {
    let due: Vec<ConfirmationId> = state
        .pending_confirmations
        .iter()
        .filter(|confirmation| confirmation.is_expired_at(now))
        .map(|confirmation| confirmation.id.clone())
        .collect();

    let next = due.iter().fold(state.clone(), |current, confirmation_id| {
        transition(
            &current,
            &HitlEvent::ConfirmationExpired { confirmation_id: confirmation_id.clone() },
            now,
        )
    });

    (next, due)
}

fn request(state: &mut HitlState, confirmation: &ToolConfirmation) -> bool {
    let duplicate = state.pending(&confirmation.id).is_some()
        || state.approved.iter().any(|approved| approved.id == confirmation.id)
        || state.resolved(&confirmation.id).is_some();
    if duplicate {
        return false;
    }

    let mut pending = confirmation.clone();
    pending.status = ConfirmationStatus::Pending;
    pending.rejection_reason = None;
    state.pending_confirmations.push(pending);
    true
}

fn approve(state: &mut HitlState, confirmation_id: &ConfirmationId) -> bool {
    let Some(mut confirmation) = take_pending(state, confirmation_id) else {
        return false;
    };
    confirmation.status = ConfirmationStatus::Approved;
    state.approved.push(confirmation);
    true
}

fn resolve(
    state: &mut HitlState,
    confirmation_id: &ConfirmationId,
    status: ConfirmationStatus,
    reason: Option<String>,
) -> bool {
    let Some(mut confirmation) = take_pending(state, confirmation_id) else {
        return false;
    };
    confirmation.status = status;
    confirmation.rejection_reason = reason.filter(|reason| !reason.trim().is_empty());
    state.resolved.push(confirmation);
    true
}

fn complete(state: &mut HitlState, entry: &ToolExecutionEntry) -> bool {
    let Some(confirmation_id) = entry.confirmation_id.as_ref() else {
        return false;
    };
    let Some(index) = state.approved.iter().position(|approved| &approved.id == confirmation_id)
    else {
        return false;
    };

    state.approved.remove(index);
    state.completed_executions.push(entry.clone());
    true
}

fn take_pending(
    state: &mut HitlState,
    confirmation_id: &ConfirmationId,
) -> Option<ToolConfirmation> {
    let index =
        state.pending_confirmations.iter().position(|pending| &pending.id == confirmation_id)?;
    Some(state.pending_confirmations.remove(index))
}

fn settle_status(state: &HitlState, event: &HitlEvent) -> HitlStatus {
    if state.has_pending() {
        return HitlStatus::AwaitingConfirmation;
    }
    if !state.approved.is_empty() {
        return HitlStatus::Executing;
    }
    match event {
        HitlEvent::ExecutionCompleted { .. } => HitlStatus::Completed,
        _ => HitlStatus::Idle,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use super::{expire_due, transition, HitlEvent};
    use crate::domain::hitl::{
        ConfirmationId, ConfirmationStatus, HitlState, HitlStatus, RiskLevel, ToolArguments,
        ToolConfirmation, ToolExecutionEntry,
    };

    fn confirmation(tool: &str, ttl_secs: i64) -> ToolConfirmation {
        ToolConfirmation::pending(
            tool,
            json!({ "command": "rm -rf /tmp/cache" }).as_object().cloned().unwrap_or_default(),
            format!("run {tool}"),
            RiskLevel::Critical,
            Utc::now(),
            Duration::seconds(ttl_secs),
        )
    }

    fn entry_for(confirmation: &ToolConfirmation, success: bool) -> ToolExecutionEntry {
        ToolExecutionEntry {
            confirmation_id: Some(confirmation.id.clone()),
            tool_name: confirmation.tool_name.clone(),
            arguments: confirmation.arguments.clone(),
            success,
            result: success.then(|| json!("ok")),
            error: (!success).then(|| "boom".to_string()),
            duration_ms: 5,
            timestamp: Utc::now(),
        }
    }

    fn requested(confirmations: &[ToolConfirmation]) -> HitlState {
        confirmations.iter().fold(HitlState::new("session-1", Utc::now()), |state, item| {
            transition(
                &state,
                &HitlEvent::RequestConfirmation { confirmation: item.clone() },
                Utc::now(),
            )
        })
    }

    #[test]
    fn request_moves_idle_to_awaiting() {
        let first = confirmation("shell", 600);
        let state = requested(&[first.clone()]);

        assert_eq!(state.status, HitlStatus::AwaitingConfirmation);
        assert_eq!(state.pending_ids(), vec![first.id]);
        assert_eq!(state.version, 1);
    }

    #[test]
    fn approval_moves_confirmation_out_of_pending() {
        let first = confirmation("shell", 600);
        let second = confirmation("delete_file", 600);
        let state = requested(&[first.clone(), second.clone()]);

        let state = transition(
            &state,
            &HitlEvent::UserApproved { confirmation_id: first.id.clone() },
            Utc::now(),
        );
        assert_eq!(state.status, HitlStatus::AwaitingConfirmation);
        assert_eq!(state.pending_ids(), vec![second.id.clone()]);
        assert_eq!(state.approved.len(), 1);
        assert_eq!(state.approved[0].status, ConfirmationStatus::Approved);

        let state = transition(
            &state,
            &HitlEvent::UserApproved { confirmation_id: second.id.clone() },
            Utc::now(),
        );
        assert_eq!(state.status, HitlStatus::Executing);
        assert!(!state.has_pending());
    }

    #[test]
    fn rejection_records_reason_and_returns_to_idle() {
        let first = confirmation("shell", 600);
        let state = requested(&[first.clone()]);

        let state = transition(
            &state,
            &HitlEvent::UserRejected {
                confirmation_id: first.id.clone(),
                reason: Some("too risky".to_string()),
            },
            Utc::now(),
        );

        assert_eq!(state.status, HitlStatus::Idle);
        assert!(state.approved.is_empty());
        let resolved = state.resolved(&first.id).expect("resolved entry");
        assert_eq!(resolved.status, ConfirmationStatus::Rejected);
        assert_eq!(resolved.rejection_reason.as_deref(), Some("too risky"));
    }

    #[test]
    fn unknown_ids_are_no_ops() {
        let state = requested(&[confirmation("shell", 600)]);
        let unknown = ConfirmationId("cfm_missing".to_string());

        for event in [
            HitlEvent::UserApproved { confirmation_id: unknown.clone() },
            HitlEvent::UserRejected { confirmation_id: unknown.clone(), reason: None },
            HitlEvent::ConfirmationExpired { confirmation_id: unknown.clone() },
        ] {
            assert_eq!(transition(&state, &event, Utc::now()), state);
        }
    }

    #[test]
    fn resolved_confirmations_are_never_mutated_again() {
        let first = confirmation("shell", 600);
        let state = requested(&[first.clone()]);
        let rejected = transition(
            &state,
            &HitlEvent::UserRejected { confirmation_id: first.id.clone(), reason: None },
            Utc::now(),
        );

        let approved_later = transition(
            &rejected,
            &HitlEvent::UserApproved { confirmation_id: first.id.clone() },
            Utc::now(),
        );
        assert_eq!(approved_later, rejected);

        let re_requested = transition(
            &rejected,
            &HitlEvent::RequestConfirmation { confirmation: first.clone() },
            Utc::now(),
        );
        assert_eq!(re_requested, rejected);
    }

    #[test]
    fn execution_completed_appends_once_per_confirmation() {
        let first = confirmation("shell", 600);
        let state = requested(&[first.clone()]);
        let state = transition(
            &state,
            &HitlEvent::UserApproved { confirmation_id: first.id.clone() },
            Utc::now(),
        );

        let entry = entry_for(&first, false);
        let state =
            transition(&state, &HitlEvent::ExecutionCompleted { entry: entry.clone() }, Utc::now());
        assert_eq!(state.status, HitlStatus::Completed);
        assert_eq!(state.completed_executions, vec![entry.clone()]);

        let replayed = transition(&state, &HitlEvent::ExecutionCompleted { entry }, Utc::now());
        assert_eq!(replayed.completed_executions.len(), 1);
        assert_eq!(replayed.version, state.version);
    }

    #[test]
    fn expire_due_only_touches_overdue_confirmations() {
        let stale = confirmation("shell", -1);
        let fresh = confirmation("send_email", 600);
        let state = requested(&[stale.clone(), fresh.clone()]);

        let (next, expired) = expire_due(&state, Utc::now());

        assert_eq!(expired, vec![stale.id.clone()]);
        assert_eq!(next.pending_ids(), vec![fresh.id]);
        assert_eq!(next.resolved(&stale.id).map(|item| item.status), Some(ConfirmationStatus::Expired));
        assert_eq!(next.status, HitlStatus::AwaitingConfirmation);
    }

    #[test]
    fn expiring_everything_returns_to_idle() {
        let stale = confirmation("shell", 0);
        let state = requested(&[stale]);
        let (next, expired) = expire_due(&state, Utc::now() + Duration::seconds(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(next.status, HitlStatus::Idle);
    }

    #[test]
    fn entries_without_confirmation_do_not_touch_state() {
        let state = HitlState::new("session-1", Utc::now());
        let entry = ToolExecutionEntry {
            confirmation_id: None,
            tool_name: "read_file".to_string(),
            arguments: ToolArguments::new(),
            success: true,
            result: None,
            error: None,
            duration_ms: 1,
            timestamp: Utc::now(),
        };
        assert_eq!(transition(&state, &HitlEvent::ExecutionCompleted { entry }, Utc::now()), state);
    }
}
