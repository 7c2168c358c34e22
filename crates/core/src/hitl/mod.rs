//! Human-in-the-loop confirmation gate: transitions, reply parsing and prompts.

pub mod machine;
pub mod parse;

pub use machine::{expire_due, transition, HitlEvent};
pub use parse::{parse_confirmation_response, ConfirmationReply, ReplyAction};

use crate::domain::hitl::HitlState;

/// Renders the user-facing prompt listing every pending confirmation.
pub fn render_pending_prompt(state: &HitlState) -> String {
    let mut lines = vec!["The following actions need your confirmation:".to_string()];
    for confirmation in &state.pending_confirmations {
        lines.push(format!(
            "- [{}] {} ({} risk): {}",
            confirmation.id, confirmation.tool_name, confirmation.risk_level, confirmation.description
        ));
    }
    lines.push(String::new());
    lines.push(match state.pending_confirmations.as_slice() {
        [single] => format!("Reply \"yes\" to approve or \"no\" to reject (or `approve {}`).", single.id),
        _ => "Reply \"yes\" or \"no\" to decide all of them, or `approve <id>` / `reject <id>` for one."
            .to_string(),
    });
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{render_pending_prompt, transition, HitlEvent};
    use crate::domain::hitl::{HitlState, RiskLevel, ToolArguments, ToolConfirmation};

    #[test]
    fn prompt_lists_each_pending_confirmation() {
        let first = ToolConfirmation::pending(
            "shell",
            ToolArguments::new(),
            "run `rm -rf build`",
            RiskLevel::Critical,
            Utc::now(),
            Duration::minutes(5),
        );
        let state = transition(
            &HitlState::new("s", Utc::now()),
            &HitlEvent::RequestConfirmation { confirmation: first.clone() },
            Utc::now(),
        );

        let prompt = render_pending_prompt(&state);
        assert!(prompt.contains(first.id.as_str()));
        assert!(prompt.contains("critical risk"));
        assert!(prompt.contains("Reply \"yes\""));
    }
}
