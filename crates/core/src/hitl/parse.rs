//! Interprets free-text replies to a pending confirmation prompt.

use serde::{Deserialize, Serialize};

use crate::domain::hitl::ConfirmationId;

const APPROVE_PHRASES: &[&str] =
    &["go ahead", "do it", "yes", "y", "approve", "approved", "confirm", "ok", "okay", "proceed", "sure", "lgtm"];
const REJECT_PHRASES: &[&str] =
    &["no", "n", "reject", "rejected", "deny", "cancel", "stop", "abort", "decline", "don't"];
const REASON_MARKERS: &[&str] = &["because", "reason:", "since"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyAction {
    Approve,
    Reject,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationReply {
    pub action: ReplyAction,
    /// Explicit confirmation named in the reply. `None` applies to every pending one.
    pub target: Option<ConfirmationId>,
    pub reason: Option<String>,
}

/// Returns `None` when the text is not an approve/reject reply.
pub fn parse_confirmation_response(text: &str) -> Option<ConfirmationReply> {
    let normalized = text.trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }

    let (action, remainder) = match (
        leading_phrase(&normalized, APPROVE_PHRASES),
        leading_phrase(&normalized, REJECT_PHRASES),
    ) {
        (Some(rest), None) => (ReplyAction::Approve, rest),
        (None, Some(rest)) => (ReplyAction::Reject, rest),
        _ => return None,
    };

    let target = extract_target(text);
    let reason = match action {
        ReplyAction::Reject => extract_reason(text, remainder.len()),
        ReplyAction::Approve => None,
    };

    Some(ConfirmationReply { action, target, reason })
}

fn leading_phrase<'a>(normalized: &'a str, phrases: &[&str]) -> Option<&'a str> {
    phrases.iter().find_map(|phrase| {
        let rest = normalized.strip_prefix(phrase)?;
        match rest.chars().next() {
            None => Some(rest),
            Some(next) if !next.is_alphanumeric() && next != '_' => Some(rest),
            Some(_) => None,
        }
    })
}

fn extract_target(text: &str) -> Option<ConfirmationId> {
    text.split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | ':' | '.' | '!' | '?'))
        .map(|token| token.trim_matches(|c: char| matches!(c, '`' | '"' | '\'' | '(' | ')')))
        .find(|token| {
            token.len() > ConfirmationId::PREFIX.len()
                && token.to_ascii_lowercase().starts_with(ConfirmationId::PREFIX)
        })
        .map(|token| ConfirmationId(token.to_ascii_lowercase()))
}

fn extract_reason(text: &str, remainder_len: usize) -> Option<String> {
    let trimmed = text.trim();
    let start = trimmed.len().saturating_sub(remainder_len);
    let mut rest = trimmed.get(start..)?.trim();

    if let Some(target) = extract_target(rest) {
        if let Some(position) = rest.to_ascii_lowercase().find(target.as_str()) {
            rest = rest.get(position + target.as_str().len()..)?.trim();
        }
    }

    let rest = rest.trim_start_matches(|c: char| matches!(c, ',' | ';' | ':' | '-' | '.' | '!'));
    let mut rest = rest.trim();
    let lowered = rest.to_lowercase();
    if let Some(marker) = REASON_MARKERS.iter().find(|marker| lowered.starts_with(*marker)) {
        rest = rest.get(marker.len()..)?.trim();
    }

    if rest.is_empty() {
        None
    } else {
        Some(rest.to_string())
    }
}
