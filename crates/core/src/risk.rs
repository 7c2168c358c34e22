//! Static risk table for tool calls.
//!
//! Classification is total: unknown tools fall back to the classifier's
//! default level and non-string arguments are matched on their JSON text.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::domain::hitl::{RiskLevel, ToolArguments};

/// Raises a tool's level when `argument` contains `needle` (case-insensitive).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgumentPattern {
    pub argument: &'static str,
    pub needle: &'static str,
    pub level: RiskLevel,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RiskRule {
    pub tools: &'static [&'static str],
    pub level: RiskLevel,
    pub patterns: &'static [ArgumentPattern],
}

const fn pattern(argument: &'static str, needle: &'static str, level: RiskLevel) -> ArgumentPattern {
    ArgumentPattern { argument, needle, level }
}

const SHELL_PATTERNS: &[ArgumentPattern] = &[
    pattern("command", "rm -rf", RiskLevel::Critical),
    pattern("command", "rm -fr", RiskLevel::Critical),
    pattern("command", "mkfs", RiskLevel::Critical),
    pattern("command", "dd if=", RiskLevel::Critical),
    pattern("command", "shutdown", RiskLevel::Critical),
    pattern("command", "reboot", RiskLevel::Critical),
    pattern("command", "sudo ", RiskLevel::Critical),
    pattern("command", ":(){", RiskLevel::Critical),
    pattern("command", "chmod -r 777", RiskLevel::Critical),
];

const WRITE_PATTERNS: &[ArgumentPattern] = &[
    pattern("path", "/etc/", RiskLevel::High),
    pattern("path", "/usr/", RiskLevel::High),
    pattern("path", ".ssh", RiskLevel::Critical),
];

const HTTP_PATTERNS: &[ArgumentPattern] = &[
    pattern("method", "post", RiskLevel::High),
    pattern("method", "put", RiskLevel::High),
    pattern("method", "patch", RiskLevel::High),
    pattern("method", "delete", RiskLevel::High),
];

const SQL_PATTERNS: &[ArgumentPattern] = &[
    pattern("query", "insert ", RiskLevel::High),
    pattern("query", "update ", RiskLevel::High),
    pattern("query", "delete ", RiskLevel::Critical),
    pattern("query", "drop ", RiskLevel::Critical),
    pattern("query", "truncate ", RiskLevel::Critical),
    pattern("query", "alter ", RiskLevel::Critical),
];

pub const DEFAULT_RULES: &[RiskRule] = &[
    RiskRule {
        tools: &[
            "read_file",
            "list_directory",
            "search",
            "web_search",
            "get_time",
            "get_weather",
            "calculator",
        ],
        level: RiskLevel::Low,
        patterns: &[],
    },
    RiskRule {
        tools: &["shell", "run_command", "bash", "exec"],
        level: RiskLevel::High,
        patterns: SHELL_PATTERNS,
    },
    RiskRule {
        tools: &["write_file", "apply_patch", "edit_file"],
        level: RiskLevel::Medium,
        patterns: WRITE_PATTERNS,
    },
    RiskRule {
        tools: &["delete_file", "move_file"],
        level: RiskLevel::High,
        patterns: WRITE_PATTERNS,
    },
    RiskRule { tools: &["http_request", "fetch"], level: RiskLevel::Medium, patterns: HTTP_PATTERNS },
    RiskRule { tools: &["database_query", "sql"], level: RiskLevel::Medium, patterns: SQL_PATTERNS },
    RiskRule {
        tools: &["send_email", "send_message", "post_message", "create_issue"],
        level: RiskLevel::High,
        patterns: &[],
    },
    RiskRule {
        tools: &["transfer_funds", "make_payment", "deploy"],
        level: RiskLevel::Critical,
        patterns: &[],
    },
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RiskClassifier {
    rules: &'static [RiskRule],
    overrides: BTreeMap<String, RiskLevel>,
    default_level: RiskLevel,
}

impl Default for RiskClassifier {
    fn default() -> Self {
        Self { rules: DEFAULT_RULES, overrides: BTreeMap::new(), default_level: RiskLevel::Medium }
    }
}

impl RiskClassifier {
    /// Per-tool base levels that replace the table entry; argument patterns
    /// can still raise the level further.
    pub fn with_overrides(mut self, overrides: BTreeMap<String, RiskLevel>) -> Self {
        self.overrides =
            overrides.into_iter().map(|(tool, level)| (normalize_tool(&tool), level)).collect();
        self
    }

    pub fn with_default_level(mut self, level: RiskLevel) -> Self {
        self.default_level = level;
        self
    }

    pub fn classify(&self, tool_name: &str, args: &ToolArguments) -> RiskLevel {
        let tool = normalize_tool(tool_name);
        let rule = self.rules.iter().find(|rule| rule.tools.contains(&tool.as_str()));

        let base = self
            .overrides
            .get(&tool)
            .copied()
            .or_else(|| rule.map(|rule| rule.level))
            .unwrap_or(self.default_level);

        let Some(rule) = rule else {
            return base;
        };

        rule.patterns
            .iter()
            .filter(|pattern| argument_contains(args, pattern.argument, pattern.needle))
            .map(|pattern| pattern.level)
            .fold(base, RiskLevel::max)
    }

    pub fn requires_confirmation(
        &self,
        tool_name: &str,
        args: &ToolArguments,
        threshold: RiskLevel,
    ) -> bool {
        self.classify(tool_name, args) >= threshold
    }
}

/// Classifies against the built-in table.
pub fn requires_confirmation(tool_name: &str, args: &ToolArguments, threshold: RiskLevel) -> bool {
    RiskClassifier::default().requires_confirmation(tool_name, args, threshold)
}

fn normalize_tool(tool_name: &str) -> String {
    tool_name.trim().to_ascii_lowercase().replace(['-', '.'], "_")
}

fn argument_contains(args: &ToolArguments, key: &str, needle: &str) -> bool {
    let Some(value) = args.get(key) else {
        return false;
    };
    let haystack = match value {
        Value::String(text) => text.to_ascii_lowercase(),
        other => other.to_string().to_ascii_lowercase(),
    };
    haystack.contains(needle)
}
