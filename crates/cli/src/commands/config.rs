use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use parley_core::config::{AppConfig, LoadOptions};
use toml::Value;

struct Field {
    key_path: &'static str,
    env_key: &'static str,
    value: String,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in effective_fields(&config) {
        let source = field_source(
            field.key_path,
            field.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(format!("- {} = {} (source: {source})", field.key_path, field.value));
    }

    let overrides = &config.agent.tool_risk;
    if overrides.is_empty() {
        lines.push("- agent.tool_risk = <none> (source: default)".to_string());
    } else {
        for (tool, level) in overrides {
            lines.push(format!("- agent.tool_risk.{tool} = {} (source: file)", level.as_str()));
        }
    }

    lines.join("\n")
}

fn effective_fields(config: &AppConfig) -> Vec<Field> {
    let field = |key_path: &'static str, env_key: &'static str, value: String| Field {
        key_path,
        env_key,
        value,
    };
    let agent = &config.agent;

    vec![
        field("database.url", "PARLEY_DATABASE_URL", config.database.url.clone()),
        field(
            "database.max_connections",
            "PARLEY_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections.to_string(),
        ),
        field(
            "database.timeout_secs",
            "PARLEY_DATABASE_TIMEOUT_SECS",
            config.database.timeout_secs.to_string(),
        ),
        field("llm.provider", "PARLEY_LLM_PROVIDER", config.llm.provider.clone()),
        field("llm.model", "PARLEY_LLM_MODEL", config.llm.model.clone()),
        field(
            "agent.max_history_length",
            "PARLEY_AGENT_MAX_HISTORY_LENGTH",
            agent.max_history_length.to_string(),
        ),
        field(
            "agent.risk_threshold",
            "PARLEY_AGENT_RISK_THRESHOLD",
            agent.risk_threshold.as_str().to_string(),
        ),
        field(
            "agent.confirmation_ttl_secs",
            "PARLEY_AGENT_CONFIRMATION_TTL_SECS",
            agent.confirmation_ttl_secs.to_string(),
        ),
        field("agent.wake_delay_ms", "PARLEY_AGENT_WAKE_DELAY_MS", agent.wake_delay_ms.to_string()),
        field(
            "agent.rotator_interval_secs",
            "PARLEY_AGENT_ROTATOR_INTERVAL_SECS",
            agent.rotator_interval_secs.to_string(),
        ),
        field(
            "agent.context_budget_secs",
            "PARLEY_AGENT_CONTEXT_BUDGET_SECS",
            agent.context_budget_secs.to_string(),
        ),
        field(
            "agent.stale_active_secs",
            "PARLEY_AGENT_STALE_ACTIVE_SECS",
            agent.stale_active_secs.to_string(),
        ),
        field(
            "agent.stop_on_tool_failure",
            "PARLEY_AGENT_STOP_ON_TOOL_FAILURE",
            agent.stop_on_tool_failure.to_string(),
        ),
        field("agent.include_debug", "PARLEY_AGENT_INCLUDE_DEBUG", agent.include_debug.to_string()),
        field("server.bind_address", "PARLEY_SERVER_BIND_ADDRESS", config.server.bind_address.clone()),
        field("server.port", "PARLEY_SERVER_PORT", config.server.port.to_string()),
        field(
            "server.graceful_shutdown_secs",
            "PARLEY_SERVER_GRACEFUL_SHUTDOWN_SECS",
            config.server.graceful_shutdown_secs.to_string(),
        ),
        field("logging.level", "PARLEY_LOGGING_LEVEL", config.logging.level.clone()),
        field("logging.format", "PARLEY_LOGGING_FORMAT", format!("{:?}", config.logging.format)),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["parley.toml", "config/parley.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}
