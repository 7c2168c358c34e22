use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::hitl::RiskLevel;

#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentConfig {
    pub max_history_length: usize,
    pub risk_threshold: RiskLevel,
    pub confirmation_ttl_secs: u64,
    pub wake_delay_ms: u64,
    pub rotator_interval_secs: u64,
    pub context_budget_secs: u64,
    pub stale_active_secs: u64,
    pub stop_on_tool_failure: bool,
    pub include_debug: bool,
    /// Per-tool risk levels that replace the built-in table.
    pub tool_risk: BTreeMap<String, RiskLevel>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub risk_threshold: Option<RiskLevel>,
    pub max_history_length: Option<usize>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://parley.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig { provider: "loopback".to_string(), model: "echo".to_string() },
            agent: AgentConfig::default(),
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_history_length: 50,
            risk_threshold: RiskLevel::High,
            confirmation_ttl_secs: 300,
            wake_delay_ms: 0,
            rotator_interval_secs: 8,
            context_budget_secs: 120,
            stale_active_secs: 600,
            stop_on_tool_failure: false,
            include_debug: false,
            tool_risk: BTreeMap::new(),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("parley.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(max_history_length) = agent.max_history_length {
                self.agent.max_history_length = max_history_length;
            }
            if let Some(risk_threshold) = agent.risk_threshold {
                self.agent.risk_threshold = risk_threshold;
            }
            if let Some(confirmation_ttl_secs) = agent.confirmation_ttl_secs {
                self.agent.confirmation_ttl_secs = confirmation_ttl_secs;
            }
            if let Some(wake_delay_ms) = agent.wake_delay_ms {
                self.agent.wake_delay_ms = wake_delay_ms;
            }
            if let Some(rotator_interval_secs) = agent.rotator_interval_secs {
                self.agent.rotator_interval_secs = rotator_interval_secs;
            }
            if let Some(context_budget_secs) = agent.context_budget_secs {
                self.agent.context_budget_secs = context_budget_secs;
            }
            if let Some(stale_active_secs) = agent.stale_active_secs {
                self.agent.stale_active_secs = stale_active_secs;
            }
            if let Some(stop_on_tool_failure) = agent.stop_on_tool_failure {
                self.agent.stop_on_tool_failure = stop_on_tool_failure;
            }
            if let Some(include_debug) = agent.include_debug {
                self.agent.include_debug = include_debug;
            }
            if let Some(tool_risk) = agent.tool_risk {
                self.agent.tool_risk.extend(tool_risk);
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PARLEY_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("PARLEY_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_num("PARLEY_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_num("PARLEY_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PARLEY_LLM_PROVIDER") {
            self.llm.provider = value;
        }
        if let Some(value) = read_env("PARLEY_LLM_MODEL") {
            self.llm.model = value;
        }

        if let Some(value) = read_env("PARLEY_AGENT_MAX_HISTORY_LENGTH") {
            self.agent.max_history_length = parse_num("PARLEY_AGENT_MAX_HISTORY_LENGTH", &value)?;
        }
        if let Some(value) = read_env("PARLEY_AGENT_RISK_THRESHOLD") {
            self.agent.risk_threshold = RiskLevel::parse(&value).ok_or_else(|| {
                ConfigError::InvalidEnvOverride {
                    key: "PARLEY_AGENT_RISK_THRESHOLD".to_string(),
                    value: value.clone(),
                }
            })?;
        }
        if let Some(value) = read_env("PARLEY_AGENT_CONFIRMATION_TTL_SECS") {
            self.agent.confirmation_ttl_secs =
                parse_num("PARLEY_AGENT_CONFIRMATION_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_AGENT_WAKE_DELAY_MS") {
            self.agent.wake_delay_ms = parse_num("PARLEY_AGENT_WAKE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_AGENT_ROTATOR_INTERVAL_SECS") {
            self.agent.rotator_interval_secs =
                parse_num("PARLEY_AGENT_ROTATOR_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_AGENT_CONTEXT_BUDGET_SECS") {
            self.agent.context_budget_secs = parse_num("PARLEY_AGENT_CONTEXT_BUDGET_SECS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_AGENT_STALE_ACTIVE_SECS") {
            self.agent.stale_active_secs = parse_num("PARLEY_AGENT_STALE_ACTIVE_SECS", &value)?;
        }
        if let Some(value) = read_env("PARLEY_AGENT_STOP_ON_TOOL_FAILURE") {
            self.agent.stop_on_tool_failure =
                parse_bool("PARLEY_AGENT_STOP_ON_TOOL_FAILURE", &value)?;
        }
        if let Some(value) = read_env("PARLEY_AGENT_INCLUDE_DEBUG") {
            self.agent.include_debug = parse_bool("PARLEY_AGENT_INCLUDE_DEBUG", &value)?;
        }

        if let Some(value) = read_env("PARLEY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("PARLEY_SERVER_PORT") {
            self.server.port = parse_num("PARLEY_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("PARLEY_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_num("PARLEY_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("PARLEY_LOGGING_LEVEL").or_else(|| read_env("PARLEY_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PARLEY_LOGGING_FORMAT").or_else(|| read_env("PARLEY_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(risk_threshold) = overrides.risk_threshold {
            self.agent.risk_threshold = risk_threshold;
        }
        if let Some(max_history_length) = overrides.max_history_length {
            self.agent.max_history_length = max_history_length;
        }
        if let Some(server_port) = overrides.server_port {
            self.server.port = server_port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_agent(&self.agent)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("parley.toml"), PathBuf::from("config/parley.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.provider.trim().is_empty() {
        return Err(ConfigError::Validation("llm.provider must not be empty".to_string()));
    }
    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }
    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.max_history_length == 0 {
        return Err(ConfigError::Validation(
            "agent.max_history_length must be greater than zero".to_string(),
        ));
    }

    if agent.confirmation_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "agent.confirmation_ttl_secs must be greater than zero".to_string(),
        ));
    }

    if agent.rotator_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "agent.rotator_interval_secs must be greater than zero".to_string(),
        ));
    }

    if agent.stale_active_secs < agent.context_budget_secs {
        return Err(ConfigError::Validation(
            "agent.stale_active_secs must be at least agent.context_budget_secs".to_string(),
        ));
    }

    if let Some(tool) = agent.tool_risk.keys().find(|tool| tool.trim().is_empty()) {
        return Err(ConfigError::Validation(format!(
            "agent.tool_risk contains an empty tool name `{tool}`"
        )));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    agent: Option<AgentPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    max_history_length: Option<usize>,
    risk_threshold: Option<RiskLevel>,
    confirmation_ttl_secs: Option<u64>,
    wake_delay_ms: Option<u64>,
    rotator_interval_secs: Option<u64>,
    context_budget_secs: Option<u64>,
    stale_active_secs: Option<u64>,
    stop_on_tool_failure: Option<bool>,
    include_debug: Option<bool>,
    tool_risk: Option<BTreeMap<String, RiskLevel>>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
