use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["cbag.toml", "config/cbag.toml"];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub agent: AgentConfig,
    pub sessions: SessionsConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub assistant: String,
    pub model: String,
    pub api_version: String,
    pub include_highlights: bool,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_tool_rounds: u32,
    pub system_prompt_path: Option<PathBuf>,
    pub max_input_chars: usize,
}

#[derive(Clone, Debug)]
pub struct SessionsConfig {
    pub store: SessionStoreKind,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStoreKind {
    Memory,
    Sqlite,
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
    pub llm_api_key: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_model: Option<String>,
    pub retrieval_api_key: Option<String>,
    pub retrieval_base_url: Option<String>,
    pub session_store: Option<SessionStoreKind>,
    pub database_url: Option<String>,
    pub server_port: Option<u16>,
    pub log_level: Option<String>,
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
            llm: LlmConfig {
                api_key: None,
                base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                model: "gemini-flash-latest".to_string(),
                temperature: 0.0,
                timeout_secs: 30,
                max_retries: 2,
            },
            retrieval: RetrievalConfig {
                api_key: None,
                base_url: "https://prod-1-data.ke.pinecone.io".to_string(),
                assistant: "cbam".to_string(),
                model: "gpt-4o".to_string(),
                api_version: "2025-01".to_string(),
                include_highlights: true,
                timeout_secs: 60,
            },
            agent: AgentConfig {
                max_tool_rounds: 8,
                system_prompt_path: None,
                max_input_chars: 8_000,
            },
            sessions: SessionsConfig { store: SessionStoreKind::Memory },
            database: DatabaseConfig {
                url: "sqlite://cbag.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for SessionStoreKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(ConfigError::Validation(format!(
                "unsupported session store `{other}` (expected memory|sqlite)"
            ))),
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
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATHS[0]));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }

    pub fn retrieval_configured(&self) -> bool {
        self.retrieval
            .api_key
            .as_ref()
            .map(|key| !key.expose_secret().trim().is_empty())
            .unwrap_or(false)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(llm) = patch.llm {
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(temperature) = llm.temperature {
                self.llm.temperature = temperature;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(retrieval) = patch.retrieval {
            if let Some(retrieval_api_key_value) = retrieval.api_key {
                self.retrieval.api_key = Some(secret_value(retrieval_api_key_value));
            }
            if let Some(base_url) = retrieval.base_url {
                self.retrieval.base_url = base_url;
            }
            if let Some(assistant) = retrieval.assistant {
                self.retrieval.assistant = assistant;
            }
            if let Some(model) = retrieval.model {
                self.retrieval.model = model;
            }
            if let Some(api_version) = retrieval.api_version {
                self.retrieval.api_version = api_version;
            }
            if let Some(include_highlights) = retrieval.include_highlights {
                self.retrieval.include_highlights = include_highlights;
            }
            if let Some(timeout_secs) = retrieval.timeout_secs {
                self.retrieval.timeout_secs = timeout_secs;
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(max_tool_rounds) = agent.max_tool_rounds {
                self.agent.max_tool_rounds = max_tool_rounds;
            }
            if let Some(system_prompt_path) = agent.system_prompt_path {
                self.agent.system_prompt_path = Some(system_prompt_path);
            }
            if let Some(max_input_chars) = agent.max_input_chars {
                self.agent.max_input_chars = max_input_chars;
            }
        }

        if let Some(sessions) = patch.sessions {
            if let Some(store) = sessions.store {
                self.sessions.store = store;
            }
        }

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
        let llm_api_key = read_env("CBAG_LLM_API_KEY").or_else(|| read_env("GOOGLE_API_KEY"));
        if let Some(value) = llm_api_key {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CBAG_LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("CBAG_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CBAG_LLM_TEMPERATURE") {
            self.llm.temperature = parse_f32("CBAG_LLM_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("CBAG_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("CBAG_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CBAG_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("CBAG_LLM_MAX_RETRIES", &value)?;
        }

        let retrieval_api_key =
            read_env("CBAG_RETRIEVAL_API_KEY").or_else(|| read_env("PINECONE_API_KEY"));
        if let Some(value) = retrieval_api_key {
            self.retrieval.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CBAG_RETRIEVAL_BASE_URL") {
            self.retrieval.base_url = value;
        }
        if let Some(value) = read_env("CBAG_RETRIEVAL_ASSISTANT") {
            self.retrieval.assistant = value;
        }
        if let Some(value) = read_env("CBAG_RETRIEVAL_MODEL") {
            self.retrieval.model = value;
        }
        if let Some(value) = read_env("CBAG_RETRIEVAL_API_VERSION") {
            self.retrieval.api_version = value;
        }
        if let Some(value) = read_env("CBAG_RETRIEVAL_INCLUDE_HIGHLIGHTS") {
            self.retrieval.include_highlights =
                parse_bool("CBAG_RETRIEVAL_INCLUDE_HIGHLIGHTS", &value)?;
        }
        if let Some(value) = read_env("CBAG_RETRIEVAL_TIMEOUT_SECS") {
            self.retrieval.timeout_secs = parse_u64("CBAG_RETRIEVAL_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CBAG_AGENT_MAX_TOOL_ROUNDS") {
            self.agent.max_tool_rounds = parse_u32("CBAG_AGENT_MAX_TOOL_ROUNDS", &value)?;
        }
        if let Some(value) = read_env("CBAG_AGENT_SYSTEM_PROMPT_PATH") {
            self.agent.system_prompt_path = Some(PathBuf::from(value));
        }
        if let Some(value) = read_env("CBAG_AGENT_MAX_INPUT_CHARS") {
            self.agent.max_input_chars = parse_usize("CBAG_AGENT_MAX_INPUT_CHARS", &value)?;
        }

        if let Some(value) = read_env("CBAG_SESSIONS_STORE") {
            self.sessions.store = value.parse()?;
        }

        if let Some(value) = read_env("CBAG_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CBAG_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("CBAG_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CBAG_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("CBAG_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CBAG_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        // Hosting platforms hand out the listen port through a bare PORT variable.
        let server_port = read_env("CBAG_SERVER_PORT").map(|value| ("CBAG_SERVER_PORT", value));
        if let Some((key, value)) = server_port.or_else(|| read_env("PORT").map(|v| ("PORT", v))) {
            self.server.port = parse_u16(key, &value)?;
        }
        if let Some(value) = read_env("CBAG_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("CBAG_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level = read_env("CBAG_LOGGING_LEVEL").or_else(|| read_env("CBAG_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format = read_env("CBAG_LOGGING_FORMAT").or_else(|| read_env("CBAG_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = llm_base_url;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(retrieval_api_key) = overrides.retrieval_api_key {
            self.retrieval.api_key = Some(secret_value(retrieval_api_key));
        }
        if let Some(retrieval_base_url) = overrides.retrieval_base_url {
            self.retrieval.base_url = retrieval_base_url;
        }
        if let Some(session_store) = overrides.session_store {
            self.sessions.store = session_store;
        }
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(server_port) = overrides.server_port {
            self.server.port = server_port;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_llm(&self.llm)?;
        validate_retrieval(&self.retrieval)?;
        validate_agent(&self.agent)?;
        if self.sessions.store == SessionStoreKind::Sqlite {
            validate_database(&self.database)?;
        }
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

/// Returns the config file that `load` would read, if any.
pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    DEFAULT_CONFIG_PATHS.into_iter().map(PathBuf::from).find(|path| path.exists())
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

fn is_http_url(value: &str) -> bool {
    let value = value.trim();
    value.starts_with("http://") || value.starts_with("https://")
}

fn validate_timeout(key: &str, timeout_secs: u64) -> Result<(), ConfigError> {
    if timeout_secs == 0 || timeout_secs > 300 {
        return Err(ConfigError::Validation(format!("{key} must be in range 1..=300")));
    }
    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    let missing =
        llm.api_key.as_ref().map(|value| value.expose_secret().trim().is_empty()).unwrap_or(true);
    if missing {
        return Err(ConfigError::Validation(
            "llm.api_key is required. Set CBAG_LLM_API_KEY (or GOOGLE_API_KEY) to a Gemini API key"
                .to_string(),
        ));
    }

    if !is_http_url(&llm.base_url) {
        return Err(ConfigError::Validation(
            "llm.base_url must start with http:// or https://".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if !(0.0..=2.0).contains(&llm.temperature) {
        return Err(ConfigError::Validation(
            "llm.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    validate_timeout("llm.timeout_secs", llm.timeout_secs)
}

fn validate_retrieval(retrieval: &RetrievalConfig) -> Result<(), ConfigError> {
    if !is_http_url(&retrieval.base_url) {
        return Err(ConfigError::Validation(
            "retrieval.base_url must start with http:// or https://".to_string(),
        ));
    }

    if retrieval.assistant.trim().is_empty() {
        return Err(ConfigError::Validation("retrieval.assistant must not be empty".to_string()));
    }

    validate_timeout("retrieval.timeout_secs", retrieval.timeout_secs)
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.max_tool_rounds == 0 || agent.max_tool_rounds > 50 {
        return Err(ConfigError::Validation(
            "agent.max_tool_rounds must be in range 1..=50".to_string(),
        ));
    }

    if agent.max_input_chars == 0 {
        return Err(ConfigError::Validation(
            "agent.max_input_chars must be greater than zero".to_string(),
        ));
    }

    Ok(())
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

    validate_timeout("database.timeout_secs", database.timeout_secs)
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

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.trim().parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.trim().parse::<f32>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.trim().parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    llm: Option<LlmPatch>,
    retrieval: Option<RetrievalPatch>,
    agent: Option<AgentPatch>,
    sessions: Option<SessionsPatch>,
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RetrievalPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    assistant: Option<String>,
    model: Option<String>,
    api_version: Option<String>,
    include_highlights: Option<bool>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    max_tool_rounds: Option<u32>,
    system_prompt_path: Option<PathBuf>,
    max_input_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionsPatch {
    store: Option<SessionStoreKind>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
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
