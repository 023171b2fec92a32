use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use cbag_core::config::{resolve_config_path, AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    render(&config, resolve_config_path(None))
}

pub fn render(config: &AppConfig, config_file_path: Option<PathBuf>) -> String {
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_keys: &[&str]| {
        field_source(key_path, env_keys, config_file_doc.as_ref(), config_file_path.as_deref())
    };

    let entries = vec![
        row(
            "llm.api_key",
            redact_secret(config.llm.api_key.as_ref()),
            &["CBAG_LLM_API_KEY", "GOOGLE_API_KEY"],
        ),
        row("llm.base_url", config.llm.base_url.clone(), &["CBAG_LLM_BASE_URL"]),
        row("llm.model", config.llm.model.clone(), &["CBAG_LLM_MODEL"]),
        row("llm.temperature", config.llm.temperature.to_string(), &["CBAG_LLM_TEMPERATURE"]),
        row("llm.timeout_secs", config.llm.timeout_secs.to_string(), &["CBAG_LLM_TIMEOUT_SECS"]),
        row("llm.max_retries", config.llm.max_retries.to_string(), &["CBAG_LLM_MAX_RETRIES"]),
        row(
            "retrieval.api_key",
            redact_secret(config.retrieval.api_key.as_ref()),
            &["CBAG_RETRIEVAL_API_KEY", "PINECONE_API_KEY"],
        ),
        row("retrieval.base_url", config.retrieval.base_url.clone(), &["CBAG_RETRIEVAL_BASE_URL"]),
        row("retrieval.assistant", config.retrieval.assistant.clone(), &["CBAG_RETRIEVAL_ASSISTANT"]),
        row("retrieval.model", config.retrieval.model.clone(), &["CBAG_RETRIEVAL_MODEL"]),
        row(
            "retrieval.api_version",
            config.retrieval.api_version.clone(),
            &["CBAG_RETRIEVAL_API_VERSION"],
        ),
        row(
            "agent.max_tool_rounds",
            config.agent.max_tool_rounds.to_string(),
            &["CBAG_AGENT_MAX_TOOL_ROUNDS"],
        ),
        row(
            "agent.system_prompt_path",
            config
                .agent
                .system_prompt_path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<built-in>".to_string()),
            &["CBAG_AGENT_SYSTEM_PROMPT_PATH"],
        ),
        row(
            "agent.max_input_chars",
            config.agent.max_input_chars.to_string(),
            &["CBAG_AGENT_MAX_INPUT_CHARS"],
        ),
        row("sessions.store", format!("{:?}", config.sessions.store), &["CBAG_SESSIONS_STORE"]),
        row("database.url", config.database.url.clone(), &["CBAG_DATABASE_URL"]),
        row(
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["CBAG_DATABASE_MAX_CONNECTIONS"],
        ),
        row("server.bind_address", config.server.bind_address.clone(), &["CBAG_SERVER_BIND_ADDRESS"]),
        row("server.port", config.server.port.to_string(), &["CBAG_SERVER_PORT", "PORT"]),
        row(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            &["CBAG_SERVER_GRACEFUL_SHUTDOWN_SECS"],
        ),
        row("logging.level", config.logging.level.clone(), &["CBAG_LOGGING_LEVEL", "CBAG_LOG_LEVEL"]),
        row(
            "logging.format",
            format!("{:?}", config.logging.format),
            &["CBAG_LOGGING_FORMAT", "CBAG_LOG_FORMAT"],
        ),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for entry in entries {
        lines.push(render_line(entry.key, &entry.value, source(entry.key, entry.env_keys)));
    }
    lines.join("\n")
}

struct Row {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

fn row(key: &'static str, value: String, env_keys: &'static [&'static str]) -> Row {
    Row { key, value, env_keys }
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
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

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps at most a four character prefix of long keys.
fn redact_secret(secret: Option<&SecretString>) -> String {
    let Some(secret) = secret else {
        return "<unset>".to_string();
    };

    let trimmed = secret.expose_secret().trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    if trimmed.chars().count() < 12 {
        return "<redacted>".to_string();
    }

    let prefix: String = trimmed.chars().take(4).collect();
    format!("{prefix}***")
}
