use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ragway_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

use crate::commands::CommandResult;

/// A rendered config entry and the env var that can override it.
struct Entry {
    key: &'static str,
    value: String,
    env_key: &'static str,
}

impl Entry {
    fn new(key: &'static str, value: impl ToString, env_key: &'static str) -> Self {
        Self { key, value: value.to_string(), env_key }
    }
}

pub fn run() -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let file_path = detect_config_path();
    let file_doc = file_path.as_deref().and_then(load_config_file_doc);

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for entry in entries(&config) {
        let source = field_source(&entry, file_doc.as_ref(), file_path.as_deref());
        lines.push(format!("- {} = {} (source: {source})", entry.key, entry.value));
    }

    CommandResult::report(0, lines.join("\n"))
}

fn entries(config: &AppConfig) -> Vec<Entry> {
    let orchestration = &config.orchestration;
    vec![
        Entry::new("database.url", &config.database.url, "RAGWAY_DATABASE_URL"),
        Entry::new(
            "database.max_connections",
            config.database.max_connections,
            "RAGWAY_DATABASE_MAX_CONNECTIONS",
        ),
        Entry::new("database.timeout_secs", config.database.timeout_secs, "RAGWAY_DATABASE_TIMEOUT_SECS"),
        Entry::new("llm.provider", format!("{:?}", config.llm.provider), "RAGWAY_LLM_PROVIDER"),
        Entry::new("llm.model", &config.llm.model, "RAGWAY_LLM_MODEL"),
        Entry::new(
            "llm.base_url",
            config.llm.base_url.as_deref().unwrap_or("<provider default>"),
            "RAGWAY_LLM_BASE_URL",
        ),
        Entry::new("llm.api_key", redact_secret(config.llm.api_key.as_ref()), "RAGWAY_LLM_API_KEY"),
        Entry::new("llm.timeout_secs", config.llm.timeout_secs, "RAGWAY_LLM_TIMEOUT_SECS"),
        Entry::new("llm.max_retries", config.llm.max_retries, "RAGWAY_LLM_MAX_RETRIES"),
        Entry::new("embedding.base_url", &config.embedding.base_url, "RAGWAY_EMBEDDING_BASE_URL"),
        Entry::new("embedding.model", &config.embedding.model, "RAGWAY_EMBEDDING_MODEL"),
        Entry::new(
            "embedding.api_key",
            redact_secret(config.embedding.api_key.as_ref()),
            "RAGWAY_EMBEDDING_API_KEY",
        ),
        Entry::new(
            "embedding.timeout_secs",
            config.embedding.timeout_secs,
            "RAGWAY_EMBEDDING_TIMEOUT_SECS",
        ),
        Entry::new(
            "vector_index.provider",
            format!("{:?}", config.vector_index.provider),
            "RAGWAY_VECTOR_INDEX_PROVIDER",
        ),
        Entry::new("vector_index.url", &config.vector_index.url, "RAGWAY_VECTOR_INDEX_URL"),
        Entry::new(
            "vector_index.api_key",
            redact_secret(config.vector_index.api_key.as_ref()),
            "RAGWAY_VECTOR_INDEX_API_KEY",
        ),
        Entry::new(
            "vector_index.collection_prefix",
            &config.vector_index.collection_prefix,
            "RAGWAY_VECTOR_INDEX_COLLECTION_PREFIX",
        ),
        Entry::new(
            "vector_index.timeout_secs",
            config.vector_index.timeout_secs,
            "RAGWAY_VECTOR_INDEX_TIMEOUT_SECS",
        ),
        Entry::new("server.bind_address", &config.server.bind_address, "RAGWAY_SERVER_BIND_ADDRESS"),
        Entry::new("server.port", config.server.port, "RAGWAY_SERVER_PORT"),
        Entry::new(
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs,
            "RAGWAY_SERVER_GRACEFUL_SHUTDOWN_SECS",
        ),
        Entry::new(
            "orchestration.max_tool_round_trips",
            orchestration.max_tool_round_trips,
            "RAGWAY_ORCHESTRATION_MAX_TOOL_ROUND_TRIPS",
        ),
        Entry::new(
            "orchestration.context_token_limit",
            orchestration.context_token_limit,
            "RAGWAY_ORCHESTRATION_CONTEXT_TOKEN_LIMIT",
        ),
        Entry::new(
            "orchestration.retrieval_timeout_ms",
            orchestration.retrieval_timeout_ms,
            "RAGWAY_ORCHESTRATION_RETRIEVAL_TIMEOUT_MS",
        ),
        Entry::new(
            "orchestration.tool_timeout_ms",
            orchestration.tool_timeout_ms,
            "RAGWAY_ORCHESTRATION_TOOL_TIMEOUT_MS",
        ),
        Entry::new(
            "orchestration.tool_retry_backoff_ms",
            orchestration.tool_retry_backoff_ms,
            "RAGWAY_ORCHESTRATION_TOOL_RETRY_BACKOFF_MS",
        ),
        Entry::new(
            "orchestration.generation_turn_timeout_ms",
            orchestration.generation_turn_timeout_ms,
            "RAGWAY_ORCHESTRATION_GENERATION_TURN_TIMEOUT_MS",
        ),
        Entry::new("logging.level", &config.logging.level, "RAGWAY_LOGGING_LEVEL"),
        Entry::new("logging.format", format!("{:?}", config.logging.format), "RAGWAY_LOGGING_FORMAT"),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("ragway.toml"), PathBuf::from("config/ragway.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: &Path) -> Option<Value> {
    fs::read_to_string(path).ok()?.parse::<Value>().ok()
}

fn field_source(entry: &Entry, file_doc: Option<&Value>, file_path: Option<&Path>) -> String {
    if env::var_os(entry.env_key).is_some() {
        return format!("env ({})", entry.env_key);
    }

    if file_doc.is_some_and(|doc| contains_path(doc, entry.key)) {
        let file_path = file_path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string());
        return format!("file ({file_path})");
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    key_path.split('.').try_fold(root, |current, key| current.get(key)).is_some()
}

fn redact_secret(secret: Option<&SecretString>) -> String {
    let Some(secret) = secret else {
        return "<unset>".to_string();
    };
    let exposed = secret.expose_secret().trim();
    if exposed.is_empty() {
        return "<empty>".to_string();
    }
    match exposed.split_once('-') {
        Some((prefix, _)) if prefix.len() <= 4 => format!("{prefix}-***"),
        _ => "<redacted>".to_string(),
    }
}
