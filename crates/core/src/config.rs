use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub vector_index: VectorIndexConfig,
    pub server: ServerConfig,
    pub orchestration: OrchestrationConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout_secs: u64,
}

/// Where collection chunks are searched. `memory` starts empty and is only
/// useful for local runs and tests.
#[derive(Clone, Debug)]
pub struct VectorIndexConfig {
    pub provider: VectorIndexProvider,
    pub url: String,
    pub api_key: Option<SecretString>,
    pub collection_prefix: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

/// Budgets and limits applied to every query session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrchestrationConfig {
    pub max_tool_round_trips: u32,
    pub context_token_limit: usize,
    pub retrieval_timeout_ms: u64,
    pub retrieval_retry_backoff_ms: u64,
    pub tool_timeout_ms: u64,
    pub tool_retry_backoff_ms: u64,
    pub generation_turn_timeout_ms: u64,
    pub persist_retry_backoff_ms: u64,
    pub event_buffer: usize,
}

impl OrchestrationConfig {
    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieval_timeout_ms)
    }

    pub fn retrieval_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retrieval_retry_backoff_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn tool_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.tool_retry_backoff_ms)
    }

    pub fn generation_turn_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_turn_timeout_ms)
    }

    pub fn persist_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.persist_retry_backoff_ms)
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_tool_round_trips: 5,
            context_token_limit: 4_000,
            retrieval_timeout_ms: 5_000,
            retrieval_retry_backoff_ms: 200,
            tool_timeout_ms: 10_000,
            tool_retry_backoff_ms: 100,
            generation_turn_timeout_ms: 60_000,
            persist_retry_backoff_ms: 100,
            event_buffer: 64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorIndexProvider {
    Qdrant,
    Memory,
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
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub embedding_model: Option<String>,
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
                url: "sqlite://ragway.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 60,
                max_retries: 2,
            },
            embedding: EmbeddingConfig {
                base_url: "http://localhost:11434".to_string(),
                api_key: None,
                model: "nomic-embed-text".to_string(),
                timeout_secs: 30,
            },
            vector_index: VectorIndexConfig {
                provider: VectorIndexProvider::Qdrant,
                url: "http://localhost:6333".to_string(),
                api_key: None,
                collection_prefix: "knowledge_collection_".to_string(),
                timeout_secs: 10,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            orchestration: OrchestrationConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for VectorIndexProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "qdrant" => Ok(Self::Qdrant),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::Validation(format!(
                "unsupported vector index provider `{other}` (expected qdrant|memory)"
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("ragway.toml"));
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
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(embedding) = patch.embedding {
            if let Some(base_url) = embedding.base_url {
                self.embedding.base_url = base_url;
            }
            if let Some(embedding_api_key_value) = embedding.api_key {
                self.embedding.api_key = Some(secret_value(embedding_api_key_value));
            }
            if let Some(model) = embedding.model {
                self.embedding.model = model;
            }
            if let Some(timeout_secs) = embedding.timeout_secs {
                self.embedding.timeout_secs = timeout_secs;
            }
        }

        if let Some(vector_index) = patch.vector_index {
            if let Some(provider) = vector_index.provider {
                self.vector_index.provider = provider;
            }
            if let Some(url) = vector_index.url {
                self.vector_index.url = url;
            }
            if let Some(vector_api_key_value) = vector_index.api_key {
                self.vector_index.api_key = Some(secret_value(vector_api_key_value));
            }
            if let Some(collection_prefix) = vector_index.collection_prefix {
                self.vector_index.collection_prefix = collection_prefix;
            }
            if let Some(timeout_secs) = vector_index.timeout_secs {
                self.vector_index.timeout_secs = timeout_secs;
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

        if let Some(orchestration) = patch.orchestration {
            let target = &mut self.orchestration;
            if let Some(value) = orchestration.max_tool_round_trips {
                target.max_tool_round_trips = value;
            }
            if let Some(value) = orchestration.context_token_limit {
                target.context_token_limit = value;
            }
            if let Some(value) = orchestration.retrieval_timeout_ms {
                target.retrieval_timeout_ms = value;
            }
            if let Some(value) = orchestration.retrieval_retry_backoff_ms {
                target.retrieval_retry_backoff_ms = value;
            }
            if let Some(value) = orchestration.tool_timeout_ms {
                target.tool_timeout_ms = value;
            }
            if let Some(value) = orchestration.tool_retry_backoff_ms {
                target.tool_retry_backoff_ms = value;
            }
            if let Some(value) = orchestration.generation_turn_timeout_ms {
                target.generation_turn_timeout_ms = value;
            }
            if let Some(value) = orchestration.persist_retry_backoff_ms {
                target.persist_retry_backoff_ms = value;
            }
            if let Some(value) = orchestration.event_buffer {
                target.event_buffer = value;
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
        if let Some(value) = read_env("RAGWAY_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("RAGWAY_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("RAGWAY_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("RAGWAY_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("RAGWAY_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("RAGWAY_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("RAGWAY_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("RAGWAY_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("RAGWAY_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("RAGWAY_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("RAGWAY_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("RAGWAY_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("RAGWAY_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("RAGWAY_EMBEDDING_BASE_URL") {
            self.embedding.base_url = value;
        }
        if let Some(value) = read_env("RAGWAY_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("RAGWAY_EMBEDDING_MODEL") {
            self.embedding.model = value;
        }
        if let Some(value) = read_env("RAGWAY_EMBEDDING_TIMEOUT_SECS") {
            self.embedding.timeout_secs = parse_u64("RAGWAY_EMBEDDING_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("RAGWAY_VECTOR_INDEX_PROVIDER") {
            self.vector_index.provider = value.parse()?;
        }
        if let Some(value) = read_env("RAGWAY_VECTOR_INDEX_URL") {
            self.vector_index.url = value;
        }
        if let Some(value) = read_env("RAGWAY_VECTOR_INDEX_API_KEY") {
            self.vector_index.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("RAGWAY_VECTOR_INDEX_COLLECTION_PREFIX") {
            self.vector_index.collection_prefix = value;
        }
        if let Some(value) = read_env("RAGWAY_VECTOR_INDEX_TIMEOUT_SECS") {
            self.vector_index.timeout_secs = parse_u64("RAGWAY_VECTOR_INDEX_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("RAGWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("RAGWAY_SERVER_PORT") {
            self.server.port = parse_u16("RAGWAY_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("RAGWAY_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("RAGWAY_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let orchestration = &mut self.orchestration;
        if let Some(value) = read_env("RAGWAY_ORCHESTRATION_MAX_TOOL_ROUND_TRIPS") {
            orchestration.max_tool_round_trips =
                parse_u32("RAGWAY_ORCHESTRATION_MAX_TOOL_ROUND_TRIPS", &value)?;
        }
        if let Some(value) = read_env("RAGWAY_ORCHESTRATION_CONTEXT_TOKEN_LIMIT") {
            orchestration.context_token_limit =
                parse_usize("RAGWAY_ORCHESTRATION_CONTEXT_TOKEN_LIMIT", &value)?;
        }
        if let Some(value) = read_env("RAGWAY_ORCHESTRATION_RETRIEVAL_TIMEOUT_MS") {
            orchestration.retrieval_timeout_ms =
                parse_u64("RAGWAY_ORCHESTRATION_RETRIEVAL_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("RAGWAY_ORCHESTRATION_RETRIEVAL_RETRY_BACKOFF_MS") {
            orchestration.retrieval_retry_backoff_ms =
                parse_u64("RAGWAY_ORCHESTRATION_RETRIEVAL_RETRY_BACKOFF_MS", &value)?;
        }
        if let Some(value) = read_env("RAGWAY_ORCHESTRATION_TOOL_TIMEOUT_MS") {
            orchestration.tool_timeout_ms =
                parse_u64("RAGWAY_ORCHESTRATION_TOOL_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("RAGWAY_ORCHESTRATION_TOOL_RETRY_BACKOFF_MS") {
            orchestration.tool_retry_backoff_ms =
                parse_u64("RAGWAY_ORCHESTRATION_TOOL_RETRY_BACKOFF_MS", &value)?;
        }
        if let Some(value) = read_env("RAGWAY_ORCHESTRATION_GENERATION_TURN_TIMEOUT_MS") {
            orchestration.generation_turn_timeout_ms =
                parse_u64("RAGWAY_ORCHESTRATION_GENERATION_TURN_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("RAGWAY_ORCHESTRATION_PERSIST_RETRY_BACKOFF_MS") {
            orchestration.persist_retry_backoff_ms =
                parse_u64("RAGWAY_ORCHESTRATION_PERSIST_RETRY_BACKOFF_MS", &value)?;
        }
        if let Some(value) = read_env("RAGWAY_ORCHESTRATION_EVENT_BUFFER") {
            orchestration.event_buffer = parse_usize("RAGWAY_ORCHESTRATION_EVENT_BUFFER", &value)?;
        }

        let log_level = read_env("RAGWAY_LOGGING_LEVEL").or_else(|| read_env("RAGWAY_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("RAGWAY_LOGGING_FORMAT").or_else(|| read_env("RAGWAY_LOG_FORMAT"));
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
        if let Some(embedding_model) = overrides.embedding_model {
            self.embedding.model = embedding_model;
        }
        if let Some(server_port) = overrides.server_port {
            self.server.port = server_port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_embedding(&self.embedding)?;
        validate_vector_index(&self.vector_index)?;
        validate_server(&self.server)?;
        validate_orchestration(&self.orchestration)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("ragway.toml"), PathBuf::from("config/ragway.toml")]
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
    if llm.timeout_secs == 0 || llm.timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_embedding(embedding: &EmbeddingConfig) -> Result<(), ConfigError> {
    let base_url = embedding.base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "embedding.base_url must start with http:// or https://".to_string(),
        ));
    }

    if embedding.model.trim().is_empty() {
        return Err(ConfigError::Validation("embedding.model must not be empty".to_string()));
    }

    if embedding.timeout_secs == 0 || embedding.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "embedding.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_vector_index(vector_index: &VectorIndexConfig) -> Result<(), ConfigError> {
    if vector_index.provider == VectorIndexProvider::Memory {
        return Ok(());
    }

    let url = vector_index.url.trim();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "vector_index.url must start with http:// or https://".to_string(),
        ));
    }

    if vector_index.timeout_secs == 0 || vector_index.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "vector_index.timeout_secs must be in range 1..=300".to_string(),
        ));
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

fn validate_orchestration(orchestration: &OrchestrationConfig) -> Result<(), ConfigError> {
    if orchestration.max_tool_round_trips == 0 || orchestration.max_tool_round_trips > 50 {
        return Err(ConfigError::Validation(
            "orchestration.max_tool_round_trips must be in range 1..=50".to_string(),
        ));
    }

    if orchestration.context_token_limit < 256 {
        return Err(ConfigError::Validation(
            "orchestration.context_token_limit must be at least 256".to_string(),
        ));
    }

    let budgets = [
        ("orchestration.retrieval_timeout_ms", orchestration.retrieval_timeout_ms),
        ("orchestration.tool_timeout_ms", orchestration.tool_timeout_ms),
        ("orchestration.generation_turn_timeout_ms", orchestration.generation_turn_timeout_ms),
    ];
    for (key, value) in budgets {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{key} must be greater than zero")));
        }
    }

    let backoffs = [
        ("orchestration.retrieval_retry_backoff_ms", orchestration.retrieval_retry_backoff_ms),
        ("orchestration.tool_retry_backoff_ms", orchestration.tool_retry_backoff_ms),
        ("orchestration.persist_retry_backoff_ms", orchestration.persist_retry_backoff_ms),
    ];
    for (key, value) in backoffs {
        if value > 10_000 {
            return Err(ConfigError::Validation(format!("{key} must be at most 10000")));
        }
    }

    if orchestration.event_buffer == 0 {
        return Err(ConfigError::Validation(
            "orchestration.event_buffer must be greater than zero".to_string(),
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
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    embedding: Option<EmbeddingPatch>,
    vector_index: Option<VectorIndexPatch>,
    server: Option<ServerPatch>,
    orchestration: Option<OrchestrationPatch>,
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
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct EmbeddingPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct VectorIndexPatch {
    provider: Option<VectorIndexProvider>,
    url: Option<String>,
    api_key: Option<String>,
    collection_prefix: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OrchestrationPatch {
    max_tool_round_trips: Option<u32>,
    context_token_limit: Option<usize>,
    retrieval_timeout_ms: Option<u64>,
    retrieval_retry_backoff_ms: Option<u64>,
    tool_timeout_ms: Option<u64>,
    tool_retry_backoff_ms: Option<u64>,
    generation_turn_timeout_ms: Option<u64>,
    persist_retry_backoff_ms: Option<u64>,
    event_buffer: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{
        AppConfig, ConfigError, ConfigOverrides, LlmProvider, LoadOptions, LogFormat,
        VectorIndexProvider,
    };

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_validate_and_expose_orchestration_budgets() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.orchestration.max_tool_round_trips == 5, "default round trips is five")?;
        ensure(
            config.orchestration.retrieval_timeout() == Duration::from_secs(5),
            "default retrieval timeout is five seconds",
        )?;
        ensure(config.orchestration.context_token_limit == 4_000, "default token limit")?;
        ensure(matches!(config.llm.provider, LlmProvider::Ollama), "default provider is ollama")
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_RAGWAY_LLM_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("ragway.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "open_ai"
api_key = "${TEST_RAGWAY_LLM_KEY}"
model = "gpt-4o-mini"

[orchestration]
max_tool_round_trips = 3
tool_timeout_ms = 2500
tool_retry_backoff_ms = 40
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret() == "sk-from-env")
                    == Some(true),
                "api key should be interpolated from environment",
            )?;
            ensure(config.orchestration.max_tool_round_trips == 3, "file round trips applied")?;
            ensure(
                config.orchestration.tool_timeout() == Duration::from_millis(2_500),
                "file tool timeout applied",
            )?;
            ensure(
                config.orchestration.tool_retry_backoff() == Duration::from_millis(40),
                "file tool retry backoff applied",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_RAGWAY_LLM_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RAGWAY_LOG_LEVEL", "warn");
        env::set_var("RAGWAY_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["RAGWAY_LOG_LEVEL", "RAGWAY_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RAGWAY_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("RAGWAY_ORCHESTRATION_CONTEXT_TOKEN_LIMIT", "8000");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("ragway.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[orchestration]
context_token_limit = 2000

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(
                config.orchestration.context_token_limit == 8_000,
                "env token limit should win over file",
            )?;
            Ok(())
        })();

        clear_vars(&["RAGWAY_DATABASE_URL", "RAGWAY_ORCHESTRATION_CONTEXT_TOKEN_LIMIT"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RAGWAY_LLM_PROVIDER", "openai");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("llm.api_key")
            );
            ensure(has_message, "validation failure should mention llm.api_key")
        })();

        clear_vars(&["RAGWAY_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn zero_round_trip_limit_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RAGWAY_ORCHESTRATION_MAX_TOOL_ROUND_TRIPS", "0");

        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("zero round trips should fail validation".to_string()),
            Err(ConfigError::Validation(message)) => {
                ensure(message.contains("max_tool_round_trips"), "message names the field")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
        };

        clear_vars(&["RAGWAY_ORCHESTRATION_MAX_TOOL_ROUND_TRIPS"]);
        result
    }

    #[test]
    fn malformed_numeric_env_is_reported_with_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RAGWAY_ORCHESTRATION_TOOL_TIMEOUT_MS", "soon");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, value }) => ensure(
                key == "RAGWAY_ORCHESTRATION_TOOL_TIMEOUT_MS" && value == "soon",
                "override error carries key and value",
            ),
            Ok(_) => Err("malformed override should fail".to_string()),
            Err(other) => Err(format!("unexpected error: {other}")),
        };

        clear_vars(&["RAGWAY_ORCHESTRATION_TOOL_TIMEOUT_MS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RAGWAY_LLM_API_KEY", "sk-secret-value");
        env::set_var("RAGWAY_EMBEDDING_API_KEY", "emb-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain llm key")?;
            ensure(
                !debug.contains("emb-secret-value"),
                "debug output should not contain embedding key",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["RAGWAY_LLM_API_KEY", "RAGWAY_EMBEDDING_API_KEY"]);
        result
    }

    #[test]
    fn vector_index_defaults_to_qdrant_and_reads_env() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let defaults = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;
        ensure(
            defaults.vector_index.provider == VectorIndexProvider::Qdrant,
            "default vector index is qdrant",
        )?;
        ensure(
            defaults.vector_index.collection_prefix == "knowledge_collection_",
            "default collection prefix",
        )?;

        env::set_var("RAGWAY_VECTOR_INDEX_PROVIDER", "memory");
        env::set_var("RAGWAY_VECTOR_INDEX_API_KEY", "qdrant-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            ensure(
                config.vector_index.provider == VectorIndexProvider::Memory,
                "env selects the memory index",
            )?;
            ensure(
                !format!("{config:?}").contains("qdrant-secret-value"),
                "debug output should not contain vector index key",
            )
        })();

        clear_vars(&["RAGWAY_VECTOR_INDEX_PROVIDER", "RAGWAY_VECTOR_INDEX_API_KEY"]);
        result
    }

    #[test]
    fn qdrant_url_must_be_http() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("RAGWAY_VECTOR_INDEX_URL", "localhost:6333");

        let result = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => Err("scheme-less url should fail validation".to_string()),
            Err(ConfigError::Validation(message)) => {
                ensure(message.contains("vector_index.url"), "message names the field")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
        };

        clear_vars(&["RAGWAY_VECTOR_INDEX_URL"]);
        result
    }
}
