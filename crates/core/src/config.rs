use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub email: EmailConfig,
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
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
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<SecretString>,
    pub from_address: String,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

/// Behavioral toggles around the external-collaborator calls. None of
/// these change the orchestrator's control flow; they tune latency and
/// resilience only.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub history_limit: u32,
    pub caching_enabled: bool,
    pub cache_ttl_secs: u64,
    pub retry_enabled: bool,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub page_size: u32,
    pub max_page_size: u32,
    pub timeout_enabled: bool,
    pub timeout_secs: u64,
    pub rate_limit_enabled: bool,
    pub rate_limit_per_minute: u32,
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
    pub llm_api_key: Option<String>,
    pub llm_model: Option<String>,
    pub email_enabled: Option<bool>,
    pub rate_limit_enabled: Option<bool>,
    pub timeout_enabled: Option<bool>,
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
                url: "sqlite://leadline.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434/v1".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
                max_retries: 2,
            },
            email: EmailConfig {
                enabled: false,
                smtp_host: "localhost".to_string(),
                smtp_port: 587,
                smtp_username: None,
                smtp_password: None,
                from_address: "assistant@example.com".to_string(),
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            runtime: RuntimeConfig {
                history_limit: 10,
                caching_enabled: false,
                cache_ttl_secs: 120,
                retry_enabled: false,
                retry_max_attempts: 3,
                retry_initial_delay_ms: 100,
                page_size: 25,
                max_page_size: 100,
                timeout_enabled: false,
                timeout_secs: 30,
                rate_limit_enabled: false,
                rate_limit_per_minute: 30,
            },
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
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("leadline.toml"));
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

        if let Some(email) = patch.email {
            if let Some(enabled) = email.enabled {
                self.email.enabled = enabled;
            }
            if let Some(smtp_host) = email.smtp_host {
                self.email.smtp_host = smtp_host;
            }
            if let Some(smtp_port) = email.smtp_port {
                self.email.smtp_port = smtp_port;
            }
            if let Some(smtp_username) = email.smtp_username {
                self.email.smtp_username = Some(smtp_username);
            }
            if let Some(smtp_password_value) = email.smtp_password {
                self.email.smtp_password = Some(secret_value(smtp_password_value));
            }
            if let Some(from_address) = email.from_address {
                self.email.from_address = from_address;
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

        if let Some(runtime) = patch.runtime {
            if let Some(history_limit) = runtime.history_limit {
                self.runtime.history_limit = history_limit;
            }
            if let Some(caching_enabled) = runtime.caching_enabled {
                self.runtime.caching_enabled = caching_enabled;
            }
            if let Some(cache_ttl_secs) = runtime.cache_ttl_secs {
                self.runtime.cache_ttl_secs = cache_ttl_secs;
            }
            if let Some(retry_enabled) = runtime.retry_enabled {
                self.runtime.retry_enabled = retry_enabled;
            }
            if let Some(retry_max_attempts) = runtime.retry_max_attempts {
                self.runtime.retry_max_attempts = retry_max_attempts;
            }
            if let Some(retry_initial_delay_ms) = runtime.retry_initial_delay_ms {
                self.runtime.retry_initial_delay_ms = retry_initial_delay_ms;
            }
            if let Some(page_size) = runtime.page_size {
                self.runtime.page_size = page_size;
            }
            if let Some(max_page_size) = runtime.max_page_size {
                self.runtime.max_page_size = max_page_size;
            }
            if let Some(timeout_enabled) = runtime.timeout_enabled {
                self.runtime.timeout_enabled = timeout_enabled;
            }
            if let Some(timeout_secs) = runtime.timeout_secs {
                self.runtime.timeout_secs = timeout_secs;
            }
            if let Some(rate_limit_enabled) = runtime.rate_limit_enabled {
                self.runtime.rate_limit_enabled = rate_limit_enabled;
            }
            if let Some(rate_limit_per_minute) = runtime.rate_limit_per_minute {
                self.runtime.rate_limit_per_minute = rate_limit_per_minute;
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
        if let Some(value) = read_env("LEADLINE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("LEADLINE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("LEADLINE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("LEADLINE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADLINE_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("LEADLINE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("LEADLINE_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("LEADLINE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("LEADLINE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("LEADLINE_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("LEADLINE_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("LEADLINE_EMAIL_ENABLED") {
            self.email.enabled = parse_bool("LEADLINE_EMAIL_ENABLED", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_EMAIL_SMTP_HOST") {
            self.email.smtp_host = value;
        }
        if let Some(value) = read_env("LEADLINE_EMAIL_SMTP_PORT") {
            self.email.smtp_port = parse_u16("LEADLINE_EMAIL_SMTP_PORT", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_EMAIL_SMTP_USERNAME") {
            self.email.smtp_username = Some(value);
        }
        if let Some(value) = read_env("LEADLINE_EMAIL_SMTP_PASSWORD") {
            self.email.smtp_password = Some(secret_value(value));
        }
        if let Some(value) = read_env("LEADLINE_EMAIL_FROM_ADDRESS") {
            self.email.from_address = value;
        }

        if let Some(value) = read_env("LEADLINE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("LEADLINE_SERVER_PORT") {
            self.server.port = parse_u16("LEADLINE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("LEADLINE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADLINE_RUNTIME_HISTORY_LIMIT") {
            self.runtime.history_limit = parse_u32("LEADLINE_RUNTIME_HISTORY_LIMIT", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_RUNTIME_CACHING_ENABLED") {
            self.runtime.caching_enabled = parse_bool("LEADLINE_RUNTIME_CACHING_ENABLED", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_RUNTIME_CACHE_TTL_SECS") {
            self.runtime.cache_ttl_secs = parse_u64("LEADLINE_RUNTIME_CACHE_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_RUNTIME_RETRY_ENABLED") {
            self.runtime.retry_enabled = parse_bool("LEADLINE_RUNTIME_RETRY_ENABLED", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_RUNTIME_RETRY_MAX_ATTEMPTS") {
            self.runtime.retry_max_attempts =
                parse_u32("LEADLINE_RUNTIME_RETRY_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_RUNTIME_RETRY_INITIAL_DELAY_MS") {
            self.runtime.retry_initial_delay_ms =
                parse_u64("LEADLINE_RUNTIME_RETRY_INITIAL_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_RUNTIME_PAGE_SIZE") {
            self.runtime.page_size = parse_u32("LEADLINE_RUNTIME_PAGE_SIZE", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_RUNTIME_MAX_PAGE_SIZE") {
            self.runtime.max_page_size = parse_u32("LEADLINE_RUNTIME_MAX_PAGE_SIZE", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_RUNTIME_TIMEOUT_ENABLED") {
            self.runtime.timeout_enabled = parse_bool("LEADLINE_RUNTIME_TIMEOUT_ENABLED", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_RUNTIME_TIMEOUT_SECS") {
            self.runtime.timeout_secs = parse_u64("LEADLINE_RUNTIME_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_RUNTIME_RATE_LIMIT_ENABLED") {
            self.runtime.rate_limit_enabled =
                parse_bool("LEADLINE_RUNTIME_RATE_LIMIT_ENABLED", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_RUNTIME_RATE_LIMIT_PER_MINUTE") {
            self.runtime.rate_limit_per_minute =
                parse_u32("LEADLINE_RUNTIME_RATE_LIMIT_PER_MINUTE", &value)?;
        }

        let log_level =
            read_env("LEADLINE_LOGGING_LEVEL").or_else(|| read_env("LEADLINE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("LEADLINE_LOGGING_FORMAT").or_else(|| read_env("LEADLINE_LOG_FORMAT"));
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
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(email_enabled) = overrides.email_enabled {
            self.email.enabled = email_enabled;
        }
        if let Some(rate_limit_enabled) = overrides.rate_limit_enabled {
            self.runtime.rate_limit_enabled = rate_limit_enabled;
        }
        if let Some(timeout_enabled) = overrides.timeout_enabled {
            self.runtime.timeout_enabled = timeout_enabled;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_email(&self.email)?;
        validate_server(&self.server)?;
        validate_runtime(&self.runtime)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("leadline.toml"), PathBuf::from("config/leadline.toml")]
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
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
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
                    "llm.base_url is required for the ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_email(email: &EmailConfig) -> Result<(), ConfigError> {
    if !email.enabled {
        return Ok(());
    }

    if email.smtp_host.trim().is_empty() {
        return Err(ConfigError::Validation(
            "email.smtp_host is required when email.enabled is true".to_string(),
        ));
    }
    if email.smtp_port == 0 {
        return Err(ConfigError::Validation(
            "email.smtp_port must be greater than zero".to_string(),
        ));
    }
    if !email.from_address.contains('@') {
        return Err(ConfigError::Validation(
            "email.from_address must be a valid email address".to_string(),
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

fn validate_runtime(runtime: &RuntimeConfig) -> Result<(), ConfigError> {
    if runtime.history_limit == 0 || runtime.history_limit > 100 {
        return Err(ConfigError::Validation(
            "runtime.history_limit must be in range 1..=100".to_string(),
        ));
    }
    if runtime.page_size == 0 || runtime.page_size > runtime.max_page_size {
        return Err(ConfigError::Validation(
            "runtime.page_size must be in range 1..=runtime.max_page_size".to_string(),
        ));
    }
    if runtime.retry_enabled && runtime.retry_max_attempts == 0 {
        return Err(ConfigError::Validation(
            "runtime.retry_max_attempts must be greater than zero when retries are enabled"
                .to_string(),
        ));
    }
    if runtime.timeout_enabled && (runtime.timeout_secs == 0 || runtime.timeout_secs > 300) {
        return Err(ConfigError::Validation(
            "runtime.timeout_secs must be in range 1..=300 when the turn timeout is enabled"
                .to_string(),
        ));
    }
    if runtime.rate_limit_enabled && runtime.rate_limit_per_minute == 0 {
        return Err(ConfigError::Validation(
            "runtime.rate_limit_per_minute must be greater than zero when rate limiting is enabled"
                .to_string(),
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

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    email: Option<EmailPatch>,
    server: Option<ServerPatch>,
    runtime: Option<RuntimePatch>,
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
struct EmailPatch {
    enabled: Option<bool>,
    smtp_host: Option<String>,
    smtp_port: Option<u16>,
    smtp_username: Option<String>,
    smtp_password: Option<String>,
    from_address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimePatch {
    history_limit: Option<u32>,
    caching_enabled: Option<bool>,
    cache_ttl_secs: Option<u64>,
    retry_enabled: Option<bool>,
    retry_max_attempts: Option<u32>,
    retry_initial_delay_ms: Option<u64>,
    page_size: Option<u32>,
    max_page_size: Option<u32>,
    timeout_enabled: Option<bool>,
    timeout_secs: Option<u64>,
    rate_limit_enabled: Option<bool>,
    rate_limit_per_minute: Option<u32>,
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

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

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
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_LLM_API_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("leadline.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "openai"
api_key = "${TEST_LLM_API_KEY}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let api_key = config
                .llm
                .api_key
                .as_ref()
                .map(|key| key.expose_secret().to_string())
                .unwrap_or_default();
            ensure(api_key == "sk-from-env", "api key should be loaded from environment")?;
            Ok(())
        })();

        clear_vars(&["TEST_LLM_API_KEY"]);
        result
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LEADLINE_LOG_LEVEL", "warn");
        env::set_var("LEADLINE_LOG_FORMAT", "pretty");

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

        clear_vars(&["LEADLINE_LOG_LEVEL", "LEADLINE_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LEADLINE_DATABASE_URL", "sqlite://from-env.db");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("leadline.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

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
            Ok(())
        })();

        clear_vars(&["LEADLINE_DATABASE_URL"]);
        result
    }

    #[test]
    fn openai_provider_requires_api_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LEADLINE_LLM_PROVIDER", "openai");

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

        clear_vars(&["LEADLINE_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn runtime_page_size_must_not_exceed_max() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LEADLINE_RUNTIME_PAGE_SIZE", "500");
        env::set_var("LEADLINE_RUNTIME_MAX_PAGE_SIZE", "100");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected page size validation failure".to_string()),
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("runtime.page_size")
            );
            ensure(has_message, "validation failure should mention runtime.page_size")
        })();

        clear_vars(&["LEADLINE_RUNTIME_PAGE_SIZE", "LEADLINE_RUNTIME_MAX_PAGE_SIZE"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LEADLINE_LLM_PROVIDER", "openai");
        env::set_var("LEADLINE_LLM_API_KEY", "sk-secret-value");
        env::set_var("LEADLINE_EMAIL_SMTP_PASSWORD", "smtp-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")?;
            ensure(
                !debug.contains("smtp-secret-value"),
                "debug output should not contain smtp password",
            )?;
            Ok(())
        })();

        clear_vars(&[
            "LEADLINE_LLM_PROVIDER",
            "LEADLINE_LLM_API_KEY",
            "LEADLINE_EMAIL_SMTP_PASSWORD",
        ]);
        result
    }
}
