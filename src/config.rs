//! Configuration parsing and validation for tollgate.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Root configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    pub gateway: GatewayConfig,
    pub providers: Vec<ProviderConfig>,
    pub models: Vec<ModelConfig>,
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:4000")
    pub listen: String,
    /// Shared secret required as a bearer token, when set
    pub auth_token: Option<ApiKey>,
    /// Upper bound on concurrently handled requests
    pub max_concurrent_requests: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            auth_token: None,
            max_concurrent_requests: None,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:4000".to_string()
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "./tollgate.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Gateway-wide defaults for upstream calls.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Per-request upstream timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries after the first failed attempt
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
    /// Fixed pause between attempts in milliseconds
    #[serde(default)]
    pub retry_backoff_ms: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_num_retries() -> u32 {
    3
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            num_retries: default_num_retries(),
            retry_backoff_ms: 0,
        }
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// The inner `SecretString` ensures the key value is:
/// - Zeroized in memory when dropped
/// - Never exposed via Debug or Display
/// - Only accessible via `.expose_secret()` (grep-auditable)
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a secret value was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key was a literal string in config (no ${} references)
    Literal,
    /// Key contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Key was auto-discovered from convention env var (holds var name)
    Convention(String),
    /// No key available
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Upstream provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Unique name for this provider
    pub name: String,
    /// Base URL of the OpenAI-compatible API (e.g., "https://api.openai.com/v1")
    pub base_url: String,
    pub api_key: Option<ApiKey>,
    /// Whether requests to this provider need an API key
    pub requires_api_key: bool,
    /// Overrides `gateway.timeout_secs`
    pub timeout_secs: Option<u64>,
    /// Overrides `gateway.num_retries`
    pub num_retries: Option<u32>,
    /// Extra headers sent with every upstream request
    pub headers: BTreeMap<String, String>,
}

/// A logical model exposed to clients.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Client-facing model name
    pub name: String,
    /// Primary provider
    pub provider: String,
    /// Model id sent upstream; defaults to `name`
    pub upstream_model: Option<String>,
    /// Deployments tried after the primary, in order
    #[serde(default)]
    pub fallbacks: Vec<FallbackConfig>,
    /// USD per million prompt tokens
    pub prompt_price_per_million: Option<f64>,
    /// USD per million completion tokens
    pub completion_price_per_million: Option<f64>,
    pub context_length: Option<u32>,
    /// Default generation parameters; client values win
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl ModelConfig {
    /// The model id sent to the primary provider.
    pub fn upstream_model(&self) -> &str {
        self.upstream_model.as_deref().unwrap_or(&self.name)
    }
}

/// An additional deployment for a logical model.
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    pub provider: String,
    pub upstream_model: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for '{owner}': {message}")]
    EnvVar {
        var: String,
        owner: String,
        message: String,
    },

    #[error("Duplicate provider name '{0}'")]
    DuplicateProvider(String),

    #[error("Duplicate model name '{0}'")]
    DuplicateModel(String),

    #[error("Model '{model}' references unknown provider '{provider}'")]
    UnknownProvider { model: String, provider: String },

    #[error("Provider '{provider}' requires an API key (set api_key or {env_var})")]
    MissingCredentials { provider: String, env_var: String },
}

/// Raw server config; `auth_token` may contain `${VAR}` references.
#[derive(Deserialize, Default)]
pub struct RawServerConfig {
    #[serde(default = "default_listen")]
    listen: String,
    auth_token: Option<String>,
    max_concurrent_requests: Option<usize>,
}

/// Raw provider config deserialized directly from TOML.
/// api_key is `Option<String>` so it may contain `${VAR}` references not yet expanded.
#[derive(Deserialize)]
pub struct RawProviderConfig {
    name: String,
    #[serde(alias = "url")]
    base_url: String,
    api_key: Option<String>,
    #[serde(default = "default_true")]
    requires_api_key: bool,
    timeout_secs: Option<u64>,
    num_retries: Option<u32>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

/// Raw configuration deserialized directly from TOML.
/// Secret values may contain `${VAR}` references not yet expanded.
#[derive(Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: RawServerConfig,
    database: Option<DatabaseConfig>,
    #[serde(default)]
    gateway: GatewayConfig,
    #[serde(default)]
    providers: Vec<RawProviderConfig>,
    #[serde(default)]
    models: Vec<ModelConfig>,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// The closure-based design makes this testable without touching global env state.
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v1`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, owner: &str, lookup: &F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            owner: owner.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                owner: owner.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            owner: owner.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced by '{}')",
                var_name, owner
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Derive the convention-based env var name for a provider.
///
/// Transforms provider name to `TOLLGATE_<UPPER_SNAKE_NAME>_API_KEY`:
/// - "openai" -> "TOLLGATE_OPENAI_API_KEY"
/// - "local-llm" -> "TOLLGATE_LOCAL_LLM_API_KEY"
pub fn convention_env_var_name(provider_name: &str) -> String {
    let upper_snake = provider_name.to_uppercase().replace(['-', ' ', '.'], "_");
    format!("TOLLGATE_{}_API_KEY", upper_snake)
}

/// Env var consulted for the gateway's own bearer token when the config has none.
pub const AUTH_TOKEN_ENV_VAR: &str = "TOLLGATE_API_TOKEN";

/// Resolve a secret: `${VAR}` expansion, literal, or convention fallback.
fn resolve_secret<F>(
    raw: Option<&str>,
    owner: &str,
    convention_var: &str,
    lookup: &F,
) -> Result<(Option<ApiKey>, KeySource), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match raw {
        Some(raw_key) if raw_key.contains("${") => {
            let expanded = expand_env_vars_with(raw_key, owner, lookup)?;
            Ok((Some(ApiKey::from(expanded)), KeySource::EnvExpanded))
        }
        Some(raw_key) => Ok((Some(ApiKey::from(raw_key)), KeySource::Literal)),
        None => match lookup(convention_var) {
            Some(value) if !value.is_empty() => Ok((
                Some(ApiKey::from(value)),
                KeySource::Convention(convention_var.to_string()),
            )),
            _ => Ok((None, KeySource::None)),
        },
    }
}

impl Config {
    /// Convert raw (deserialized) config to final config with env var expansion.
    ///
    /// For each provider:
    /// - If `api_key` contains `${VAR}`: expand via `lookup`, source = `EnvExpanded`
    /// - If `api_key` is a literal string: wrap directly, source = `Literal`
    /// - If `api_key` is absent: try `TOLLGATE_<NAME>_API_KEY`,
    ///   source = `Convention(var_name)` or `KeySource::None`
    ///
    /// The server's `auth_token` follows the same rules with `TOLLGATE_API_TOKEN`
    /// as its convention variable.
    pub fn from_raw_with<F>(
        raw: RawConfig,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut providers = Vec::with_capacity(raw.providers.len());
        let mut key_sources = Vec::with_capacity(raw.providers.len());

        for rp in raw.providers {
            let (api_key, source) = resolve_secret(
                rp.api_key.as_deref(),
                &rp.name,
                &convention_env_var_name(&rp.name),
                &lookup,
            )?;

            key_sources.push((rp.name.clone(), source));

            providers.push(ProviderConfig {
                name: rp.name,
                base_url: rp.base_url,
                api_key,
                requires_api_key: rp.requires_api_key,
                timeout_secs: rp.timeout_secs,
                num_retries: rp.num_retries,
                headers: rp.headers,
            });
        }

        let (auth_token, _) = resolve_secret(
            raw.server.auth_token.as_deref(),
            "server",
            AUTH_TOKEN_ENV_VAR,
            &lookup,
        )?;

        let config = Config {
            server: ServerConfig {
                listen: raw.server.listen,
                auth_token: auth_token.filter(|t| !t.expose_secret().is_empty()),
                max_concurrent_requests: raw.server.max_concurrent_requests,
            },
            database: raw.database,
            gateway: raw.gateway,
            providers,
            models: raw.models,
            logging: raw.logging,
        };

        Ok((config, key_sources))
    }

    /// Parse and validate a TOML document, resolving secrets through `lookup`.
    pub fn parse_with_lookup<F>(
        content: &str,
        lookup: F,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        let (config, key_sources) = Self::from_raw_with(raw, lookup)?;
        config.validate()?;
        Ok((config, key_sources))
    }

    /// Parse and validate a TOML document against the process environment.
    pub fn parse_with_env(content: &str) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        Self::parse_with_lookup(content, |name| std::env::var(name).ok())
    }

    /// Parse and validate a TOML document, discarding key source details.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        Self::parse_with_env(content).map(|(config, _)| config)
    }

    /// Load configuration from a TOML file with environment variable expansion.
    ///
    /// Returns the config and per-provider key source information.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_with_env(&content)
    }

    /// Validate the configuration.
    ///
    /// Shared by startup and reload, so a config that boots is a config that reloads.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            tracing::warn!("No models configured - gateway will reject all completions");
        }

        let mut provider_names = HashSet::new();
        for provider in &self.providers {
            if provider.base_url.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has empty base_url",
                    provider.name
                )));
            }
            if !provider_names.insert(provider.name.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
        }

        let mut model_names = HashSet::new();
        let mut referenced = HashSet::new();
        for model in &self.models {
            if !model_names.insert(model.name.as_str()) {
                return Err(ConfigError::DuplicateModel(model.name.clone()));
            }

            let targets = std::iter::once(model.provider.as_str())
                .chain(model.fallbacks.iter().map(|f| f.provider.as_str()));
            for provider in targets {
                if !provider_names.contains(provider) {
                    return Err(ConfigError::UnknownProvider {
                        model: model.name.clone(),
                        provider: provider.to_string(),
                    });
                }
                referenced.insert(provider);
            }

            match (
                model.prompt_price_per_million,
                model.completion_price_per_million,
            ) {
                (Some(p), Some(c)) => {
                    if !(p.is_finite() && c.is_finite() && p >= 0.0 && c >= 0.0) {
                        return Err(ConfigError::Validation(format!(
                            "Model '{}' has an invalid price",
                            model.name
                        )));
                    }
                }
                (None, None) => {}
                _ => {
                    return Err(ConfigError::Validation(format!(
                        "Model '{}' must set both prompt and completion prices, or neither",
                        model.name
                    )));
                }
            }
        }

        for provider in &self.providers {
            let has_key = provider
                .api_key
                .as_ref()
                .is_some_and(|k| !k.expose_secret().is_empty());
            if !provider.requires_api_key || has_key {
                continue;
            }
            if referenced.contains(provider.name.as_str()) {
                return Err(ConfigError::MissingCredentials {
                    provider: provider.name.clone(),
                    env_var: convention_env_var_name(&provider.name),
                });
            }
            tracing::warn!(
                provider = %provider.name,
                "Provider has no API key and no model uses it"
            );
        }

        Ok(())
    }

    /// Get database config with defaults.
    pub fn database(&self) -> DatabaseConfig {
        self.database.clone().unwrap_or_default()
    }
}
