//! Configuration loading, validation, and management for Parley.
//!
//! Loads configuration from `~/.parley/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use parley_core::{ContextStrategy, ModelConfig, ProfileOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.parley/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the completions endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// How overflowing history is handled
    #[serde(default)]
    pub context_strategy: ContextStrategy,

    /// Overrides the model's context window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<usize>,

    /// Overrides `context window - max_tokens`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_prompt_tokens: Option<usize>,

    /// Instructions sent ahead of every conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_prefix: Option<String>,

    #[serde(default = "default_user_label")]
    pub user_label: String,

    #[serde(default = "default_assistant_label")]
    pub assistant_label: String,

    /// Sampling and model selection
    #[serde(default)]
    pub model: ModelConfig,

    /// Summarization model settings
    #[serde(default)]
    pub summary: SummaryConfig,

    /// Title generation settings
    #[serde(default)]
    pub title: TitleConfig,

    /// Endpoint routing
    #[serde(default)]
    pub endpoint: EndpointConfig,
}

fn default_user_label() -> String {
    "User".into()
}
fn default_assistant_label() -> String {
    "Assistant".into()
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("context_strategy", &self.context_strategy)
            .field("max_context_tokens", &self.max_context_tokens)
            .field("max_prompt_tokens", &self.max_prompt_tokens)
            .field("prompt_prefix", &self.prompt_prefix)
            .field("user_label", &self.user_label)
            .field("assistant_label", &self.assistant_label)
            .field("model", &self.model)
            .field("summary", &self.summary)
            .field("title", &self.title)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    /// Model used for summarization (defaults to the chat model)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default = "default_summary_temperature")]
    pub temperature: f32,
}

fn default_summary_temperature() -> f32 {
    0.2
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: default_summary_temperature(),
        }
    }
}

/// Which title strategy runs first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TitleMethod {
    /// Structured JSON request, then plain completion
    #[default]
    Structured,
    /// Plain completion only
    Completion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Model used for titles
    #[serde(default = "default_title_model")]
    pub model: String,

    #[serde(default)]
    pub method: TitleMethod,
}

fn default_title_model() -> String {
    "gpt-3.5-turbo".into()
}

impl Default for TitleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: default_title_model(),
            method: TitleMethod::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Completions URL of a reverse proxy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_proxy: Option<String>,

    /// HTTP(S) proxy for outgoing requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Force the legacy text-completion prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_prompt: Option<bool>,

    /// Route through OpenRouter
    #[serde(default)]
    pub use_openrouter: bool,

    /// Extra request headers
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.parley/config.toml).
    ///
    /// Also checks environment variables:
    /// - `PARLEY_API_KEY`, then `OPENAI_API_KEY`
    /// - `OPENROUTER_API_KEY` (wins, and routes through OpenRouter)
    /// - `PARLEY_MODEL`, `OPENAI_TITLE_MODEL`, `OPENAI_SUMMARY_MODEL`
    /// - `OPENAI_FORCE_PROMPT`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if self.api_key.is_none() {
            self.api_key = non_empty("PARLEY_API_KEY").or_else(|| non_empty("OPENAI_API_KEY"));
        }

        if let Some(key) = non_empty("OPENROUTER_API_KEY") {
            self.api_key = Some(key);
            self.endpoint.use_openrouter = true;
        }

        if let Some(model) = non_empty("PARLEY_MODEL") {
            self.model.model = model;
        }
        if let Some(model) = non_empty("OPENAI_TITLE_MODEL") {
            self.title.model = model;
        }
        if let Some(model) = non_empty("OPENAI_SUMMARY_MODEL") {
            self.summary.model = Some(model);
        }
        if let Some(flag) = non_empty("OPENAI_FORCE_PROMPT") {
            if self.endpoint.force_prompt.is_none() {
                self.endpoint.force_prompt = Some(is_enabled(&flag));
            }
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("PARLEY_HOME") {
            return PathBuf::from(dir);
        }
        dirs_home().join(".parley")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let model = &self.model;
        if !(0.0..=2.0).contains(&model.temperature) {
            return Err(ConfigError::ValidationError(
                "model.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&model.top_p) {
            return Err(ConfigError::ValidationError(
                "model.top_p must be between 0.0 and 1.0".into(),
            ));
        }
        if !(-2.0..=2.0).contains(&model.presence_penalty) {
            return Err(ConfigError::ValidationError(
                "model.presence_penalty must be between -2.0 and 2.0".into(),
            ));
        }
        if model.model.trim().is_empty() {
            return Err(ConfigError::ValidationError("model.model must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&self.summary.temperature) {
            return Err(ConfigError::ValidationError(
                "summary.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Options for deriving the chat model's profile.
    pub fn profile_options(&self) -> ProfileOptions {
        ProfileOptions {
            strategy: self.context_strategy,
            user_label: self.user_label.clone(),
            assistant_label: self.assistant_label.clone(),
            max_context_tokens: self.max_context_tokens,
            max_prompt_tokens: self.max_prompt_tokens,
            reverse_proxy: self.endpoint.reverse_proxy.clone(),
            use_openrouter: self.endpoint.use_openrouter,
            force_prompt: self.endpoint.force_prompt.unwrap_or(false),
        }
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            context_strategy: ContextStrategy::Discard,
            max_context_tokens: None,
            max_prompt_tokens: None,
            prompt_prefix: None,
            user_label: default_user_label(),
            assistant_label: default_assistant_label(),
            model: ModelConfig::default(),
            summary: SummaryConfig::default(),
            title: TitleConfig::default(),
            endpoint: EndpointConfig::default(),
        }
    }
}

/// Truthy environment flag ("true", "1", "yes").
pub fn is_enabled(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.context_strategy, ContextStrategy::Discard);
        assert_eq!(config.user_label, "User");
        assert_eq!(config.title.method, TitleMethod::Structured);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.model.model, config.model.model);
        assert_eq!(parsed.title.model, config.title.model);
    }

    #[test]
    fn invalid_sampling_rejected() {
        let mut config = AppConfig::default();
        config.model.temperature = 5.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.model.top_p = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.model.presence_penalty = -3.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.model.model, "gpt-3.5-turbo");
    }

    #[test]
    fn loads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
context_strategy = "summarize"
prompt_prefix = "Be brief."
max_prompt_tokens = 2000

[model]
model = "gpt-4"
temperature = 0.3
max_tokens = 512

[title]
method = "completion"

[endpoint]
reverse_proxy = "https://proxy.local/v1/chat/completions"
headers = {{ "X-Team" = "core" }}
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.context_strategy, ContextStrategy::Summarize);
        assert_eq!(config.model.model, "gpt-4");
        assert_eq!(config.model.max_tokens, Some(512));
        assert_eq!(config.title.method, TitleMethod::Completion);
        assert_eq!(config.endpoint.headers.get("X-Team").map(String::as_str), Some("core"));

        let options = config.profile_options();
        assert_eq!(options.strategy, ContextStrategy::Summarize);
        assert_eq!(options.max_prompt_tokens, Some(2000));
        assert!(options.reverse_proxy.is_some());
    }

    #[test]
    fn parse_error_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "context_strategy = [").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn invalid_file_fails_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[model]\ntemperature = 9.0").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn env_overrides() {
        let mut config = AppConfig::default();
        config.apply_env(env(&[
            ("OPENAI_API_KEY", "sk-openai"),
            ("PARLEY_MODEL", "gpt-4"),
            ("OPENAI_TITLE_MODEL", "gpt-4o-mini"),
            ("OPENAI_SUMMARY_MODEL", "gpt-3.5-turbo-16k"),
            ("OPENAI_FORCE_PROMPT", "true"),
        ]));
        assert_eq!(config.api_key.as_deref(), Some("sk-openai"));
        assert_eq!(config.model.model, "gpt-4");
        assert_eq!(config.title.model, "gpt-4o-mini");
        assert_eq!(config.summary.model.as_deref(), Some("gpt-3.5-turbo-16k"));
        assert_eq!(config.endpoint.force_prompt, Some(true));
        assert!(!config.endpoint.use_openrouter);
    }

    #[test]
    fn openrouter_key_wins_and_routes() {
        let mut config = AppConfig {
            api_key: Some("sk-file".into()),
            ..Default::default()
        };
        config.apply_env(env(&[("OPENROUTER_API_KEY", "sk-or-v1-abc")]));
        assert_eq!(config.api_key.as_deref(), Some("sk-or-v1-abc"));
        assert!(config.endpoint.use_openrouter);
        assert!(config.profile_options().use_openrouter);
    }

    #[test]
    fn file_key_beats_plain_env_key() {
        let mut config = AppConfig {
            api_key: Some("sk-file".into()),
            ..Default::default()
        };
        config.apply_env(env(&[("PARLEY_API_KEY", "sk-env")]));
        assert_eq!(config.api_key.as_deref(), Some("sk-file"));
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = AppConfig {
            api_key: Some("sk-secret".into()),
            ..Default::default()
        };
        let debug = format!("{config:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("sk-secret"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("gpt-3.5-turbo"));
        assert!(toml_str.contains("[model]"));
    }

    #[test]
    fn truthy_flags() {
        assert!(is_enabled("TRUE"));
        assert!(is_enabled("1"));
        assert!(!is_enabled("false"));
        assert!(!is_enabled(""));
    }
}
