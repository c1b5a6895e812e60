//! Model configuration and the profile derived from it.
//!
//! `ModelConfig` is what the caller supplies. `ModelProfile` is what the rest of
//! the client reads: whether the model speaks the chat protocol, which turn
//! markers and stop sequences apply, and the token budget for a request.

use serde::{Deserialize, Serialize};

use crate::budget::{ContextStrategy, TokenBudget};
use crate::error::Result;

/// Default context window for models missing from the table.
pub const DEFAULT_CONTEXT_TOKENS: usize = 4095;

/// Default reply budget when `max_tokens` is not configured.
pub const DEFAULT_RESPONSE_TOKENS: usize = 1024;

/// Marker the legacy and chat prompts open each turn with.
pub const CHAT_START_TOKEN: &str = "||>";
pub const IM_START: &str = "<|im_start|>";
pub const IM_END: &str = "<|im_end|>";
pub const DIFF_MARKER: &str = "<|diff_marker|>";
pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Known context windows, matched by substring; the longest matching key wins.
const MODEL_CONTEXT_WINDOWS: &[(&str, usize)] = &[
    ("gpt-4", 8191),
    ("gpt-4-0613", 8191),
    ("gpt-4-32k", 32767),
    ("gpt-4-32k-0314", 32767),
    ("gpt-4-32k-0613", 32767),
    ("gpt-4-1106", 127990),
    ("gpt-4-0125", 127990),
    ("gpt-4-turbo", 127990),
    ("gpt-4-vision", 127990),
    ("gpt-4o", 127990),
    ("gpt-4o-mini", 127990),
    ("gpt-3.5-turbo", 4095),
    ("gpt-3.5-turbo-0613", 4095),
    ("gpt-3.5-turbo-0301", 4095),
    ("gpt-3.5-turbo-16k", 15999),
    ("gpt-3.5-turbo-16k-0613", 15999),
    ("gpt-3.5-turbo-1106", 16380),
    ("gpt-3.5-turbo-0125", 16380),
    ("text-davinci-003", 4095),
    ("mistral", 31990),
    ("mixtral", 31990),
];

/// Context window for a model name, if known.
pub fn model_max_tokens(model: &str) -> Option<usize> {
    MODEL_CONTEXT_WINDOWS
        .iter()
        .filter(|(key, _)| model.contains(key))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, tokens)| *tokens)
}

/// Vision models reject stop sequences.
pub fn is_vision_model(model: &str) -> bool {
    model.contains("vision") || model.contains("gpt-4o") || model.contains("gpt-4-turbo")
}

/// Model configuration for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier (e.g., "gpt-3.5-turbo")
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_presence_penalty")]
    pub presence_penalty: f32,

    /// Stop sequences; derived from the turn markers when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,

    /// Reply budget (defaults to 1024)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,

    #[serde(default = "default_true")]
    pub streaming: bool,

    /// Full completions URL overriding the derived one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_override: Option<String>,

    /// HTTP(S) proxy address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

fn default_model() -> String {
    "gpt-3.5-turbo".into()
}

fn default_temperature() -> f32 {
    0.8
}

fn default_top_p() -> f32 {
    1.0
}

fn default_presence_penalty() -> f32 {
    1.0
}

fn default_true() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            presence_penalty: default_presence_penalty(),
            stop: Vec::new(),
            max_tokens: None,
            streaming: true,
            endpoint_override: None,
            proxy: None,
        }
    }
}

impl ModelConfig {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

/// Client-level knobs that shape the profile.
#[derive(Debug, Clone)]
pub struct ProfileOptions {
    pub strategy: ContextStrategy,
    pub user_label: String,
    pub assistant_label: String,
    /// Overrides the table lookup
    pub max_context_tokens: Option<usize>,
    /// Overrides `window - max_response`
    pub max_prompt_tokens: Option<usize>,
    pub reverse_proxy: Option<String>,
    pub use_openrouter: bool,
    pub force_prompt: bool,
}

impl Default for ProfileOptions {
    fn default() -> Self {
        Self {
            strategy: ContextStrategy::Discard,
            user_label: "User".into(),
            assistant_label: "Assistant".into(),
            max_context_tokens: None,
            max_prompt_tokens: None,
            reverse_proxy: None,
            use_openrouter: false,
            force_prompt: false,
        }
    }
}

/// Everything derived from a model configuration.
#[derive(Debug, Clone)]
pub struct ModelProfile {
    pub config: ModelConfig,
    pub is_chat_completion: bool,
    pub is_unofficial_chat_model: bool,
    pub use_openrouter: bool,
    pub start_token: String,
    pub end_token: String,
    pub budget: TokenBudget,
    pub strategy: ContextStrategy,
    pub user_label: String,
    pub assistant_label: String,
}

impl ModelProfile {
    /// Classify the model and compute its budget.
    ///
    /// Returns `Error::Config` when the prompt and response shares do not fit
    /// the context window.
    pub fn derive(config: ModelConfig, options: &ProfileOptions) -> Result<Self> {
        let model = config.model.clone();
        let model = model.as_str();
        let proxy = options.reverse_proxy.as_deref();

        let use_openrouter =
            options.use_openrouter || proxy.is_some_and(|url| url.contains(OPENROUTER_BASE_URL));
        // A proxy pointing at a text completions route forces the legacy prompt.
        let force_prompt = options.force_prompt
            || proxy.is_some_and(|url| url.contains("completions") && !url.contains("chat"));

        let mut is_chat_completion = use_openrouter || proxy.is_some() || model.contains("gpt");
        if model.contains("text-davinci") || model.contains("gpt-3.5-turbo-instruct") || force_prompt
        {
            is_chat_completion = false;
        }
        let is_unofficial_chat_model =
            model.starts_with("text-chat") || model.starts_with("text-davinci-002-render");

        let mut max_context = options
            .max_context_tokens
            .or_else(|| model_max_tokens(model))
            .unwrap_or(DEFAULT_CONTEXT_TOKENS);
        if options.strategy == ContextStrategy::Summarize {
            max_context /= 2;
        }
        let max_response = config.max_tokens.unwrap_or(DEFAULT_RESPONSE_TOKENS);
        let budget = match options.max_prompt_tokens {
            Some(prompt) => TokenBudget::new(max_context, prompt, max_response)?,
            None => TokenBudget::from_context(max_context, max_response)?,
        };

        let (start_token, end_token) = if !is_chat_completion && is_unofficial_chat_model {
            (IM_START.to_string(), IM_END.to_string())
        } else {
            (CHAT_START_TOKEN.to_string(), String::new())
        };

        let mut config = config;
        if is_vision_model(model) {
            config.stop.clear();
        } else if config.stop.is_empty() {
            let mut stop = vec![start_token.clone()];
            if !end_token.is_empty() && end_token != start_token {
                stop.push(end_token.clone());
            }
            stop.push(format!("\n{}:", options.user_label));
            stop.push(DIFF_MARKER.to_string());
            config.stop = stop;
        }

        Ok(Self {
            config,
            is_chat_completion,
            is_unofficial_chat_model,
            use_openrouter,
            start_token,
            end_token,
            budget,
            strategy: options.strategy,
            user_label: options.user_label.clone(),
            assistant_label: options.assistant_label.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_prefers_longest_key() {
        assert_eq!(model_max_tokens("gpt-4"), Some(8191));
        assert_eq!(model_max_tokens("gpt-4-32k-0613"), Some(32767));
        assert_eq!(model_max_tokens("gpt-3.5-turbo-16k"), Some(15999));
        assert_eq!(model_max_tokens("llama-2"), None);
    }

    #[test]
    fn chat_model_profile() {
        let profile =
            ModelProfile::derive(ModelConfig::for_model("gpt-3.5-turbo"), &ProfileOptions::default())
                .unwrap();
        assert!(profile.is_chat_completion);
        assert!(!profile.is_unofficial_chat_model);
        assert_eq!(profile.start_token, "||>");
        assert_eq!(profile.end_token, "");
        assert_eq!(profile.budget.max_context_tokens(), 4095);
        assert_eq!(profile.budget.max_response_tokens(), 1024);
        assert_eq!(profile.budget.max_prompt_tokens(), 3071);
        assert_eq!(profile.config.stop, vec!["||>", "\nUser:", "<|diff_marker|>"]);
    }

    #[test]
    fn legacy_and_unofficial_models() {
        let davinci =
            ModelProfile::derive(ModelConfig::for_model("text-davinci-003"), &ProfileOptions::default())
                .unwrap();
        assert!(!davinci.is_chat_completion);

        let unofficial = ModelProfile::derive(
            ModelConfig::for_model("text-davinci-002-render"),
            &ProfileOptions::default(),
        )
        .unwrap();
        assert!(unofficial.is_unofficial_chat_model);
        assert_eq!(unofficial.start_token, IM_START);
        assert_eq!(unofficial.end_token, IM_END);
        assert_eq!(unofficial.config.stop[1], IM_END);
    }

    #[test]
    fn instruct_and_forced_prompt_are_not_chat() {
        let instruct = ModelProfile::derive(
            ModelConfig::for_model("gpt-3.5-turbo-instruct"),
            &ProfileOptions::default(),
        )
        .unwrap();
        assert!(!instruct.is_chat_completion);

        let forced = ModelProfile::derive(
            ModelConfig::for_model("gpt-4"),
            &ProfileOptions {
                force_prompt: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!forced.is_chat_completion);
    }

    #[test]
    fn proxy_or_openrouter_forces_chat() {
        let profile = ModelProfile::derive(
            ModelConfig::for_model("mistral-7b"),
            &ProfileOptions {
                use_openrouter: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(profile.is_chat_completion);
    }

    #[test]
    fn summarize_halves_window() {
        let profile = ModelProfile::derive(
            ModelConfig::for_model("gpt-4"),
            &ProfileOptions {
                strategy: ContextStrategy::Summarize,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(profile.budget.max_context_tokens(), 4095);
    }

    #[test]
    fn configured_prompt_share_must_fit() {
        let err = ModelProfile::derive(
            ModelConfig::for_model("gpt-3.5-turbo"),
            &ProfileOptions {
                max_prompt_tokens: Some(4000),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be less than or equal to"));
    }

    #[test]
    fn completions_proxy_forces_prompt() {
        let profile = ModelProfile::derive(
            ModelConfig::for_model("gpt-4"),
            &ProfileOptions {
                reverse_proxy: Some("https://proxy.local/v1/completions".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!profile.is_chat_completion);
    }

    #[test]
    fn vision_models_send_no_stop() {
        let profile = ModelProfile::derive(
            ModelConfig::for_model("gpt-4-vision-preview"),
            &ProfileOptions::default(),
        )
        .unwrap();
        assert!(profile.config.stop.is_empty());
    }

    #[test]
    fn explicit_stop_is_kept() {
        let mut config = ModelConfig::for_model("gpt-4");
        config.stop = vec!["END".into()];
        let profile = ModelProfile::derive(config, &ProfileOptions::default()).unwrap();
        assert_eq!(profile.config.stop, vec!["END"]);
    }
}
