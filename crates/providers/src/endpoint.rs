//! Endpoint resolution.
//!
//! A pure function of the model profile and endpoint settings: which URL the
//! request goes to, which base URL streaming clients use, and which headers
//! ride along.

use std::collections::BTreeMap;

use parley_core::ModelProfile;
use parley_core::model::OPENROUTER_BASE_URL;

pub const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const OPENAI_COMPLETIONS_URL: &str = "https://api.openai.com/v1/completions";
pub const MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";

const OPENROUTER_REFERER: &str = "https://github.com/parley-rs/parley";
const OPENROUTER_TITLE: &str = "Parley";

/// Where and how to send completion requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Provider label used in logs ("openai", "openrouter", "proxy", "custom")
    pub name: String,
    /// URL non-streaming requests are posted to
    pub completions_url: String,
    /// Base URL for the chat streaming route; `None` disables streaming
    pub base_url: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// HTTP(S) proxy
    pub proxy: Option<String>,
}

/// Endpoint settings that are not part of the model profile.
#[derive(Debug, Clone, Default)]
pub struct EndpointOptions<'a> {
    pub reverse_proxy: Option<&'a str>,
    pub headers: Option<&'a std::collections::HashMap<String, String>>,
}

/// Resolve the endpoint for a profile.
///
/// Precedence: explicit `endpoint_override`, OpenRouter, reverse proxy, then
/// the OpenAI chat or text completions route depending on the model.
pub fn resolve(profile: &ModelProfile, options: &EndpointOptions<'_>) -> Endpoint {
    let (name, completions_url) = if let Some(url) = &profile.config.endpoint_override {
        ("custom", url.clone())
    } else if profile.use_openrouter {
        ("openrouter", format!("{OPENROUTER_BASE_URL}/chat/completions"))
    } else if let Some(proxy) = options.reverse_proxy {
        ("proxy", proxy.to_string())
    } else if profile.is_chat_completion {
        ("openai", OPENAI_CHAT_URL.to_string())
    } else {
        ("openai", OPENAI_COMPLETIONS_URL.to_string())
    };

    let mut headers = BTreeMap::new();
    if profile.use_openrouter {
        headers.insert("HTTP-Referer".to_string(), OPENROUTER_REFERER.to_string());
        headers.insert("X-Title".to_string(), OPENROUTER_TITLE.to_string());
    }
    if let Some(extra) = options.headers {
        for (key, value) in extra {
            headers.insert(key.clone(), value.clone());
        }
    }

    Endpoint {
        name: name.to_string(),
        base_url: extract_base_url(&completions_url),
        completions_url,
        headers,
        proxy: profile.config.proxy.clone(),
    }
}

/// The URL prefix ending at the API version segment (`/v1` or `/openai`).
///
/// `https://api.openai.com/v1/chat/completions` → `https://api.openai.com/v1`.
/// Returns `None` for unparseable URLs or paths without a version segment.
pub fn extract_base_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let path = parsed.path();

    let end = ["/v1", "/openai"]
        .iter()
        .filter_map(|marker| {
            path.match_indices(marker)
                .map(|(idx, _)| idx + marker.len())
                .find(|&end| path[end..].is_empty() || path[end..].starts_with('/'))
        })
        .min()?;

    Some(format!(
        "{}{}",
        parsed.origin().ascii_serialization(),
        &path[..end]
    ))
}
