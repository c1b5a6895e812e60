//! Token budget and context strategy.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the assembler handles history that overflows the prompt budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStrategy {
    /// Drop the oldest messages until the rest fits.
    #[default]
    Discard,
    /// Replace the overflow with a running summary.
    Summarize,
}

impl std::fmt::Display for ContextStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discard => f.write_str("discard"),
            Self::Summarize => f.write_str("summarize"),
        }
    }
}

impl std::str::FromStr for ContextStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discard" => Ok(Self::Discard),
            "summarize" | "summary" => Ok(Self::Summarize),
            other => Err(Error::config(format!("unknown context strategy '{other}'"))),
        }
    }
}

/// Token limits for one model.
///
/// Invariant: `max_prompt_tokens + max_response_tokens <= max_context_tokens`.
/// It is checked once, at construction; there is no runtime fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenBudget {
    max_context_tokens: usize,
    max_prompt_tokens: usize,
    max_response_tokens: usize,
}

impl TokenBudget {
    pub fn new(
        max_context_tokens: usize,
        max_prompt_tokens: usize,
        max_response_tokens: usize,
    ) -> Result<Self> {
        let total = max_prompt_tokens.checked_add(max_response_tokens).ok_or_else(|| {
            Error::config(format!(
                "maxPromptTokens + max_tokens ({max_prompt_tokens} + {max_response_tokens}) overflows"
            ))
        })?;
        if total > max_context_tokens {
            return Err(Error::config(format!(
                "maxPromptTokens + max_tokens ({max_prompt_tokens} + {max_response_tokens} = {total}) \
                 must be less than or equal to maxContextTokens ({max_context_tokens})",
            )));
        }
        Ok(Self {
            max_context_tokens,
            max_prompt_tokens,
            max_response_tokens,
        })
    }

    /// Budget whose prompt share is whatever the response leaves over.
    pub fn from_context(max_context_tokens: usize, max_response_tokens: usize) -> Result<Self> {
        let prompt = max_context_tokens.checked_sub(max_response_tokens).ok_or_else(|| {
            Error::config(format!(
                "max_tokens ({max_response_tokens}) exceeds the context window ({max_context_tokens})"
            ))
        })?;
        Self::new(max_context_tokens, prompt, max_response_tokens)
    }

    pub fn max_context_tokens(&self) -> usize {
        self.max_context_tokens
    }

    pub fn max_prompt_tokens(&self) -> usize {
        self.max_prompt_tokens
    }

    pub fn max_response_tokens(&self) -> usize {
        self.max_response_tokens
    }
}
