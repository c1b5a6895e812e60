//! Error types for the Parley domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Parley operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tokenizer errors ---
    #[error("Tokenization error: {0}")]
    Tokenization(#[from] TokenizationError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    /// The provider answered, but not in the shape the protocol promises.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Request aborted: {0}")]
    Aborted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Whether the failure came back from the provider's API surface
    /// (HTTP status, stream, or payload shape) rather than from local setup.
    pub fn is_api_error(&self) -> bool {
        matches!(
            self,
            Self::ApiError { .. }
                | Self::RateLimited { .. }
                | Self::AuthenticationFailed(_)
                | Self::ModelNotFound(_)
                | Self::StreamInterrupted(_)
                | Self::Protocol(_)
                | Self::Timeout(_)
                | Self::Network(_)
        )
    }

    /// Whether the error text says the request was aborted or cancelled.
    pub fn mentions_abort(&self) -> bool {
        if matches!(self, Self::Aborted(_)) {
            return true;
        }
        let text = self.to_string().to_lowercase();
        text.contains("abort") || text.contains("cancel")
    }
}

#[derive(Debug, Clone, Error)]
pub enum TokenizationError {
    #[error("Encoder unavailable for '{encoding}': {reason}")]
    EncoderUnavailable { encoding: String, reason: String },

    #[error("Encoding with '{encoding}' failed: {reason}")]
    EncodeFailed { encoding: String, reason: String },

    #[error("Decoding with '{encoding}' failed: {reason}")]
    DecodeFailed { encoding: String, reason: String },
}
