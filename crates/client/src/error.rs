//! Client error type.

use parley_context::AssemblyError;
use parley_core::{ProviderError, TokenizationError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Core(#[from] parley_core::Error),

    #[error(transparent)]
    Config(#[from] parley_config::ConfigError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Tokenization(#[from] TokenizationError),

    #[error("Title generation failed: {0}")]
    Title(String),

    #[error("No strategy succeeded in '{0}'")]
    Exhausted(String),
}
