//! LLM Provider implementations for Parley.
//!
//! All providers implement the `parley_core::Provider` trait.
//! `endpoint::resolve` decides where requests go.

pub mod endpoint;
pub mod openai_compat;
mod sse;

pub use endpoint::{Endpoint, EndpointOptions, extract_base_url, resolve};
pub use openai_compat::OpenAiCompatProvider;
