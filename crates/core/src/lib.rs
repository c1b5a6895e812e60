//! # Parley Core
//!
//! Domain types, traits, and error definitions for the Parley chat client.
//! This crate has **no HTTP or tokenizer dependencies**; it defines the
//! domain model that the context, provider, and client crates build on.
//!
//! ## Design Philosophy
//!
//! Every collaborator is defined as a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping the LLM backend without touching context budgeting
//! - Easy testing with scripted mock providers
//! - Clean dependency graph (all crates depend inward on core)

pub mod budget;
pub mod error;
pub mod message;
pub mod model;
pub mod provider;
pub mod run;
pub mod usage;

// Re-export key types at crate root for ergonomics
pub use budget::{ContextStrategy, TokenBudget};
pub use error::{Error, ProviderError, Result, TokenizationError};
pub use message::{Conversation, Message, Role};
pub use model::{ModelConfig, ModelProfile, ProfileOptions};
pub use provider::{ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
pub use run::RunState;
pub use usage::{UsageRecord, UsageRecorder};
