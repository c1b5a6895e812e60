//! # Parley Client
//!
//! Drives one chat turn end to end: assemble the context, stream the
//! completion with cancellation, classify provider failures, and record
//! token usage.

pub mod chain;
pub mod client;
pub mod error;
pub mod orchestrator;
pub mod stream_state;
pub mod title;
pub mod usage;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use chain::{Outcome, Strategy, StrategyChain};
pub use client::{ChatClient, ChatClientBuilder, ChatReply, SendOptions};
pub use error::ClientError;
pub use orchestrator::{
    Completion, CompletionMetadata, CompletionOptions, CompletionOrchestrator, CompletionStatus,
};
pub use stream_state::{Phase, StreamAccumulator, StreamAnomaly};
pub use title::{DEFAULT_TITLE, TitleGenerator};
pub use usage::{InMemoryUsageRecorder, TracingUsageRecorder};
