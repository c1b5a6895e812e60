//! # Parley Context
//!
//! Everything that decides what goes into a model's context window:
//!
//! - [`TokenizerCache`]: process-scoped encoder cache with periodic full flush
//! - [`TokenCounter`]: per-message token accounting for the active model
//! - [`ContextAssembler`]: fits a history plus instructions inside a [`TokenBudget`]
//! - [`SummarizationEngine`]: condenses overflow history under the summarize strategy
//!
//! [`TokenBudget`]: parley_core::TokenBudget

pub mod assembler;
pub mod counter;
pub mod format;
pub mod prompts;
pub mod summarizer;
pub mod tokenizer;

pub use assembler::{AssembledContext, AssemblyError, AssemblyInput, ContextAssembler, DropInfo};
pub use counter::TokenCounter;
pub use format::{format_message, instructions_message, sanitize_name};
pub use summarizer::{SummarizationEngine, SummarizationError, Summarizer, SummaryRecord};
pub use tokenizer::{EncoderFactory, EncodingSelector, TiktokenFactory, TokenEncoder, TokenizerCache};
