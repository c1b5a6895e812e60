//! Context assembly: fitting a conversation into the prompt budget.
//!
//! The history arrives linearized and oldest-first. Every message gets a
//! token count (computed once, then cached on the message), and the newest
//! suffix that fits `max_prompt_tokens` alongside the instructions is kept.
//!
//! # Strategies
//!
//! - **Discard** drops the oldest messages until the rest fits.
//! - **Summarize** hands exactly the messages discard would drop to a
//!   [`Summarizer`] and splices the summary in their place. Without a summary
//!   it behaves like discard.
//!
//! A history that starts with the previous summary (a stored summary folded
//! in by `Conversation::history`) does not send that message through the
//! summarizer again; its text fills the summarizer's current-summary slot.
//!
//! The summary's size is only known after it is made. If it does not fit
//! beside the kept suffix, more of the oldest kept messages are dropped
//! without being summarized. They are counted in
//! [`AssemblyMetadata::displaced_by_summary`] and lie outside
//! [`SummaryRecord::covered`], so a later assembly over the same stored
//! history still sees them.
//!
//! Instructions are never dropped and the newest message is always kept,
//! even when it alone exceeds the budget. In that case the true, over-budget
//! count is reported and left to the caller.

use std::collections::HashMap;

use parley_core::{ContextStrategy, Message, ModelProfile, RunState, TokenBudget, TokenizationError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::counter::TokenCounter;
use crate::summarizer::{SummarizationError, Summarizer, SummaryRecord};

// ── Types ─────────────────────────────────────────────────────────────────

/// Inputs for a single assembly.
pub struct AssemblyInput<'a> {
    /// Linearized history, oldest first. Token counts are attached in place.
    pub history: &'a mut [Message],
    /// System instructions, placed before the newest message.
    pub instructions: Option<Message>,
    /// Running summary from an earlier assembly.
    pub previous_summary: Option<&'a SummaryRecord>,
}

/// The selected messages, ready for a completion request.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub messages: Vec<Message>,
    /// Tokens of every selected message, summary and instructions included.
    pub prompt_tokens: usize,
    /// Token count per message id, for every history message plus the
    /// instructions and summary.
    pub token_count_map: HashMap<String, usize>,
    pub instructions_tokens: Option<usize>,
    /// Summary spliced in place of the oldest messages, if one was made.
    pub summary: Option<SummaryRecord>,
    pub metadata: AssemblyMetadata,
}

/// Metadata about the assembly process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyMetadata {
    /// Configured prompt budget.
    pub budget: usize,
    /// Tokens of the full history before selection.
    pub history_tokens: usize,
    /// History messages kept verbatim.
    pub messages_kept: usize,
    /// Only possible when the newest message alone does not fit.
    pub over_budget: bool,
    /// Messages after the summarized range dropped to make room for the
    /// summary, without being summarized.
    pub displaced_by_summary: usize,
    /// Budget utilization percentage.
    pub utilization_pct: f32,
    pub drops: Vec<DropInfo>,
}

/// Messages removed from the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropInfo {
    pub items_dropped: usize,
    pub tokens_dropped: usize,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Token counting failed: {0}")]
    Tokenization(#[from] TokenizationError),

    #[error("Summarization failed: {0}")]
    Summarization(#[from] SummarizationError),
}

// ── Assembler ─────────────────────────────────────────────────────────────

/// Fits history into a [`TokenBudget`]. Create one per client and reuse it.
pub struct ContextAssembler {
    counter: TokenCounter,
    budget: TokenBudget,
    strategy: ContextStrategy,
}

impl ContextAssembler {
    pub fn new(counter: TokenCounter, budget: TokenBudget, strategy: ContextStrategy) -> Self {
        Self {
            counter,
            budget,
            strategy,
        }
    }

    pub fn for_profile(counter: TokenCounter, profile: &ModelProfile) -> Self {
        Self::new(counter, profile.budget, profile.strategy)
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    pub fn strategy(&self) -> ContextStrategy {
        self.strategy
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    /// Select the messages for the next request.
    ///
    /// Only the summarize strategy suspends; `run` carries the cancellation
    /// token the summarizer observes.
    pub async fn assemble(
        &self,
        input: AssemblyInput<'_>,
        summarizer: Option<&dyn Summarizer>,
        run: &RunState,
    ) -> Result<AssembledContext, AssemblyError> {
        let AssemblyInput {
            history,
            instructions,
            previous_summary,
        } = input;
        let budget = self.budget.max_prompt_tokens();

        let mut counts = Vec::with_capacity(history.len());
        for message in history.iter_mut() {
            counts.push(self.counter.ensure_counted(message)?);
        }
        let mut instructions = instructions;
        let instructions_tokens = match instructions.as_mut() {
            Some(message) => Some(self.counter.ensure_counted(message)?),
            None => None,
        };
        let reserved = instructions_tokens.unwrap_or(0);
        let history_tokens: usize = counts.iter().sum();

        let mut start = if history_tokens + reserved <= budget {
            0
        } else {
            Self::fitting_start(&counts, budget.saturating_sub(reserved))
        };

        let mut drops = Vec::new();
        let mut summary = None;
        let mut displaced_by_summary = 0;

        if start > 0 {
            let summarizer = match (self.strategy, summarizer) {
                (ContextStrategy::Summarize, Some(summarizer)) => Some(summarizer),
                (ContextStrategy::Summarize, None) => {
                    warn!("Summarize strategy without a summarizer, discarding overflow");
                    None
                }
                (ContextStrategy::Discard, _) => None,
            };

            // The folded previous summary goes in the summary slot, not the new lines
            let skip = match previous_summary {
                Some(previous) if history[0].content == previous.summary_text => 1,
                _ => 0,
            };

            let record = match summarizer {
                Some(summarizer) if skip < start => {
                    let kept: usize = counts[start..].iter().sum();
                    let remaining = budget.saturating_sub(kept + reserved);
                    summarizer
                        .summarize(&history[skip..start], remaining, previous_summary, run)
                        .await?
                }
                Some(_) => {
                    debug!("Only the previous summary overflows, discarding it");
                    None
                }
                None => None,
            };

            match record {
                Some(mut record) => {
                    // The summary itself may push the prompt over budget
                    let available = budget.saturating_sub(reserved + record.token_count);
                    let extra = start + Self::fitting_start(&counts[start..], available);
                    let total = counts[extra..].iter().sum::<usize>() + reserved + record.token_count;

                    if total <= budget {
                        record.covered = 0..start;
                        drops.push(Self::drop_info(&counts[..start], "summarized"));
                        if extra > start {
                            drops.push(Self::drop_info(
                                &counts[start..extra],
                                "discarded to fit summary",
                            ));
                        }
                        displaced_by_summary = extra - start;
                        debug!(
                            summarized = start,
                            discarded = displaced_by_summary,
                            summary_tokens = record.token_count,
                            "Spliced summary into context"
                        );
                        start = extra;
                        summary = Some(record);
                    } else {
                        warn!(
                            summary_tokens = record.token_count,
                            "Summary does not fit beside the newest message, discarding overflow"
                        );
                        drops.push(Self::drop_info(&counts[..start], "discarded"));
                    }
                }
                None => {
                    drops.push(Self::drop_info(&counts[..start], "discarded"));
                }
            }

            if summary.is_none() {
                debug!(
                    count = start,
                    tokens = counts[..start].iter().sum::<usize>(),
                    "Dropped oldest messages to fit prompt budget"
                );
            }
        }

        let mut token_count_map: HashMap<String, usize> = history
            .iter()
            .zip(&counts)
            .map(|(message, &count)| (message.id.clone(), count))
            .collect();

        let mut messages = Vec::with_capacity(history.len() - start + 2);
        let mut prompt_tokens = 0;

        if let Some(record) = &summary {
            let message = record.to_message();
            token_count_map.insert(message.id.clone(), record.token_count);
            prompt_tokens += record.token_count;
            messages.push(message);
        }

        messages.extend(history[start..].iter().cloned());
        prompt_tokens += counts[start..].iter().sum::<usize>();

        if let (Some(message), Some(tokens)) = (instructions, instructions_tokens) {
            token_count_map.insert(message.id.clone(), tokens);
            prompt_tokens += tokens;
            let at = messages.len().saturating_sub(1);
            messages.insert(at, message);
        }

        let over_budget = prompt_tokens > budget;
        if over_budget {
            warn!(
                prompt_tokens,
                budget, "Newest message alone exceeds the prompt budget"
            );
        }

        Ok(AssembledContext {
            messages,
            prompt_tokens,
            token_count_map,
            instructions_tokens,
            summary,
            metadata: AssemblyMetadata {
                budget,
                history_tokens,
                messages_kept: history.len() - start,
                over_budget,
                displaced_by_summary,
                utilization_pct: if budget == 0 {
                    0.0
                } else {
                    (prompt_tokens as f32 / budget as f32) * 100.0
                },
                drops,
            },
        })
    }

    /// Index of the oldest message in the newest suffix that fits `available`.
    ///
    /// Never drops the newest message, so the result is at most `len - 1`.
    fn fitting_start(counts: &[usize], available: usize) -> usize {
        let mut total = 0;
        let mut start = counts.len();
        for (idx, &count) in counts.iter().enumerate().rev() {
            if total + count > available {
                break;
            }
            total += count;
            start = idx;
        }
        start.min(counts.len().saturating_sub(1))
    }

    fn drop_info(counts: &[usize], reason: &str) -> DropInfo {
        DropInfo {
            items_dropped: counts.len(),
            tokens_dropped: counts.iter().sum(),
            reason: reason.into(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────
