//! Summarization of history that no longer fits the context window.
//!
//! The overflow is condensed onto the previous summary with a progressive
//! summary prompt. When not even the newest overflow message fits the
//! summary model's own window, that message is cut to its first and last
//! thirds and summarized with the cut-off prompt instead.

use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;
use parley_core::model::{DEFAULT_CONTEXT_TOKENS, model_max_tokens};
use parley_core::{
    Message, Provider, ProviderError, ProviderRequest, Role, RunState, TokenizationError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::counter::TokenCounter;
use crate::prompts::{self, SummaryTemplate, TRUNCATION_MARKER};

/// Tokens reserved for the summarizer's instruction wrapper and assistant label.
pub const PROMPT_BUFFER: usize = 101;

/// Reserve used when summarizing a cut-off message.
pub const CUT_OFF_BUFFER: usize = 32;

pub const DEFAULT_SUMMARY_MODEL: &str = "gpt-3.5-turbo";

pub const SUMMARY_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Error)]
pub enum SummarizationError {
    /// The run was cancelled with an error recorded against it.
    #[error("{0}")]
    RunFailed(String),

    #[error(transparent)]
    Tokenization(#[from] TokenizationError),
}

/// A condensed stand-in for a range of history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub summary_text: String,
    pub token_count: usize,
    /// Indices of the history messages the summary replaces
    pub covered: Range<usize>,
}

impl SummaryRecord {
    /// The system message spliced into the context.
    pub fn to_message(&self) -> Message {
        Message::system(&self.summary_text).with_token_count(self.token_count)
    }

    /// The record behind a stored summary that `Conversation::history` folded
    /// into a system message. `None` for any other message.
    pub fn from_stored(
        message: &Message,
        counter: &TokenCounter,
    ) -> Result<Option<Self>, TokenizationError> {
        let Some(text) = message.summary.as_deref() else {
            return Ok(None);
        };
        if message.role != Role::System || message.content != text {
            return Ok(None);
        }
        let token_count = match message.summary_token_count {
            Some(count) => count,
            None => counter.count_message(&Message::system(text))?,
        };
        Ok(Some(Self {
            summary_text: text.to_string(),
            token_count,
            covered: 0..1,
        }))
    }
}

/// Produces a summary of overflow messages.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// `Ok(None)` means no summary is available and the caller should discard
    /// the overflow instead.
    async fn summarize(
        &self,
        overflow: &[Message],
        remaining_context_tokens: usize,
        previous_summary: Option<&SummaryRecord>,
        run: &RunState,
    ) -> Result<Option<SummaryRecord>, SummarizationError>;
}

/// [`Summarizer`] that asks a model through a [`Provider`].
pub struct SummarizationEngine {
    provider: Arc<dyn Provider>,
    counter: TokenCounter,
    model: String,
    max_context_tokens: usize,
    temperature: f32,
    user_label: String,
    assistant_label: String,
}

impl SummarizationEngine {
    /// `model` defaults to [`DEFAULT_SUMMARY_MODEL`]; its window comes from the
    /// model table.
    pub fn new(provider: Arc<dyn Provider>, counter: TokenCounter, model: Option<String>) -> Self {
        let model = model.unwrap_or_else(|| DEFAULT_SUMMARY_MODEL.to_string());
        let max_context_tokens = model_max_tokens(&model).unwrap_or(DEFAULT_CONTEXT_TOKENS);
        Self {
            provider,
            counter,
            model,
            max_context_tokens,
            temperature: SUMMARY_TEMPERATURE,
            user_label: "User".into(),
            assistant_label: "Assistant".into(),
        }
    }

    pub fn with_labels(mut self, user: impl Into<String>, assistant: impl Into<String>) -> Self {
        self.user_label = user.into();
        self.assistant_label = assistant.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_context_tokens(mut self, tokens: usize) -> Self {
        self.max_context_tokens = tokens;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_context_tokens(&self) -> usize {
        self.max_context_tokens
    }

    fn tokens_of(&self, message: &Message) -> Result<usize, TokenizationError> {
        match message.token_count {
            Some(count) => Ok(count),
            None => self.counter.count_message(message),
        }
    }

    /// The messages actually sent to the summary model, and the template.
    fn prepare(&self, overflow: &[Message]) -> Result<(Vec<Message>, SummaryTemplate), TokenizationError> {
        let mut excess = PROMPT_BUFFER;
        for message in overflow {
            excess += self.tokens_of(message)?;
        }
        if excess <= self.max_context_tokens {
            return Ok((overflow.to_vec(), SummaryTemplate::Progressive));
        }

        // Newest messages that fit the summary model's window
        let mut total = PROMPT_BUFFER;
        let mut start = overflow.len();
        for (idx, message) in overflow.iter().enumerate().rev() {
            let tokens = self.tokens_of(message)?;
            if total + tokens > self.max_context_tokens {
                break;
            }
            total += tokens;
            start = idx;
        }
        if start < overflow.len() {
            debug!(dropped = start, "Trimmed summary context to the summary model window");
            return Ok((overflow[start..].to_vec(), SummaryTemplate::Progressive));
        }

        debug!("Summary context is empty, using a cut-off of the latest message");
        let Some(latest) = overflow.last() else {
            return Ok((Vec::new(), SummaryTemplate::Progressive));
        };
        Ok((vec![self.cut_off(latest)?], SummaryTemplate::CutOff))
    }

    /// Keep the first and last third of the message, joined by a marker.
    fn cut_off(&self, latest: &Message) -> Result<Message, TokenizationError> {
        let chunk_size = self.max_context_tokens.saturating_sub(CUT_OFF_BUFFER) / 3;
        let chunks = self
            .counter
            .cache()
            .split(&latest.content, self.counter.selector(), chunk_size)?;

        let head = chunks.first().map(String::as_str).unwrap_or_default();
        let tail = match chunks.len() {
            0 | 1 => "",
            _ => chunks.last().map(String::as_str).unwrap_or_default(),
        };

        let mut message = latest.clone();
        message.content = format!("{head}{TRUNCATION_MARKER}{tail}");
        message.token_count = None;
        Ok(message)
    }
}

#[async_trait]
impl Summarizer for SummarizationEngine {
    async fn summarize(
        &self,
        overflow: &[Message],
        remaining_context_tokens: usize,
        previous_summary: Option<&SummaryRecord>,
        run: &RunState,
    ) -> Result<Option<SummaryRecord>, SummarizationError> {
        if overflow.is_empty() {
            return Ok(None);
        }
        debug!(
            messages = overflow.len(),
            model = %self.model,
            remaining_context_tokens,
            "Summarizing messages"
        );

        let (context, template) = self.prepare(overflow)?;
        let lines = prompts::buffer_lines(&context, &self.user_label, &self.assistant_label);
        let previous = match template {
            SummaryTemplate::Progressive => previous_summary.map(|s| s.summary_text.as_str()),
            SummaryTemplate::CutOff => None,
        };
        let prompt = prompts::render_summary_prompt(template, &lines, previous);

        let request = ProviderRequest {
            model: self.model.clone(),
            messages: vec![Message::user(prompt)],
            temperature: Some(self.temperature),
            ..Default::default()
        };

        let outcome = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => Err(ProviderError::Aborted("summarization cancelled".into())),
            result = self.provider.complete(request) => result,
        };

        match outcome {
            Ok(response) => {
                let text = response.message.content.trim();
                if text.is_empty() {
                    warn!(model = %self.model, "Summary model returned an empty summary");
                    return Ok(None);
                }
                let token_count = self.counter.count_message(&Message::system(text))?;
                debug!(summary_tokens = token_count, covered = overflow.len(), "Summary complete");
                Ok(Some(SummaryRecord {
                    summary_text: text.to_string(),
                    token_count,
                    covered: 0..overflow.len(),
                }))
            }
            Err(e) if e.mentions_abort() => {
                if let Some(message) = &run.error {
                    return Err(SummarizationError::RunFailed(message.clone()));
                }
                debug!("Summarization aborted");
                Ok(None)
            }
            Err(e) => {
                error!(error = %e, model = %self.model, "Error summarizing messages");
                Ok(None)
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::{EncodingSelector, TokenizerCache};
    use parley_core::ProviderResponse;
    use std::sync::Mutex;

    enum Reply {
        Text(&'static str),
        Fail(ProviderError),
        Hang,
    }

    struct StubProvider {
        reply: Reply,
        requests: Mutex<Vec<ProviderRequest>>,
    }

    impl StubProvider {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn prompt(&self) -> String {
            let requests = self.requests.lock().unwrap();
            requests[0].messages[0].content.clone()
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
            self.requests.lock().unwrap().push(request);
            match &self.reply {
                Reply::Text(text) => Ok(ProviderResponse {
                    message: Message::assistant(*text),
                    finish_reason: Some("stop".into()),
                    usage: None,
                    model: "stub".into(),
                }),
                Reply::Fail(e) => Err(e.clone()),
                Reply::Hang => std::future::pending().await,
            }
        }
    }

    fn engine(provider: Arc<StubProvider>) -> SummarizationEngine {
        let cache = Arc::new(TokenizerCache::new());
        let counter = TokenCounter::with_selector(cache, EncodingSelector::Chat, "gpt-3.5-turbo");
        SummarizationEngine::new(provider, counter, None).with_labels("Grace", "Helper")
    }

    #[tokio::test]
    async fn summarizes_overflow_onto_previous_summary() {
        let provider = StubProvider::new(Reply::Text("  Grace greeted Helper.  "));
        let engine = engine(provider.clone());
        let previous = SummaryRecord {
            summary_text: "They met before.".into(),
            token_count: 8,
            covered: 0..2,
        };
        let overflow = vec![Message::user("hi").with_token_count(5)];

        let record = engine
            .summarize(&overflow, 40, Some(&previous), &RunState::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.summary_text, "Grace greeted Helper.");
        assert_eq!(record.covered, 0..1);
        assert!(record.token_count > 3);

        let prompt = provider.prompt();
        assert!(prompt.contains("Current summary:\nThey met before."));
        assert!(prompt.contains("Grace: hi"));

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[0].model, DEFAULT_SUMMARY_MODEL);
        assert_eq!(requests[0].temperature, Some(SUMMARY_TEMPERATURE));
    }

    #[tokio::test]
    async fn trims_overflow_to_the_summary_window() {
        let provider = StubProvider::new(Reply::Text("short"));
        let engine = engine(provider.clone());
        let overflow = vec![
            Message::user("oldest").with_token_count(3000),
            Message::assistant("middle").with_token_count(800),
            Message::user("newest").with_token_count(400),
        ];

        engine.summarize(&overflow, 0, None, &RunState::new()).await.unwrap();

        let prompt = provider.prompt();
        assert!(!prompt.contains("oldest"));
        assert!(prompt.contains("Helper: middle\nGrace: newest"));
    }

    #[tokio::test]
    async fn oversized_message_is_cut_off() {
        let provider = StubProvider::new(Reply::Text("A long cut-off text."));
        let engine = engine(provider.clone()).with_max_context_tokens(200);
        let long = (0..400)
            .map(|i| format!("sentence number {i} keeps going."))
            .collect::<Vec<_>>()
            .join(" ");
        let original = Message::user(long.clone());
        let original_tokens = engine.counter.count_message(&original).unwrap();
        assert!(original_tokens > 200);

        let (context, template) = engine.prepare(std::slice::from_ref(&original)).unwrap();
        assert_eq!(template, SummaryTemplate::CutOff);
        assert_eq!(context.len(), 1);
        assert!(context[0].content.contains("...[truncated]..."));
        assert!(context[0].content.starts_with("sentence number 0"));
        assert!(context[0].content.ends_with("keeps going."));
        let cut_tokens = engine.counter.count_message(&context[0]).unwrap();
        assert!(cut_tokens < original_tokens);

        let record = engine
            .summarize(&[original], 0, None, &RunState::new())
            .await
            .unwrap();
        assert!(record.is_some());
        assert!(provider.prompt().starts_with("The following text is cut-off:"));
    }

    #[tokio::test]
    async fn cancelled_run_with_error_raises_it() {
        let engine = engine(StubProvider::new(Reply::Hang));
        let mut run = RunState::new();
        run.record_error("Connection reset by peer");
        run.cancel.cancel();

        let err = engine
            .summarize(&[Message::user("hi").with_token_count(5)], 0, None, &run)
            .await
            .unwrap_err();
        assert!(matches!(err, SummarizationError::RunFailed(_)));
        assert_eq!(err.to_string(), "Connection reset by peer");
    }

    #[tokio::test]
    async fn cancelled_run_without_error_yields_no_summary() {
        let engine = engine(StubProvider::new(Reply::Hang));
        let run = RunState::new();
        run.cancel.cancel();

        let result = engine
            .summarize(&[Message::user("hi").with_token_count(5)], 0, None, &run)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn provider_failure_yields_no_summary() {
        let engine = engine(StubProvider::new(Reply::Fail(ProviderError::ApiError {
            status_code: 500,
            message: "boom".into(),
        })));
        let result = engine
            .summarize(&[Message::user("hi").with_token_count(5)], 0, None, &RunState::new())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn empty_summary_is_unavailable() {
        let engine = engine(StubProvider::new(Reply::Text("   ")));
        let result = engine
            .summarize(&[Message::user("hi").with_token_count(5)], 0, None, &RunState::new())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn stored_summary_is_recognized_only_when_folded() {
        let counter = TokenCounter::with_selector(
            Arc::new(TokenizerCache::new()),
            EncodingSelector::Chat,
            "gpt-3.5-turbo",
        );
        let mut folded = Message::system("They discussed foxes.");
        folded.summary = Some("They discussed foxes.".into());
        folded.summary_token_count = Some(9);

        let record = SummaryRecord::from_stored(&folded, &counter).unwrap().unwrap();
        assert_eq!(record.summary_text, "They discussed foxes.");
        assert_eq!(record.token_count, 9);

        folded.summary_token_count = None;
        let counted = SummaryRecord::from_stored(&folded, &counter).unwrap().unwrap();
        assert_eq!(
            counted.token_count,
            counter.count_message(&Message::system("They discussed foxes.")).unwrap()
        );

        // The original message still carrying its own text is not a summary
        let mut unfolded = Message::user("Tell me about foxes.");
        unfolded.summary = Some("They discussed foxes.".into());
        assert!(SummaryRecord::from_stored(&unfolded, &counter).unwrap().is_none());
        assert!(SummaryRecord::from_stored(&Message::system("hi"), &counter).unwrap().is_none());
    }
}
