//! The chat client facade.
//!
//! One turn: format the history, assemble the context (summarizing overflow
//! when configured), run the completion, then count and record usage.

use std::collections::HashMap;
use std::sync::Arc;

use parley_config::{AppConfig, ConfigError, TitleMethod};
use parley_context::{
    AssemblyInput, ContextAssembler, SummarizationEngine, Summarizer, SummaryRecord,
    TokenCounter, TokenizerCache, format_message, instructions_message,
};
use parley_core::{
    ContextStrategy, Message, ModelConfig, ModelProfile, ProfileOptions, Provider, RunState,
    UsageRecord, UsageRecorder,
};
use parley_providers::{Endpoint, EndpointOptions, OpenAiCompatProvider, resolve};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::orchestrator::{
    CompletionMetadata, CompletionOptions, CompletionOrchestrator, CompletionStatus,
};
use crate::title::TitleGenerator;
use crate::usage::TracingUsageRecorder;

const DEFAULT_USER_LABEL: &str = "User";
const DEFAULT_ASSISTANT_LABEL: &str = "Assistant";

// ── Request / reply ───────────────────────────────────────────────────────

/// Per-turn callbacks and state.
#[derive(Default)]
pub struct SendOptions<'a> {
    /// Receives streamed text. Without it the reply arrives in one piece.
    pub on_token: Option<&'a mut (dyn FnMut(&str) + Send)>,
    pub on_metadata: Option<&'a mut (dyn FnMut(&CompletionMetadata) + Send)>,
    /// Running summary carried over from the previous turn. When unset, a
    /// stored summary folded into the head of the history is used.
    pub previous_summary: Option<&'a SummaryRecord>,
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    /// Trimmed reply text; partial when the status is not `Completed`
    pub text: String,
    pub finish_reason: Option<String>,
    pub status: CompletionStatus,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub token_count_map: HashMap<String, usize>,
    /// Summary produced this turn, to pass back as `previous_summary`
    pub summary: Option<SummaryRecord>,
}

// ── Client ────────────────────────────────────────────────────────────────

pub struct ChatClient {
    profile: ModelProfile,
    orchestrator: CompletionOrchestrator,
    assembler: ContextAssembler,
    counter: TokenCounter,
    summarizer: Option<SummarizationEngine>,
    titles: Option<TitleGenerator>,
    recorder: Arc<dyn UsageRecorder>,
    usage_tasks: TaskTracker,
    prompt_prefix: Option<String>,
    user_name: Option<String>,
    assistant_name: Option<String>,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("model", &self.profile.model())
            .field("provider", &self.orchestrator.provider().name())
            .field("strategy", &self.profile.strategy)
            .field("summarizer", &self.summarizer.as_ref().map(|s| s.model()))
            .field("titles", &self.titles.as_ref().map(|t| t.model()))
            .finish()
    }
}

impl ChatClient {
    pub fn builder(profile: ModelProfile, provider: Arc<dyn Provider>) -> ChatClientBuilder {
        ChatClientBuilder::new(profile, provider)
    }

    /// Build a client for the OpenAI-compatible endpoint the config resolves to.
    pub fn from_config(config: &AppConfig, cache: Arc<TokenizerCache>) -> Result<Self, ClientError> {
        ChatClientBuilder::from_config(config, cache)?.build()
    }

    pub fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    /// Run one chat turn over `history` (linearized, oldest first, ending with
    /// the new user message).
    ///
    /// Token counts computed along the way are written back onto `history`.
    /// A cancelled turn resolves to the partial reply with status `Aborted`.
    /// Usage is recorded on a background task; see [`ChatClient::flush_usage`].
    pub async fn send_message(
        &self,
        history: &mut [Message],
        options: SendOptions<'_>,
        run: &mut RunState,
    ) -> Result<ChatReply, ClientError> {
        let SendOptions {
            on_token,
            on_metadata,
            previous_summary,
        } = options;

        let mut formatted: Vec<Message> = history
            .iter()
            .map(|m| format_message(m, self.user_name.as_deref(), self.assistant_name.as_deref()))
            .collect();
        let stored_summary = match (previous_summary, history.first()) {
            (None, Some(first)) => SummaryRecord::from_stored(first, &self.counter)?,
            _ => None,
        };
        let previous_summary = previous_summary.or(stored_summary.as_ref());

        let instructions = self.prompt_prefix.as_deref().and_then(instructions_message);
        let summarizer = self.summarizer.as_ref().map(|s| s as &dyn Summarizer);

        let assembled = self
            .assembler
            .assemble(
                AssemblyInput {
                    history: &mut formatted,
                    instructions,
                    previous_summary,
                },
                summarizer,
                run,
            )
            .await?;

        for message in history.iter_mut() {
            if message.token_count.is_none() {
                message.token_count = assembled.token_count_map.get(&message.id).copied();
            }
        }
        debug!(
            prompt_tokens = assembled.prompt_tokens,
            kept = assembled.metadata.messages_kept,
            summarized = assembled.summary.is_some(),
            over_budget = assembled.metadata.over_budget,
            "Context assembled"
        );

        let completion = self
            .orchestrator
            .complete(
                &assembled.messages,
                &self.profile,
                CompletionOptions {
                    on_token,
                    on_metadata,
                },
                run,
            )
            .await?;

        let text = completion.reply.trim().to_string();
        let completion_tokens = self.counter.count_response(&text)?;

        if completion.status != CompletionStatus::Aborted || !text.is_empty() {
            let record = UsageRecord::new(
                assembled.prompt_tokens,
                completion_tokens,
                self.profile.model(),
                run.conversation_id.clone(),
            )
            .with_context("message");
            let recorder = Arc::clone(&self.recorder);
            self.usage_tasks.spawn(async move {
                if let Err(e) = recorder.record(record).await {
                    warn!(error = %e, "Failed to record token usage");
                }
            });
        }

        Ok(ChatReply {
            text,
            finish_reason: completion.finish_reason,
            status: completion.status,
            prompt_tokens: assembled.prompt_tokens,
            completion_tokens,
            token_count_map: assembled.token_count_map,
            summary: assembled.summary,
        })
    }

    /// Wait until every usage record spawned so far has been written.
    pub async fn flush_usage(&self) {
        self.usage_tasks.close();
        self.usage_tasks.wait().await;
        self.usage_tasks.reopen();
    }

    /// Title for a first exchange. `None` when titles are disabled or the
    /// request was cancelled.
    pub async fn title_conversation(
        &self,
        text: &str,
        response: &str,
        cancel: CancellationToken,
    ) -> Option<String> {
        self.titles.as_ref()?.generate(text, response, cancel).await
    }
}

// ── Builder ───────────────────────────────────────────────────────────────

pub struct ChatClientBuilder {
    profile: ModelProfile,
    provider: Arc<dyn Provider>,
    aux_provider: Option<Arc<dyn Provider>>,
    cache: Option<Arc<TokenizerCache>>,
    recorder: Option<Arc<dyn UsageRecorder>>,
    prompt_prefix: Option<String>,
    summary_model: Option<String>,
    summary_temperature: Option<f32>,
    titles: Option<(String, TitleMethod)>,
}

impl ChatClientBuilder {
    pub fn new(profile: ModelProfile, provider: Arc<dyn Provider>) -> Self {
        Self {
            profile,
            provider,
            aux_provider: None,
            cache: None,
            recorder: None,
            prompt_prefix: None,
            summary_model: None,
            summary_temperature: None,
            titles: None,
        }
    }

    /// A builder preset from the config: resolved endpoint, auxiliary provider
    /// for summaries and titles, prompt prefix and title settings.
    pub fn from_config(config: &AppConfig, cache: Arc<TokenizerCache>) -> Result<Self, ClientError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            ConfigError::ValidationError(
                "no API key configured (set PARLEY_API_KEY or OPENAI_API_KEY)".into(),
            )
        })?;

        let mut model = config.model.clone();
        if model.proxy.is_none() {
            model.proxy = config.endpoint.proxy.clone();
        }
        let profile = ModelProfile::derive(model, &config.profile_options())?;

        let endpoint = resolve(
            &profile,
            &EndpointOptions {
                reverse_proxy: config.endpoint.reverse_proxy.as_deref(),
                headers: Some(&config.endpoint.headers),
            },
        );
        info!(
            provider = %endpoint.name,
            url = %endpoint.completions_url,
            model = %profile.model(),
            chat = profile.is_chat_completion,
            "Resolved endpoint"
        );

        // Summaries and titles always use the chat route of the same host.
        let aux_endpoint = match &endpoint.base_url {
            Some(base) => Endpoint {
                completions_url: format!("{base}/chat/completions"),
                ..endpoint.clone()
            },
            None => endpoint.clone(),
        };
        let provider = Arc::new(OpenAiCompatProvider::new(endpoint, api_key.clone())?);
        let aux_provider = Arc::new(OpenAiCompatProvider::new(aux_endpoint, api_key)?);

        let mut builder = ChatClientBuilder::new(profile, provider)
            .aux_provider(aux_provider)
            .tokenizer_cache(cache)
            .summary_model(config.summary.model.clone())
            .summary_temperature(config.summary.temperature);
        if let Some(prefix) = &config.prompt_prefix {
            builder = builder.prompt_prefix(prefix.clone());
        }
        if config.title.enabled {
            builder = builder.titles(config.title.model.clone(), config.title.method);
        }
        Ok(builder)
    }

    /// Provider for summaries and titles. Defaults to the main provider.
    pub fn aux_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.aux_provider = Some(provider);
        self
    }

    pub fn tokenizer_cache(mut self, cache: Arc<TokenizerCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn usage_recorder(mut self, recorder: Arc<dyn UsageRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn prompt_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prompt_prefix = Some(prefix.into());
        self
    }

    pub fn summary_model(mut self, model: Option<String>) -> Self {
        self.summary_model = model;
        self
    }

    pub fn summary_temperature(mut self, temperature: f32) -> Self {
        self.summary_temperature = Some(temperature);
        self
    }

    pub fn titles(mut self, model: impl Into<String>, method: TitleMethod) -> Self {
        self.titles = Some((model.into(), method));
        self
    }

    pub fn build(self) -> Result<ChatClient, ClientError> {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(TokenizerCache::new()));
        let aux_provider = self
            .aux_provider
            .unwrap_or_else(|| Arc::clone(&self.provider));
        let profile = self.profile;

        let counter = TokenCounter::new(Arc::clone(&cache), &profile);
        let assembler = ContextAssembler::for_profile(counter.clone(), &profile);

        let summarizer = if profile.strategy == ContextStrategy::Summarize {
            let summary_profile = ModelProfile::derive(
                ModelConfig::for_model(
                    self.summary_model
                        .as_deref()
                        .unwrap_or(parley_context::summarizer::DEFAULT_SUMMARY_MODEL),
                ),
                &ProfileOptions::default(),
            )?;
            let mut engine = SummarizationEngine::new(
                Arc::clone(&aux_provider),
                TokenCounter::new(Arc::clone(&cache), &summary_profile),
                self.summary_model,
            )
            .with_labels(profile.user_label.clone(), profile.assistant_label.clone());
            if let Some(temperature) = self.summary_temperature {
                engine = engine.with_temperature(temperature);
            }
            Some(engine)
        } else {
            None
        };

        let titles = match self.titles {
            Some((model, method)) => Some(TitleGenerator::new(
                CompletionOrchestrator::new(Arc::clone(&aux_provider)),
                &model,
                method,
            )?),
            None => None,
        };

        let user_name = (profile.user_label != DEFAULT_USER_LABEL).then(|| profile.user_label.clone());
        let assistant_name = (profile.assistant_label != DEFAULT_ASSISTANT_LABEL)
            .then(|| profile.assistant_label.clone());

        Ok(ChatClient {
            orchestrator: CompletionOrchestrator::new(self.provider),
            assembler,
            counter,
            summarizer,
            titles,
            recorder: self
                .recorder
                .unwrap_or_else(|| Arc::new(TracingUsageRecorder)),
            usage_tasks: TaskTracker::new(),
            prompt_prefix: self.prompt_prefix,
            user_name,
            assistant_name,
            profile,
        })
    }
}
