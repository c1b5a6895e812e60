//! Streaming completion orchestration.
//!
//! Issues the completion request (streamed or not), accumulates partial
//! output, enforces cancellation at every suspension point, and classifies
//! provider failures:
//!
//! | failure | result |
//! |---|---|
//! | abort or cancellation | partial reply, status `Aborted` |
//! | known transient pattern, partial reply present | partial reply, status `Recovered` |
//! | API error, partial reply present | partial reply, status `Recovered` |
//! | anything else | error |
//!
//! A cancelled request therefore always resolves to whatever text arrived
//! before the cancellation.

use std::sync::Arc;

use parley_core::model::is_vision_model;
use parley_core::{Message, ModelProfile, Provider, ProviderError, ProviderRequest, RunState, Usage};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::chain::Outcome;
use crate::stream_state::StreamAccumulator;

/// Response ceiling applied to vision models.
pub const VISION_MAX_TOKENS: u32 = 4000;

/// Provider messages that mark a transient failure after partial output.
const KNOWN_TRANSIENT_PATTERNS: [&str; 4] = [
    "Invalid final message",
    "The server had an error processing your request",
    "missing finish_reason",
    "missing role",
];

/// How a completion resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Completed,
    /// Cancelled; the reply holds the text received until then
    Aborted,
    /// A provider failure after partial output; the reply is that output
    Recovered,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub reply: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    pub status: CompletionStatus,
}

/// Reported to the metadata sink after a successful completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMetadata {
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// Callbacks for one completion.
#[derive(Default)]
pub struct CompletionOptions<'a> {
    /// Receives every streamed text delta. Streaming is only used when set.
    pub on_token: Option<&'a mut (dyn FnMut(&str) + Send)>,
    pub on_metadata: Option<&'a mut (dyn FnMut(&CompletionMetadata) + Send)>,
}

/// Drives completion requests against one provider.
#[derive(Clone)]
pub struct CompletionOrchestrator {
    provider: Arc<dyn Provider>,
}

impl CompletionOrchestrator {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Whether a request for `profile` would be streamed.
    ///
    /// Needs a token sink, a chat model with streaming enabled, and a
    /// provider with a resolvable base URL.
    pub fn streams(&self, profile: &ModelProfile, has_token_sink: bool) -> bool {
        has_token_sink
            && profile.config.streaming
            && profile.is_chat_completion
            && self.provider.base_url().is_some()
    }

    /// Run one completion.
    ///
    /// Resolves to the reply unless the failure is fatal. `run.partial_reply`
    /// mirrors the accumulated text and `run.finish_reason` the final reason.
    pub async fn complete(
        &self,
        messages: &[Message],
        profile: &ModelProfile,
        options: CompletionOptions<'_>,
        run: &mut RunState,
    ) -> Result<Completion, ProviderError> {
        let CompletionOptions {
            on_token,
            on_metadata,
        } = options;

        let mut state = StreamAccumulator::new();
        state.begin_request();

        let streaming = self.streams(profile, on_token.is_some());
        let request = build_request(messages, profile, streaming);
        debug!(
            provider = self.provider.name(),
            model = %request.model,
            streaming,
            messages = messages.len(),
            "Sending completion request"
        );

        let result = match on_token {
            Some(on_token) if streaming => self.stream(request, &mut state, on_token, run).await,
            _ => self.complete_once(request, profile, &mut state, run).await,
        };

        let result = result.and_then(|()| state.finish().map_err(|anomaly| anomaly.into_error()));
        run.partial_reply = state.reply().to_string();

        match result {
            Ok(()) => {
                run.finish_reason = state.finish_reason().map(str::to_string);
                let metadata = CompletionMetadata {
                    finish_reason: run.finish_reason.clone(),
                    usage: state.usage(),
                };
                if let Some(on_metadata) = on_metadata {
                    on_metadata(&metadata);
                }
                Ok(Completion {
                    reply: state.reply().to_string(),
                    finish_reason: metadata.finish_reason,
                    usage: metadata.usage,
                    status: CompletionStatus::Completed,
                })
            }
            Err(e) => match classify(e, state.reply()) {
                Outcome::Success(status) => {
                    state.abort();
                    debug!(chars = state.reply().len(), "Completion aborted, returning partial reply");
                    Ok(Completion {
                        reply: state.reply().to_string(),
                        finish_reason: None,
                        usage: state.usage(),
                        status,
                    })
                }
                Outcome::Recoverable(_) => {
                    state.fail();
                    Ok(Completion {
                        reply: state.reply().to_string(),
                        finish_reason: state.finish_reason().map(str::to_string),
                        usage: state.usage(),
                        status: CompletionStatus::Recovered,
                    })
                }
                Outcome::Fatal(e) => {
                    state.fail();
                    run.record_error(e.to_string());
                    Err(e)
                }
            },
        }
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        state: &mut StreamAccumulator,
        on_token: &mut (dyn FnMut(&str) + Send),
        run: &mut RunState,
    ) -> Result<(), ProviderError> {
        let mut rx = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(aborted()),
            rx = self.provider.stream(request) => rx?,
        };
        state.open_stream();

        loop {
            let next = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => None,
                item = rx.recv() => Some(item),
            };
            // Closing the receiver tells the transport task to stop reading
            let Some(item) = next else {
                rx.close();
                return Err(aborted());
            };

            match item {
                None => return Ok(()),
                Some(Ok(chunk)) => {
                    if let Some(text) = state.push(&chunk) {
                        on_token(text);
                        run.partial_reply.push_str(text);
                    }
                    if run.is_cancelled() {
                        rx.close();
                        return Err(aborted());
                    }
                    if chunk.done {
                        return Ok(());
                    }
                }
                Some(Err(e)) => return Err(e),
            }
        }
    }

    async fn complete_once(
        &self,
        request: ProviderRequest,
        profile: &ModelProfile,
        state: &mut StreamAccumulator,
        run: &RunState,
    ) -> Result<(), ProviderError> {
        state.begin_non_streaming();
        let response = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(aborted()),
            response = self.provider.complete(request) => response?,
        };

        let mut reply = response.message.content;
        if !profile.is_chat_completion && !profile.end_token.is_empty() {
            let trimmed = reply.trim_end();
            if let Some(stripped) = trimmed.strip_suffix(profile.end_token.as_str()) {
                reply = stripped.to_string();
            }
        }

        state.push(&parley_core::StreamChunk {
            content: Some(reply),
            role: Some(response.message.role),
            finish_reason: response.finish_reason,
            done: true,
            usage: response.usage,
        });
        Ok(())
    }
}

fn aborted() -> ProviderError {
    ProviderError::Aborted("request aborted".into())
}

/// Decide how a failed completion resolves given the partial reply so far.
///
/// `Success` carries the status to return the partial reply with.
pub fn classify(error: ProviderError, partial: &str) -> Outcome<CompletionStatus, ProviderError> {
    if error.mentions_abort() {
        return Outcome::Success(CompletionStatus::Aborted);
    }

    let message = error.to_string();
    if KNOWN_TRANSIENT_PATTERNS.iter().any(|p| message.contains(p)) {
        error!(error = %message, partial_chars = partial.len(), "Known provider error");
        return if partial.is_empty() {
            Outcome::Fatal(error)
        } else {
            Outcome::Recoverable(error)
        };
    }

    if error.is_api_error() && !partial.is_empty() {
        debug!(error = %message, "Provider failed after partial output, keeping it");
        return Outcome::Recoverable(error);
    }

    error!(error = %message, "Unhandled provider error");
    Outcome::Fatal(error)
}

/// Build the provider request for a profile.
///
/// Chat models get the messages; completion models get them rendered as a
/// single prompt.
pub fn build_request(messages: &[Message], profile: &ModelProfile, stream: bool) -> ProviderRequest {
    let config = &profile.config;
    let mut request = ProviderRequest {
        model: config.model.clone(),
        temperature: Some(config.temperature),
        top_p: Some(config.top_p),
        presence_penalty: Some(config.presence_penalty),
        max_tokens: config.max_tokens.and_then(|t| u32::try_from(t).ok()),
        stream,
        stop: config.stop.clone(),
        ..Default::default()
    };

    if is_vision_model(&config.model) {
        request.max_tokens = Some(VISION_MAX_TOKENS);
    }

    if profile.is_chat_completion {
        request.messages = messages.to_vec();
    } else {
        request.prompt = Some(render_prompt(messages, profile));
    }
    request
}

/// Render messages as a completion prompt ending at the assistant's turn.
pub fn render_prompt(messages: &[Message], profile: &ModelProfile) -> String {
    let start = &profile.start_token;
    let end = &profile.end_token;

    let mut prompt = String::new();
    for message in messages {
        let label = match message.role {
            parley_core::Role::User => profile.user_label.as_str(),
            parley_core::Role::Assistant => profile.assistant_label.as_str(),
            parley_core::Role::System => "System",
        };
        prompt.push_str(&format!("{start}{label}:\n{}{end}\n", message.content));
    }
    prompt.push_str(&format!("{start}{}:\n", profile.assistant_label));
    prompt
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedProvider, chat_profile, legacy_profile, partial_chunks, text_chunks};
    use parley_core::{Role, StreamChunk};
    use tokio_util::sync::CancellationToken;

    fn history() -> Vec<Message> {
        vec![Message::user("Tell me a story")]
    }

    #[tokio::test]
    async fn streams_tokens_and_reports_metadata() {
        let provider = Arc::new(ScriptedProvider::streaming(text_chunks(&["Once", " upon", " a time"])));
        let orchestrator = CompletionOrchestrator::new(provider.clone());

        let mut tokens = Vec::new();
        let mut on_token = |t: &str| tokens.push(t.to_string());
        let mut metadata = None;
        let mut on_metadata = |m: &CompletionMetadata| metadata = Some(m.clone());
        let mut run = RunState::new();

        let completion = orchestrator
            .complete(
                &history(),
                &chat_profile(),
                CompletionOptions {
                    on_token: Some(&mut on_token),
                    on_metadata: Some(&mut on_metadata),
                },
                &mut run,
            )
            .await
            .unwrap();

        assert_eq!(completion.reply, "Once upon a time");
        assert_eq!(completion.status, CompletionStatus::Completed);
        assert_eq!(tokens, vec!["Once", " upon", " a time"]);
        assert_eq!(metadata.unwrap().finish_reason.as_deref(), Some("stop"));
        assert_eq!(run.finish_reason.as_deref(), Some("stop"));
        assert!(provider.last_request().stream);
    }

    #[tokio::test]
    async fn cancel_mid_stream_returns_first_chunks() {
        let provider = Arc::new(ScriptedProvider::streaming(text_chunks(&["a", "b", "c", "d", "e"])));
        let orchestrator = CompletionOrchestrator::new(provider);

        let token = CancellationToken::new();
        let mut run = RunState::with_cancel(token.clone());
        let mut seen = 0;
        let mut on_token = |_: &str| {
            seen += 1;
            if seen == 3 {
                token.cancel();
            }
        };

        let completion = orchestrator
            .complete(
                &history(),
                &chat_profile(),
                CompletionOptions {
                    on_token: Some(&mut on_token),
                    on_metadata: None,
                },
                &mut run,
            )
            .await
            .unwrap();

        assert_eq!(completion.reply, "abc");
        assert_eq!(completion.status, CompletionStatus::Aborted);
        assert_eq!(run.partial_reply, "abc");
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_the_next_chunk() {
        let provider = Arc::new(ScriptedProvider::hanging_after(partial_chunks(&["x", "y"])));
        let orchestrator = CompletionOrchestrator::new(provider);

        let token = CancellationToken::new();
        let mut run = RunState::with_cancel(token.clone());
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let mut on_token = |_: &str| {};
        let completion = orchestrator
            .complete(
                &history(),
                &chat_profile(),
                CompletionOptions {
                    on_token: Some(&mut on_token),
                    on_metadata: None,
                },
                &mut run,
            )
            .await
            .unwrap();

        assert_eq!(completion.reply, "xy");
        assert_eq!(completion.status, CompletionStatus::Aborted);
    }

    #[tokio::test]
    async fn missing_finish_reason_keeps_partial_reply() {
        let mut chunks = text_chunks(&["partial", " answer"]);
        chunks.pop();
        let provider = Arc::new(
            ScriptedProvider::streaming(chunks).then_error(ProviderError::StreamInterrupted(
                "missing finish_reason for choice 0".into(),
            )),
        );
        let orchestrator = CompletionOrchestrator::new(provider);
        let mut on_token = |_: &str| {};

        let completion = orchestrator
            .complete(
                &history(),
                &chat_profile(),
                CompletionOptions {
                    on_token: Some(&mut on_token),
                    on_metadata: None,
                },
                &mut RunState::new(),
            )
            .await
            .unwrap();

        assert_eq!(completion.reply, "partial answer");
        assert_eq!(completion.status, CompletionStatus::Recovered);
    }

    #[tokio::test]
    async fn missing_finish_reason_without_output_is_raised() {
        let provider = Arc::new(ScriptedProvider::streaming(Vec::new()).then_error(
            ProviderError::StreamInterrupted("missing finish_reason for choice 0".into()),
        ));
        let orchestrator = CompletionOrchestrator::new(provider);
        let mut on_token = |_: &str| {};
        let mut run = RunState::new();

        let err = orchestrator
            .complete(
                &history(),
                &chat_profile(),
                CompletionOptions {
                    on_token: Some(&mut on_token),
                    on_metadata: None,
                },
                &mut run,
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("missing finish_reason"));
        assert!(run.error.is_some());
    }

    #[tokio::test]
    async fn unexpected_role_surfaces_partial_reply() {
        let chunks = vec![
            StreamChunk {
                role: Some(Role::User),
                content: Some("odd".into()),
                ..Default::default()
            },
            StreamChunk {
                finish_reason: Some("stop".into()),
                done: true,
                ..Default::default()
            },
        ];
        let provider = Arc::new(ScriptedProvider::streaming(chunks));
        let orchestrator = CompletionOrchestrator::new(provider);
        let mut on_token = |_: &str| {};
        let mut metadata_calls = 0;
        let mut on_metadata = |_: &CompletionMetadata| metadata_calls += 1;

        let completion = orchestrator
            .complete(
                &history(),
                &chat_profile(),
                CompletionOptions {
                    on_token: Some(&mut on_token),
                    on_metadata: Some(&mut on_metadata),
                },
                &mut RunState::new(),
            )
            .await
            .unwrap();

        assert_eq!(completion.reply, "odd");
        assert_eq!(completion.status, CompletionStatus::Recovered);
        assert_eq!(metadata_calls, 0);
    }

    #[tokio::test]
    async fn api_error_after_output_keeps_it() {
        let provider = Arc::new(
            ScriptedProvider::streaming(vec![StreamChunk {
                role: Some(Role::Assistant),
                content: Some("half".into()),
                ..Default::default()
            }])
            .then_error(ProviderError::Network("connection reset".into())),
        );
        let orchestrator = CompletionOrchestrator::new(provider);
        let mut on_token = |_: &str| {};

        let completion = orchestrator
            .complete(
                &history(),
                &chat_profile(),
                CompletionOptions {
                    on_token: Some(&mut on_token),
                    on_metadata: None,
                },
                &mut RunState::new(),
            )
            .await
            .unwrap();
        assert_eq!(completion.reply, "half");
        assert_eq!(completion.status, CompletionStatus::Recovered);
    }

    #[tokio::test]
    async fn non_streaming_without_token_sink() {
        let provider = Arc::new(ScriptedProvider::replying("  Full reply  "));
        let orchestrator = CompletionOrchestrator::new(provider.clone());

        let completion = orchestrator
            .complete(&history(), &chat_profile(), CompletionOptions::default(), &mut RunState::new())
            .await
            .unwrap();

        assert_eq!(completion.reply, "  Full reply  ");
        assert_eq!(completion.finish_reason.as_deref(), Some("stop"));
        let request = provider.last_request();
        assert!(!request.stream);
        assert_eq!(request.messages.len(), 1);
    }

    #[tokio::test]
    async fn streaming_requires_a_base_url() {
        let provider = Arc::new(ScriptedProvider::replying("whole").without_base_url());
        let orchestrator = CompletionOrchestrator::new(provider.clone());
        let mut tokens = 0;
        let mut on_token = |_: &str| tokens += 1;

        let completion = orchestrator
            .complete(
                &history(),
                &chat_profile(),
                CompletionOptions {
                    on_token: Some(&mut on_token),
                    on_metadata: None,
                },
                &mut RunState::new(),
            )
            .await
            .unwrap();

        assert_eq!(completion.reply, "whole");
        assert_eq!(tokens, 0);
        assert!(!provider.last_request().stream);
    }

    #[tokio::test]
    async fn streaming_disabled_in_config_sends_one_request() {
        let provider = Arc::new(ScriptedProvider::replying("in one piece"));
        let orchestrator = CompletionOrchestrator::new(provider.clone());
        let mut profile = chat_profile();
        profile.config.streaming = false;
        let mut tokens = 0;
        let mut on_token = |_: &str| tokens += 1;

        assert!(!orchestrator.streams(&profile, true));
        let completion = orchestrator
            .complete(
                &history(),
                &profile,
                CompletionOptions {
                    on_token: Some(&mut on_token),
                    on_metadata: None,
                },
                &mut RunState::new(),
            )
            .await
            .unwrap();

        assert_eq!(completion.reply, "in one piece");
        assert_eq!(completion.status, CompletionStatus::Completed);
        assert_eq!(tokens, 0);
        assert!(!provider.last_request().stream);
    }

    #[tokio::test]
    async fn legacy_models_get_a_rendered_prompt_and_stripped_end_token() {
        let provider = Arc::new(ScriptedProvider::replying("It works.<|im_end|>\n"));
        let orchestrator = CompletionOrchestrator::new(provider.clone());
        let profile = legacy_profile("text-chat-davinci-002");

        let completion = orchestrator
            .complete(&history(), &profile, CompletionOptions::default(), &mut RunState::new())
            .await
            .unwrap();

        assert_eq!(completion.reply, "It works.");
        let request = provider.last_request();
        assert!(request.messages.is_empty());
        assert_eq!(
            request.prompt.as_deref(),
            Some("<|im_start|>User:\nTell me a story<|im_end|>\n<|im_start|>Assistant:\n")
        );
    }

    #[tokio::test]
    async fn fatal_errors_propagate() {
        let provider = Arc::new(ScriptedProvider::failing(ProviderError::AuthenticationFailed(
            "bad key".into(),
        )));
        let orchestrator = CompletionOrchestrator::new(provider);
        let mut run = RunState::new();

        let err = orchestrator
            .complete(&history(), &chat_profile(), CompletionOptions::default(), &mut run)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::AuthenticationFailed(_)));
        assert_eq!(run.error.as_deref(), Some("Authentication failed: bad key"));
    }

    #[tokio::test]
    async fn cancelled_before_request_resolves_empty() {
        let provider = Arc::new(ScriptedProvider::replying("never"));
        let orchestrator = CompletionOrchestrator::new(provider);
        let run_token = CancellationToken::new();
        run_token.cancel();
        let mut run = RunState::with_cancel(run_token);

        let completion = orchestrator
            .complete(&history(), &chat_profile(), CompletionOptions::default(), &mut run)
            .await
            .unwrap();
        assert_eq!(completion.reply, "");
        assert_eq!(completion.status, CompletionStatus::Aborted);
    }

    #[test]
    fn classification_table() {
        let server = ProviderError::ApiError {
            status_code: 500,
            message: "The server had an error processing your request".into(),
        };
        assert!(matches!(classify(server.clone(), "so far"), Outcome::Recoverable(_)));
        assert!(matches!(classify(server, ""), Outcome::Fatal(_)));

        assert!(matches!(
            classify(ProviderError::Aborted("user".into()), ""),
            Outcome::Success(CompletionStatus::Aborted)
        ));
        assert!(matches!(
            classify(ProviderError::Network("The operation was aborted".into()), ""),
            Outcome::Success(CompletionStatus::Aborted)
        ));

        let limited = ProviderError::RateLimited { retry_after_secs: 3 };
        assert!(matches!(classify(limited.clone(), "x"), Outcome::Recoverable(_)));
        assert!(matches!(classify(limited, ""), Outcome::Fatal(_)));

        let local = ProviderError::NotConfigured("no key".into());
        assert!(matches!(classify(local, "x"), Outcome::Fatal(_)));
    }

    #[test]
    fn vision_models_get_a_response_ceiling() {
        let mut profile = chat_profile();
        profile.config.model = "gpt-4-vision-preview".into();
        let request = build_request(&history(), &profile, false);
        assert_eq!(request.max_tokens, Some(VISION_MAX_TOKENS));
    }
}
