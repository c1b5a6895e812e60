//! Conversation titles.
//!
//! Two strategies share the [`StrategyChain`] contract: a structured request
//! that asks for `{"title": "..."}`, then a plain completion. Cancellation is
//! fatal and yields no title; exhausting the chain yields [`DEFAULT_TITLE`].

use async_trait::async_trait;
use parley_config::TitleMethod;
use parley_context::prompts::{render_structured_title_prompt, render_title_prompt, title_convo};
use parley_core::{
    Message, ModelConfig, ModelProfile, ProfileOptions, ProviderError, RunState,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{Outcome, Strategy, StrategyChain};
use crate::error::ClientError;
use crate::orchestrator::{CompletionOptions, CompletionOrchestrator, CompletionStatus};

pub const DEFAULT_TITLE: &str = "New Chat";

const TITLE_TEMPERATURE: f32 = 0.2;
const TITLE_MAX_TOKENS: usize = 16;

/// Input shared by the title strategies.
pub struct TitleRequest {
    pub convo: String,
    pub cancel: CancellationToken,
}

/// Generates short conversation titles with an auxiliary model.
pub struct TitleGenerator {
    chain: StrategyChain<TitleRequest, String>,
    model: String,
}

impl TitleGenerator {
    pub fn new(
        orchestrator: CompletionOrchestrator,
        model: &str,
        method: TitleMethod,
    ) -> Result<Self, ClientError> {
        let profile = title_profile(model)?;
        let mut chain = StrategyChain::new("title");
        if method == TitleMethod::Structured {
            chain = chain.with(StructuredTitle {
                orchestrator: orchestrator.clone(),
                profile: profile.clone(),
            });
        }
        chain = chain.with(CompletionTitle {
            orchestrator,
            profile,
        });

        Ok(Self {
            chain,
            model: model.to_string(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Title for the exchange `text` → `response`.
    ///
    /// `None` when the request was cancelled.
    pub async fn generate(
        &self,
        text: &str,
        response: &str,
        cancel: CancellationToken,
    ) -> Option<String> {
        let request = TitleRequest {
            convo: title_convo(text, response),
            cancel,
        };

        match self.chain.run(&request).await {
            Outcome::Success(title) => {
                info!(model = %self.model, title = %title, "Generated title");
                Some(title)
            }
            Outcome::Recoverable(e) => {
                warn!(error = %e, "Title generation failed, using default");
                Some(DEFAULT_TITLE.to_string())
            }
            Outcome::Fatal(e) => {
                debug!(error = %e, "Title generation stopped");
                None
            }
        }
    }
}

fn title_profile(model: &str) -> Result<ModelProfile, ClientError> {
    let config = ModelConfig {
        temperature: TITLE_TEMPERATURE,
        presence_penalty: 0.0,
        top_p: 1.0,
        max_tokens: Some(TITLE_MAX_TOKENS),
        streaming: false,
        ..ModelConfig::for_model(model)
    };
    Ok(ModelProfile::derive(config, &ProfileOptions::default())?)
}

/// Run one title prompt, mapping cancellation and failures onto the chain contract.
async fn ask(
    orchestrator: &CompletionOrchestrator,
    profile: &ModelProfile,
    prompt: String,
    cancel: &CancellationToken,
) -> Outcome<String, ClientError> {
    let mut run = RunState::with_cancel(cancel.clone());
    let messages = [Message::user(prompt)];

    match orchestrator
        .complete(&messages, profile, CompletionOptions::default(), &mut run)
        .await
    {
        Ok(completion) if completion.status == CompletionStatus::Aborted => Outcome::Fatal(
            ClientError::Provider(ProviderError::Aborted("title request cancelled".into())),
        ),
        Ok(completion) => Outcome::Success(completion.reply),
        Err(e) if e.mentions_abort() => Outcome::Fatal(e.into()),
        Err(e) => Outcome::Recoverable(e.into()),
    }
}

struct StructuredTitle {
    orchestrator: CompletionOrchestrator,
    profile: ModelProfile,
}

#[async_trait]
impl Strategy<TitleRequest, String> for StructuredTitle {
    fn name(&self) -> &str {
        "structured"
    }

    async fn attempt(&self, input: &TitleRequest) -> Outcome<String, ClientError> {
        let prompt = render_structured_title_prompt(&input.convo);
        match ask(&self.orchestrator, &self.profile, prompt, &input.cancel).await {
            Outcome::Success(reply) => match parse_structured_title(&reply) {
                Some(title) => Outcome::Success(title),
                None => Outcome::Recoverable(ClientError::Title(format!(
                    "no title in structured reply: {reply}"
                ))),
            },
            other => other,
        }
    }
}

struct CompletionTitle {
    orchestrator: CompletionOrchestrator,
    profile: ModelProfile,
}

#[async_trait]
impl Strategy<TitleRequest, String> for CompletionTitle {
    fn name(&self) -> &str {
        "completion"
    }

    async fn attempt(&self, input: &TitleRequest) -> Outcome<String, ClientError> {
        let prompt = render_title_prompt(&input.convo);
        match ask(&self.orchestrator, &self.profile, prompt, &input.cancel).await {
            Outcome::Success(reply) => {
                let title = reply.replace('"', "").trim().to_string();
                if title.is_empty() {
                    Outcome::Recoverable(ClientError::Title("empty title".into()))
                } else {
                    Outcome::Success(title)
                }
            }
            other => other,
        }
    }
}

/// Pull `title` out of the first JSON object in `reply`.
fn parse_structured_title(reply: &str) -> Option<String> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(&reply[start..=end]).ok()?;
    let title = value.get("title")?.as_str()?.trim();
    (!title.is_empty()).then(|| title.to_string())
}
