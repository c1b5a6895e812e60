//! Scripted providers and fixtures shared by client tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use parley_core::{
    ChunkReceiver, Message, ModelConfig, ModelProfile, ProfileOptions, Provider, ProviderError,
    ProviderRequest, ProviderResponse, Role, StreamChunk, Usage,
};

/// A provider that replays scripted replies and stream chunks.
///
/// `complete` pops the next queued reply; `stream` sends the chunks, then the
/// terminal error if one is set, then closes (or hangs until the receiver is
/// dropped).
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ProviderResponse>>,
    chunks: Vec<StreamChunk>,
    terminal_error: Option<ProviderError>,
    failure: Option<ProviderError>,
    hang: bool,
    base_url: Option<String>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    fn empty() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            chunks: Vec::new(),
            terminal_error: None,
            failure: None,
            hang: false,
            base_url: Some("https://api.test/v1".into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn streaming(chunks: Vec<StreamChunk>) -> Self {
        Self {
            chunks,
            ..Self::empty()
        }
    }

    /// Streams `chunks`, then keeps the stream open.
    pub fn hanging_after(chunks: Vec<StreamChunk>) -> Self {
        Self {
            chunks,
            hang: true,
            ..Self::empty()
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::replies(&[text])
    }

    /// Replies in order, one per `complete` call.
    pub fn replies(texts: &[&str]) -> Self {
        let provider = Self::empty();
        {
            let mut queue = provider.replies.lock().unwrap();
            queue.extend(texts.iter().map(|t| text_response(t)));
        }
        provider
    }

    pub fn failing(error: ProviderError) -> Self {
        Self {
            failure: Some(error),
            ..Self::empty()
        }
    }

    pub fn then_error(mut self, error: ProviderError) -> Self {
        self.terminal_error = Some(error);
        self
    }

    pub fn without_base_url(mut self) -> Self {
        self.base_url = None;
        self
    }

    pub fn last_request(&self) -> ProviderRequest {
        self.requests
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no request was sent")
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn base_url(&self) -> Option<String> {
        self.base_url.clone()
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: 500,
                message: "no scripted reply left".into(),
            })
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        self.requests.lock().unwrap().push(request);
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let chunks = self.chunks.clone();
        let terminal_error = self.terminal_error.clone();
        let hang = self.hang;
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            if let Some(error) = terminal_error {
                let _ = tx.send(Err(error)).await;
            }
            if hang {
                tx.closed().await;
            }
        });
        Ok(rx)
    }
}

pub fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        finish_reason: Some("stop".into()),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

/// Content chunks with the assistant role on the first one and no terminal chunk.
pub fn partial_chunks(parts: &[&str]) -> Vec<StreamChunk> {
    parts
        .iter()
        .enumerate()
        .map(|(i, part)| StreamChunk {
            content: Some((*part).to_string()),
            role: (i == 0).then_some(Role::Assistant),
            ..Default::default()
        })
        .collect()
}

/// A well-formed stream: the content chunks plus a terminal `stop` chunk.
pub fn text_chunks(parts: &[&str]) -> Vec<StreamChunk> {
    let mut chunks = partial_chunks(parts);
    chunks.push(StreamChunk {
        finish_reason: Some("stop".into()),
        done: true,
        ..Default::default()
    });
    chunks
}

pub fn chat_profile() -> ModelProfile {
    ModelProfile::derive(ModelConfig::for_model("gpt-3.5-turbo"), &ProfileOptions::default())
        .unwrap()
}

pub fn legacy_profile(model: &str) -> ModelProfile {
    ModelProfile::derive(ModelConfig::for_model(model), &ProfileOptions::default()).unwrap()
}
