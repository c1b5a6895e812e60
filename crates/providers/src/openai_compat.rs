//! OpenAI-compatible provider implementation.
//!
//! Works with: OpenAI, OpenRouter, Mistral, reverse proxies, and any
//! OpenAI-compatible endpoint.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Legacy text completions (`prompt` requests)
//! - Image parts, sender names, extra headers, HTTP proxies

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use parley_core::error::ProviderError;
use parley_core::message::{Message, Role};
use parley_core::provider::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::endpoint::{Endpoint, MISTRAL_BASE_URL};
use crate::sse::SseBuffer;

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    completions_url: String,
    base_url: Option<String>,
    api_key: String,
    headers: BTreeMap<String, String>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a provider for a resolved endpoint.
    pub fn new(endpoint: Endpoint, api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let mut builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(120));

        if let Some(proxy) = &endpoint.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| ProviderError::NotConfigured(format!("invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: endpoint.name,
            completions_url: endpoint.completions_url,
            base_url: endpoint
                .base_url
                .map(|url| url.trim_end_matches('/').to_string()),
            api_key: api_key.into(),
            headers: endpoint.headers,
            client,
        })
    }

    /// A provider for any base URL ending at its version segment.
    pub fn with_base_url(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self::new(
            Endpoint {
                name: name.into(),
                completions_url: format!("{base_url}/chat/completions"),
                base_url: Some(base_url),
                headers: BTreeMap::new(),
                proxy: None,
            },
            api_key,
        )
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_base_url("openai", "https://api.openai.com/v1", api_key)
    }

    fn chat_url(&self) -> Option<String> {
        self.base_url.as_ref().map(|base| format!("{base}/chat/completions"))
    }

    fn is_mistral(&self) -> bool {
        self.base_url
            .as_deref()
            .is_some_and(|base| base.contains(MISTRAL_BASE_URL))
    }

    /// Convert our Message types to OpenAI API format.
    ///
    /// Mistral rejects a payload made of a single system message, so that
    /// message is sent as a user message instead.
    fn to_api_messages(messages: &[Message], mistral: bool) -> Vec<ApiMessage> {
        let lone_system = mistral && messages.len() == 1 && messages[0].role == Role::System;

        messages
            .iter()
            .map(|m| {
                let role = if lone_system { Role::User } else { m.role };
                let content = if m.image_refs.is_empty() {
                    ApiContent::Text(m.content.clone())
                } else {
                    let mut parts = vec![ContentPart::Text {
                        text: m.content.clone(),
                    }];
                    parts.extend(m.image_refs.iter().map(|url| ContentPart::ImageUrl {
                        image_url: ImageUrl { url: url.clone() },
                    }));
                    ApiContent::Parts(parts)
                };
                ApiMessage {
                    role: role.as_str().to_string(),
                    name: m.name.clone(),
                    content,
                }
            })
            .collect()
    }

    fn build_body(&self, request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "stream": stream,
        });

        match &request.prompt {
            Some(prompt) => body["prompt"] = serde_json::json!(prompt),
            None => {
                body["messages"] =
                    serde_json::json!(Self::to_api_messages(&request.messages, self.is_mistral()))
            }
        }

        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        if let Some(presence_penalty) = request.presence_penalty {
            body["presence_penalty"] = serde_json::json!(presence_penalty);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !request.stop.is_empty() {
            body["stop"] = serde_json::json!(request.stop);
        }
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }

        body
    }

    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut builder = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");
        if stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        for (key, value) in &self.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder.json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();

        if status == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status == 404 {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ModelNotFound(error_body));
        }

        if !(200..300).contains(&status) {
            let error_body = response.text().await.unwrap_or_default();
            warn!(provider = %self.name, status, body = %error_body, "Provider returned error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        Ok(response)
    }
}

fn parse_role(role: Option<&str>) -> Option<Role> {
    match role? {
        "assistant" => Some(Role::Assistant),
        "user" => Some(Role::User),
        "system" => Some(Role::System),
        other => {
            trace!(role = other, "Unrecognised role in provider response");
            None
        }
    }
}

#[async_trait]
impl parley_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> Option<String> {
        self.base_url.clone()
    }

    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let body = self.build_body(&request, false);

        debug!(
            provider = %self.name,
            model = %request.model,
            legacy = request.prompt.is_some(),
            "Sending completion request"
        );

        let response = self.post(&self.completions_url, &body, false).await?;

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        let choice =
            api_response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::ApiError {
                    status_code: 200,
                    message: "No choices in response".into(),
                })?;

        let (role, content) = match (choice.message, choice.text) {
            (Some(message), _) => (
                parse_role(message.role.as_deref()),
                message.content.unwrap_or_default(),
            ),
            (None, Some(text)) => (Some(Role::Assistant), text),
            (None, None) => (None, String::new()),
        };
        let role = role.ok_or_else(|| {
            ProviderError::Protocol("missing role in completion response".into())
        })?;

        let usage = api_response.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(ProviderResponse {
            message: Message::new(role, content),
            finish_reason: choice.finish_reason,
            usage,
            model: api_response.model.unwrap_or(request.model),
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ChunkReceiver, ProviderError> {
        let url = self.chat_url().ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "provider '{}' has no base URL to stream from",
                self.name
            ))
        })?;
        let body = self.build_body(&request, true);

        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self.post(&url, &body, true).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();

        // Spawn task to read the SSE byte stream and parse chunks.
        // Dropping the receiver drops the response, which aborts the transport.
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut sse = SseBuffer::new();

            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        debug!(provider = %provider_name, "Stream receiver dropped, aborting transport");
                        return;
                    }
                    next = byte_stream.next() => next,
                };

                let ended = next.is_none();
                let payloads = match next {
                    Some(Ok(bytes)) => sse.push(&bytes),
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                    None => sse.finish().into_iter().collect(),
                };

                for data in payloads {
                    match parse_stream_payload(&data) {
                        StreamEvent::Done => {
                            let _ = tx.send(Ok(StreamChunk { done: true, ..Default::default() })).await;
                            return;
                        }
                        StreamEvent::Chunk(chunk) => {
                            if tx.send(Ok(chunk)).await.is_err() {
                                return; // receiver dropped
                            }
                        }
                        StreamEvent::Error(message) => {
                            let _ = tx.send(Err(ProviderError::StreamInterrupted(message))).await;
                            return;
                        }
                        StreamEvent::Skip => {
                            trace!(provider = %provider_name, data = %data, "Ignoring SSE chunk");
                        }
                    }
                }

                if ended {
                    // Stream ended without [DONE]
                    let _ = tx.send(Ok(StreamChunk { done: true, ..Default::default() })).await;
                    return;
                }
            }
        });

        Ok(rx)
    }
}

enum StreamEvent {
    Chunk(StreamChunk),
    Done,
    Error(String),
    Skip,
}

fn parse_stream_payload(data: &str) -> StreamEvent {
    if data == "[DONE]" {
        return StreamEvent::Done;
    }

    let stream_resp = match serde_json::from_str::<StreamResponse>(data) {
        Ok(resp) => resp,
        Err(_) => return StreamEvent::Skip,
    };

    if let Some(error) = stream_resp.error {
        return StreamEvent::Error(error.message);
    }

    let usage = stream_resp.usage.map(|u| Usage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
    });

    let Some(choice) = stream_resp.choices.into_iter().next() else {
        return match usage {
            Some(usage) => StreamEvent::Chunk(StreamChunk {
                usage: Some(usage),
                ..Default::default()
            }),
            None => StreamEvent::Skip,
        };
    };

    // OpenRouter sometimes sends the whole message instead of a delta.
    let (role, content) = match (choice.delta, choice.message) {
        (Some(delta), _) => (delta.role, delta.content),
        (None, Some(message)) => (message.role, message.content),
        (None, None) => (None, choice.text),
    };

    StreamEvent::Chunk(StreamChunk {
        content,
        role: parse_role(role.as_deref()),
        finish_reason: choice.finish_reason,
        done: false,
        usage,
    })
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    content: ApiContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ApiContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    #[serde(default)]
    message: Option<ApiResponseMessage>,
    /// Legacy completions put the reply here
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    total_tokens: u32,
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    message: Option<StreamDelta>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}
