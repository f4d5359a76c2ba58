//! OpenAI-style chat-completions back-end with SSE streaming.
//!
//! Streams `data:` lines terminated by a literal `data: [DONE]`. Unlike the
//! Anthropic adapter, `seed` is forwarded natively since the API accepts it.

use crate::backend::{ChunkStream, ModelBackend, StreamChunk};
use crate::config::HostedConfig;
use crate::error::{BackendError, Result};
use crate::http::{classify_status, LineBuffer};
use crate::message::{ChatMessage, MessageRole};
use crate::params::GenerationParams;
use crate::retry::RetryPolicy;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use super::anthropic::DEFAULT_REMOTE_PERMITS;

/// OpenAI chat-completions API client.
#[derive(Clone)]
pub struct OpenAiBackend {
    config: HostedConfig,
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
}

impl OpenAiBackend {
    /// Create a backend with its own request semaphore (20 permits).
    pub fn new(config: HostedConfig) -> Self {
        Self::with_semaphore(config, Arc::new(Semaphore::new(DEFAULT_REMOTE_PERMITS)))
    }

    /// Create a backend sharing `semaphore` with other adapters.
    pub fn with_semaphore(config: HostedConfig, semaphore: Arc<Semaphore>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            config,
            client,
            semaphore,
        }
    }

    fn convert_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|msg| WireMessage {
                role: match msg.role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                },
                content: msg.content.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    async fn stream(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<ChunkStream> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BackendError::Fatal("request semaphore closed".into()))?;

        let body = CompletionsRequest {
            model: params
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            messages: Self::convert_messages(messages),
            max_tokens: params.max_tokens_or_default(),
            temperature: params.temperature,
            seed: params.seed,
            stream: true,
        };

        let url = format!("{}/chat/completions", self.config.base_url);
        let policy = RetryPolicy::new(self.config.max_retries);
        let response = policy
            .run(|| {
                let request = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.config.api_key)
                    .json(&body);
                async move { classify_status(request.send().await?).await }
            })
            .await?;

        debug!(model = %body.model, "openai stream started");

        let mut bytes = response.bytes_stream();
        let stream = try_stream! {
            let _permit = permit;
            let mut lines = LineBuffer::new();
            'body: while let Some(part) = bytes.next().await {
                let part = part.map_err(|e| BackendError::Transport(e.to_string()))?;
                lines.push(&part);
                while let Some(line) = lines.next_line()? {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data.trim() == "[DONE]" {
                        break 'body;
                    }
                    let event: StreamEvent = serde_json::from_str(data).map_err(|e| {
                        BackendError::Fatal(format!("malformed stream event: {}", e))
                    })?;
                    if let Some(choice) = event.choices.into_iter().next() {
                        if let Some(text) = choice.delta.content {
                            if !text.is_empty() {
                                yield StreamChunk::new(text);
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

// Wire types for the chat-completions API.
#[derive(Debug, Serialize)]
struct CompletionsRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    delta: ChoiceDelta,
}

#[derive(Debug, Deserialize)]
struct ChoiceDelta {
    #[serde(default)]
    content: Option<String>,
}
