//! Anthropic-style messages API back-end with SSE streaming.
//!
//! The messages API streams `content_block_delta` events carrying text
//! deltas. A trailing assistant message in the input acts as a response
//! prefill, which is how the step stream warps to an interior tree node.
//!
//! `seed` is advisory and ignored here: the API has no seed parameter, so
//! determinism at nonzero temperature cannot be promised. Callers that need
//! seeded variation use the in-process back-end's prompt variation instead.

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

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default concurrent in-flight request cap for hosted APIs.
pub(crate) const DEFAULT_REMOTE_PERMITS: usize = 20;

/// Anthropic messages API client.
#[derive(Clone)]
pub struct AnthropicBackend {
    config: HostedConfig,
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
}

impl AnthropicBackend {
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

    /// Split system messages out of the conversation, per API requirements.
    fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<WireMessage>) {
        let mut system: Option<String> = None;
        let mut wire = Vec::new();

        for msg in messages {
            match msg.role {
                MessageRole::System => {
                    system = Some(match system {
                        Some(existing) => format!("{}\n\n{}", existing, msg.content),
                        None => msg.content.clone(),
                    });
                }
                MessageRole::User => wire.push(WireMessage {
                    role: "user",
                    content: msg.content.clone(),
                }),
                MessageRole::Assistant => wire.push(WireMessage {
                    role: "assistant",
                    content: msg.content.clone(),
                }),
            }
        }

        (system, wire)
    }
}

#[async_trait]
impl ModelBackend for AnthropicBackend {
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

        let (system, wire_messages) = Self::convert_messages(messages);
        let body = MessagesRequest {
            model: params
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            max_tokens: params.max_tokens_or_default(),
            messages: wire_messages,
            system,
            temperature: params.temperature,
            stream: true,
        };

        let url = format!("{}/v1/messages", self.config.base_url);
        let policy = RetryPolicy::new(self.config.max_retries);
        let response = policy
            .run(|| {
                let request = self
                    .client
                    .post(&url)
                    .header("x-api-key", &self.config.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .header("content-type", "application/json")
                    .json(&body);
                async move { classify_status(request.send().await?).await }
            })
            .await?;

        debug!(model = %body.model, "anthropic stream started");

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
                    let event: SseEvent = serde_json::from_str(data).map_err(|e| {
                        BackendError::Fatal(format!("malformed stream event: {}", e))
                    })?;
                    match event {
                        SseEvent::ContentBlockDelta { delta } => {
                            if let Some(text) = delta.text {
                                yield StreamChunk::new(text);
                            }
                        }
                        SseEvent::MessageStop => break 'body,
                        SseEvent::Error { error } => {
                            let failure: Result<()> = Err(BackendError::Transport(format!(
                                "stream error from API: {}",
                                error.message
                            )));
                            failure?;
                        }
                        SseEvent::Other => {}
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

// Wire types for the messages API.
#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SseEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: Delta },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "error")]
    Error { error: SseError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseError {
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_messages_are_separated() {
        let (system, wire) = AnthropicBackend::convert_messages(&[
            ChatMessage::system("You are helpful"),
            ChatMessage::user("Hello"),
            ChatMessage::assistant("Hi, "),
        ]);

        assert_eq!(system.as_deref(), Some("You are helpful"));
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].role, "user");
        assert_eq!(wire[1].role, "assistant");
        assert_eq!(wire[1].content, "Hi, ");
    }

    #[test]
    fn delta_events_parse() {
        let event: SseEvent = serde_json::from_str(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"1. "}}"#,
        )
        .unwrap();
        match event {
            SseEvent::ContentBlockDelta { delta } => assert_eq!(delta.text.as_deref(), Some("1. ")),
            _ => panic!("expected delta event"),
        }
    }

    #[test]
    fn unknown_events_are_ignored() {
        let event: SseEvent = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(event, SseEvent::Other));
    }
}
