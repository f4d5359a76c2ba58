//! Self-hosted HTTP model runner back-end.
//!
//! Speaks the NDJSON chat protocol used by common local runners: POST
//! `/api/chat` with `stream: true`, one JSON object per line, each carrying
//! a message fragment and a `done` flag. `seed` and `temperature` are
//! forwarded through the runner's `options` object.

use crate::backend::{ChunkStream, ModelBackend, StreamChunk};
use crate::config::RunnerConfig;
use crate::error::{BackendError, Result};
use crate::http::{classify_status, LineBuffer};
use crate::message::{ChatMessage, MessageRole};
use crate::params::GenerationParams;
use crate::retry::RetryPolicy;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use super::DEFAULT_LOCAL_PERMITS;

/// Client for a self-hosted HTTP model runner.
#[derive(Clone)]
pub struct HttpRunnerBackend {
    config: RunnerConfig,
    client: reqwest::Client,
    semaphore: Arc<Semaphore>,
}

impl HttpRunnerBackend {
    /// Create a backend with a single-permit request semaphore.
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_semaphore(config, Arc::new(Semaphore::new(DEFAULT_LOCAL_PERMITS)))
    }

    /// Create a backend sharing `semaphore` with other local adapters.
    pub fn with_semaphore(config: RunnerConfig, semaphore: Arc<Semaphore>) -> Self {
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

    /// Whether the runner is up.
    pub async fn check_health(&self) -> bool {
        let url = format!("{}/api/tags", self.config.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
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
impl ModelBackend for HttpRunnerBackend {
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

        let mut options: HashMap<&'static str, Value> = HashMap::new();
        if let Some(temp) = params.temperature {
            options.insert("temperature", Value::from(temp));
        }
        if let Some(seed) = params.seed {
            options.insert("seed", Value::from(seed));
        }
        options.insert("num_predict", Value::from(params.max_tokens_or_default()));

        let body = RunnerRequest {
            model: params
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            messages: Self::convert_messages(messages),
            stream: true,
            options,
        };

        let url = format!("{}/api/chat", self.config.base_url);
        let policy = RetryPolicy::new(self.config.max_retries);
        let response = policy
            .run(|| {
                let request = self.client.post(&url).json(&body);
                async move { classify_status(request.send().await?).await }
            })
            .await?;

        debug!(model = %body.model, "runner stream started");

        let mut bytes = response.bytes_stream();
        let stream = try_stream! {
            let _permit = permit;
            let mut lines = LineBuffer::new();
            'body: while let Some(part) = bytes.next().await {
                let part = part.map_err(|e| BackendError::Transport(e.to_string()))?;
                lines.push(&part);
                while let Some(line) = lines.next_line()? {
                    if line.is_empty() {
                        continue;
                    }
                    let fragment: RunnerFragment = serde_json::from_str(&line).map_err(|e| {
                        BackendError::Fatal(format!("malformed runner fragment: {}", e))
                    })?;
                    if let Some(message) = fragment.message {
                        if !message.content.is_empty() {
                            yield StreamChunk::new(message.content);
                        }
                    }
                    if fragment.done {
                        break 'body;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

// Runner wire types.
#[derive(Debug, Serialize)]
struct RunnerRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    options: HashMap<&'static str, Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct RunnerFragment {
    #[serde(default)]
    message: Option<FragmentMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct FragmentMessage {
    #[serde(default)]
    content: String,
}
