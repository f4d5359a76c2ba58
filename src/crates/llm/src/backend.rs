//! The `ModelBackend` trait: the single seam between the engine and any
//! chat completion service.

use crate::error::Result;
use crate::message::ChatMessage;
use crate::params::GenerationParams;
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;

/// One chunk of a streamed assistant response.
///
/// `input` is populated only when the caller requested input recording and
/// the adapter tracks the exact rendered prompt (the in-process and replay
/// back-ends do; hosted APIs do not expose it).
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub text: String,
    pub input: Option<String>,
}

impl StreamChunk {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            input: None,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }
}

/// A lazily produced sequence of response chunks.
///
/// Joining the `text` of every chunk yields the full assistant response;
/// adapters may coalesce or split chunks arbitrarily and callers must rely
/// only on concatenation.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// A streaming chat completion back-end.
///
/// Back-ends form a closed variant set (hosted APIs, a self-hosted HTTP
/// runner, an in-process generator, a replay source) behind this one trait.
/// Implementations must be `Send + Sync`; share them as
/// `Arc<dyn ModelBackend>`.
///
/// Implementations hold a shared semaphore capping concurrent in-flight
/// requests and keep the permit for the lifetime of the returned stream.
/// Dropping the stream releases the permit and cancels the underlying
/// request, which is what unblocks a waiting reader on cancellation.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Start streaming a response to `messages`.
    ///
    /// # Errors
    ///
    /// `Config` for bad model names or credentials, `RateLimited` /
    /// `Transport` for retryable request failures (already retried with
    /// backoff internally), `Fatal` otherwise. Mid-stream failures surface
    /// as `Err` items on the stream.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<ChunkStream>;

    /// Construct a message tagged as assistant-authored, for use as a
    /// pre-filled prefix in follow-up calls.
    fn format_assistant_message(&self, text: &str) -> ChatMessage {
        ChatMessage::assistant(text)
    }
}
