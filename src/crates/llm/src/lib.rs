//! Streaming model back-end adapters for cot-faithfulness.
//!
//! This crate provides a uniform streaming interface over heterogeneous chat
//! completion services. Everything upstream (the step stream, the tree
//! builder, the judges) talks to a [`ModelBackend`] trait object and relies
//! only on two guarantees:
//!
//! - chunks are concatenation-preserving: joining every chunk of a stream
//!   yields the full assistant response, and
//! - a backend can construct an assistant-authored message for follow-up
//!   calls via [`ModelBackend::format_assistant_message`].
//!
//! # Adapters
//!
//! - [`remote::AnthropicBackend`] — hosted messages API (SSE streaming)
//! - [`remote::OpenAiBackend`] — hosted chat-completions API (SSE streaming)
//! - [`local::HttpRunnerBackend`] — self-hosted HTTP model runner (NDJSON)
//! - [`local::InProcessBackend`] — in-process generation behind a
//!   [`local::TextGenerator`], with seeded prompt variation for back-ends
//!   that cannot honor seeds at nonzero temperature
//! - [`replay::ReplayBackend`] — serves pre-recorded chunk scripts, for
//!   offline replay and deterministic tests
//!
//! # Example
//!
//! ```rust,ignore
//! use llm::{ChatMessage, GenerationParams};
//! use llm::remote::{AnthropicBackend, HostedConfig};
//! use futures::StreamExt;
//!
//! let config = HostedConfig::from_env(
//!     "ANTHROPIC_API_KEY",
//!     "https://api.anthropic.com",
//!     "claude-3-5-sonnet-20241022",
//! )?;
//! let backend = AnthropicBackend::new(config);
//!
//! let params = GenerationParams::new().with_max_tokens(1000);
//! let mut stream = backend
//!     .stream(&[ChatMessage::user("What is 1 + 1?")], &params)
//!     .await?;
//! while let Some(chunk) = stream.next().await {
//!     print!("{}", chunk?.text);
//! }
//! ```
//!
//! # Back-pressure and retries
//!
//! Every adapter holds a shared [`tokio::sync::Semaphore`] capping in-flight
//! requests (hosted default 20 permits; local back-ends 1, because their
//! memory pressure is unknown). The permit is held for the lifetime of one
//! streamed response. Request initiation is retried on [`BackendError`]s that
//! report [`BackendError::is_retryable`], with exponential backoff plus
//! jitter.

pub mod backend;
pub mod config;
pub mod error;
mod http;
pub mod local;
pub mod message;
pub mod params;
pub mod registry;
pub mod remote;
pub mod replay;
pub mod retry;

pub use backend::{ChunkStream, ModelBackend, StreamChunk};
pub use error::{BackendError, Result};
pub use message::{ChatMessage, MessageRole};
pub use params::GenerationParams;
pub use registry::BackendRegistry;
pub use retry::RetryPolicy;
