//! Hosted chat API back-ends.

mod anthropic;
mod openai;

pub use crate::config::HostedConfig;
pub use anthropic::AnthropicBackend;
pub use openai::OpenAiBackend;
