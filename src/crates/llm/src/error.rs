//! Error types for model back-ends.

use thiserror::Error;

/// Result type for back-end operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors surfaced by model back-end adapters.
///
/// The taxonomy mirrors what callers can act on: `Config` is surfaced
/// immediately with no retries, `RateLimited` and `Transport` are retryable,
/// and `Fatal` aborts the operation that issued the request.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Unknown model name, missing credential, bad parameter.
    #[error("configuration error: {0}")]
    Config(String),

    /// The back-end signalled throttling (e.g. HTTP 429).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Network failure or 5xx from the back-end.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-retryable failure; surfaced to the caller.
    #[error("backend failure: {0}")]
    Fatal(String),
}

impl BackendError {
    /// Whether the operation that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::RateLimited(_) | BackendError::Transport(_)
        )
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Fatal(format!("serialization error: {}", err))
    }
}
