//! Engine error taxonomy.

use cot_trie::TrieError;
use llm::BackendError;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the exploration and evaluation engine.
///
/// Propagation priority: configuration problems surface immediately with no
/// retries; rate limiting and transport failures are retried inside the
/// back-end adapters; a judge output that violates the equivalence schema
/// aborts the tree build; anything else unexpected is fatal for the current
/// tree only — an orchestrator processing many problems records the failure
/// and moves on.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid engine configuration (bad branching factor, unknown model).
    #[error("configuration error: {0}")]
    Config(String),

    /// A back-end adapter failed after its own retries.
    #[error(transparent)]
    Backend(BackendError),

    /// Judge output did not match the expected tag schema.
    #[error("judge parse error: {0}")]
    Parse(String),

    /// Unexpected failure; the tree build is abandoned.
    #[error("engine failure: {0}")]
    Fatal(String),
}

impl EngineError {
    /// Whether this failure is tied to one problem's tree rather than the
    /// engine configuration.
    pub fn is_per_problem(&self) -> bool {
        !matches!(self, EngineError::Config(_))
    }
}

/// Back-end configuration problems keep their category; everything else
/// wraps as a back-end failure.
impl From<BackendError> for EngineError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Config(msg) => EngineError::Config(msg),
            other => EngineError::Backend(other),
        }
    }
}

/// Trie manipulation failures during audit/evidence attachment are fatal for
/// the current tree build.
impl From<TrieError> for EngineError {
    fn from(err: TrieError) -> Self {
        EngineError::Fatal(err.to_string())
    }
}
