//! Model-name based back-end factory.
//!
//! The engine configuration refers to solver and judge models by name; the
//! registry turns those names into adapters sharing two semaphores — one for
//! hosted APIs, one for local back-ends. Unknown names are configuration
//! errors surfaced before any request is issued.

use crate::backend::ModelBackend;
use crate::config::{HostedConfig, RunnerConfig};
use crate::error::{BackendError, Result};
use crate::local::HttpRunnerBackend;
use crate::remote::{AnthropicBackend, OpenAiBackend};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Prefix selecting the configured self-hosted runner, as in
/// `runner:llama3.1`.
const RUNNER_PREFIX: &str = "runner:";

/// Creates back-ends by model name with shared request semaphores.
pub struct BackendRegistry {
    remote_semaphore: Arc<Semaphore>,
    local_semaphore: Arc<Semaphore>,
    max_retries: u32,
    runner: Option<RunnerConfig>,
    custom: HashMap<String, Arc<dyn ModelBackend>>,
}

impl BackendRegistry {
    /// Create a registry with the given semaphore capacities.
    pub fn new(remote_limit: usize, local_limit: usize, max_retries: u32) -> Self {
        Self {
            remote_semaphore: Arc::new(Semaphore::new(remote_limit)),
            local_semaphore: Arc::new(Semaphore::new(local_limit)),
            max_retries,
            runner: None,
            custom: HashMap::new(),
        }
    }

    /// Configure the self-hosted runner reachable under `runner:<model>`.
    pub fn with_runner(mut self, config: RunnerConfig) -> Self {
        self.runner = Some(config);
        self
    }

    /// Register a back-end under an explicit name (in-process generators,
    /// replay scripts). Registered names take precedence.
    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn ModelBackend>) {
        self.custom.insert(name.into(), backend);
    }

    /// Resolve a model name to a back-end.
    ///
    /// # Errors
    ///
    /// `Config` when the name matches no adapter family or the required
    /// credential is absent.
    pub fn backend_for(&self, model: &str) -> Result<Arc<dyn ModelBackend>> {
        if let Some(backend) = self.custom.get(model) {
            return Ok(Arc::clone(backend));
        }

        if let Some(runner_model) = model.strip_prefix(RUNNER_PREFIX) {
            let base = self.runner.as_ref().ok_or_else(|| {
                BackendError::Config(format!(
                    "model {} requires a runner, but none is configured",
                    model
                ))
            })?;
            let mut config = base.clone();
            config.model = runner_model.to_string();
            config.max_retries = self.max_retries;
            return Ok(Arc::new(HttpRunnerBackend::with_semaphore(
                config,
                Arc::clone(&self.local_semaphore),
            )));
        }

        if model.starts_with("claude") {
            let config = HostedConfig::from_env("ANTHROPIC_API_KEY", ANTHROPIC_BASE_URL, model)?
                .with_max_retries(self.max_retries);
            return Ok(Arc::new(AnthropicBackend::with_semaphore(
                config,
                Arc::clone(&self.remote_semaphore),
            )));
        }

        if model.starts_with("gpt") || model.starts_with("o1") {
            let config = HostedConfig::from_env("OPENAI_API_KEY", OPENAI_BASE_URL, model)?
                .with_max_retries(self.max_retries);
            return Ok(Arc::new(OpenAiBackend::with_semaphore(
                config,
                Arc::clone(&self.remote_semaphore),
            )));
        }

        Err(BackendError::Config(format!("unknown model name: {}", model)))
    }
}
