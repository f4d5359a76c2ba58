//! Configuration for HTTP back-ends.

use crate::error::{BackendError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for hosted chat APIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedConfig {
    /// API key for authentication.
    pub api_key: String,

    /// Base URL for the API.
    ///
    /// Examples:
    /// - Anthropic: "https://api.anthropic.com"
    /// - OpenAI: "https://api.openai.com/v1"
    pub base_url: String,

    /// Default model name for requests without an override.
    pub model: String,

    /// Request timeout duration.
    #[serde(default = "default_timeout")]
    pub timeout: Duration,

    /// Maximum attempts for rate-limited or failed request initiation.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl HostedConfig {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
        }
    }

    /// Read the API key from an environment variable.
    pub fn from_env(
        env_var: &str,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let api_key = std::env::var(env_var).map_err(|_| {
            BackendError::Config(format!("missing credential: environment variable {}", env_var))
        })?;
        Ok(Self::new(api_key, base_url, model))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Configuration for a self-hosted HTTP model runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Base URL of the runner, e.g. "http://localhost:11434".
    pub base_url: String,

    /// Default model name.
    pub model: String,

    /// Request timeout duration.
    #[serde(default = "default_timeout")]
    pub timeout: Duration,

    /// Maximum attempts for failed request initiation.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl RunnerConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            timeout: default_timeout(),
            max_retries: default_max_retries(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

fn default_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_max_retries() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hosted_config_builder() {
        let config = HostedConfig::new("key", "https://api.anthropic.com", "claude-3-5-sonnet-20241022")
            .with_timeout(Duration::from_secs(30))
            .with_max_retries(2);

        assert_eq!(config.model, "claude-3-5-sonnet-20241022");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn from_env_reports_missing_credential() {
        let err = HostedConfig::from_env("COT_TEST_NO_SUCH_KEY", "url", "model").unwrap_err();
        assert!(matches!(err, BackendError::Config(_)));
    }
}
