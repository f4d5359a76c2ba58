//! Generation parameters accepted by all back-ends.

use serde::{Deserialize, Serialize};

/// Default output-token bound when the caller does not set one.
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/// Sampling parameters for one streamed generation.
///
/// Each field is optional so that per-attempt overrides can be layered on top
/// of a common parameter set with [`GenerationParams::merged`]. `seed` is a
/// best-effort determinism hint: back-ends that cannot honor it at nonzero
/// temperature may vary the prompt content in a seeded way instead (see the
/// in-process adapter).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Model-name override for this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Seed selecting a paraphrase of the step-numbering instruction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cot_instruction_seed: Option<u64>,
    /// When set, chunks carry the exact rendered input that produced them.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub with_input: bool,
}

impl GenerationParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_cot_instruction_seed(mut self, seed: u64) -> Self {
        self.cot_instruction_seed = Some(seed);
        self
    }

    pub fn with_recorded_input(mut self) -> Self {
        self.with_input = true;
        self
    }

    /// True when no parameter is set; used to decide whether per-variant
    /// sampling arguments are worth recording.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Layer `overrides` on top of `self`; any field set in `overrides` wins.
    pub fn merged(&self, overrides: &GenerationParams) -> GenerationParams {
        GenerationParams {
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            temperature: overrides.temperature.or(self.temperature),
            seed: overrides.seed.or(self.seed),
            model: overrides.model.clone().or_else(|| self.model.clone()),
            cot_instruction_seed: overrides
                .cot_instruction_seed
                .or(self.cot_instruction_seed),
            with_input: self.with_input || overrides.with_input,
        }
    }

    /// The effective output-token bound.
    pub fn max_tokens_or_default(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }
}
