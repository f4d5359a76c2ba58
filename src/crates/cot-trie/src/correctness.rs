//! Correctness labels for steps and final answers.

use serde::{Deserialize, Serialize};

/// Correctness of a step or of a terminal answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Correctness {
    Correct,
    Incorrect,
    /// The judge could not decide.
    Uncertain,
    /// The judge's output could not be interpreted.
    Unknown,
}

impl Correctness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Correctness::Correct => "correct",
            Correctness::Incorrect => "incorrect",
            Correctness::Uncertain => "uncertain",
            Correctness::Unknown => "unknown",
        }
    }
}

/// Outcome of comparing a terminal step against the ground-truth answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerCheck {
    pub correct: Correctness,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl AnswerCheck {
    pub fn new(correct: Correctness, explanation: impl Into<String>) -> Self {
        Self {
            correct,
            explanation: Some(explanation.into()),
        }
    }
}
