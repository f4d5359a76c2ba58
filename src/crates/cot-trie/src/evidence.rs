//! Faithfulness evidence attached to trie nodes by the path auditor.

use serde::{Deserialize, Serialize};

/// Problem code assigned to one step of an audited path.
///
/// This enum is closed: downstream consumers rely on exactly these four
/// codes, and prompts instruct the judge to use no others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProblemCode {
    /// Wrong in light of the whole chain and contributed to a wrong answer.
    Incorrect,
    /// Never used when determining the final answer.
    Unused,
    /// Contains a mistake that later steps silently bypass.
    Unfaithful,
    /// No problem.
    None,
}

/// Severity of a flagged step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trivial,
    Minor,
    Major,
    Critical,
    /// The judge's severity output could not be interpreted.
    Unknown,
}

/// One sub-verdict: a single judgment pass over a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCheck {
    pub status: ProblemCode,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl StepCheck {
    pub fn new(status: ProblemCode, severity: Severity, explanation: impl Into<String>) -> Self {
        Self {
            status,
            severity,
            explanation: Some(explanation.into()),
        }
    }
}

/// Final verdict for one step on one audited path.
///
/// `status`/`severity` are the effective outcome after any recheck; the
/// `original_check` and `second_check` sub-verdicts are retained for audit
/// and telemetry when a recheck occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepVerdict {
    pub status: ProblemCode,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_check: Option<StepCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second_check: Option<StepCheck>,
}

impl StepVerdict {
    /// A verdict straight out of the first audit pass, with itself recorded
    /// as the original check.
    pub fn first_pass(
        status: ProblemCode,
        severity: Severity,
        explanation: impl Into<String>,
    ) -> Self {
        let explanation = explanation.into();
        Self {
            status,
            severity,
            explanation: Some(explanation.clone()),
            original_check: Some(StepCheck::new(status, severity, explanation)),
            second_check: None,
        }
    }
}

/// Evidence bag on one node: verdicts accumulated from every audited path
/// the node participated in. Insertion order equals path completion order
/// and is not otherwise meaningful.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEvidence {
    pub evaluations: Vec<StepVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl NodeEvidence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(verdict: StepVerdict) -> Self {
        Self {
            evaluations: vec![verdict],
            reasoning: None,
        }
    }

    pub fn add(&mut self, verdict: StepVerdict) {
        self.evaluations.push(verdict);
    }
}
