//! Trie node and step-content types with their persisted JSON schema.

use crate::correctness::{AnswerCheck, Correctness};
use crate::evidence::NodeEvidence;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One equivalence class of reasoning continuations.
///
/// `steps` holds every literal text variant the solver produced for this
/// logical step; `step_indices` are the variants' 1-based positions in the
/// batch the judge grouped; `args` records the sampling parameters each
/// variant was produced under, one entry per variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CotContent {
    pub steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_indices: Option<Vec<u32>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "de_args"
    )]
    pub args: Option<Vec<Option<Value>>>,
    pub correct: Correctness,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_correct: Option<AnswerCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_eval: Option<NodeEvidence>,
    /// Opaque provenance (e.g. raw recorded model inputs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl CotContent {
    /// Content with a single step variant and a correctness label.
    pub fn single(step: impl Into<String>, correct: Correctness) -> Self {
        Self {
            steps: vec![step.into()],
            step_indices: None,
            args: None,
            correct,
            explanation: None,
            answer_correct: None,
            secondary_eval: None,
            meta: None,
        }
    }

    /// The representative variant (the first).
    pub fn first_step(&self) -> &str {
        self.steps.first().map(String::as_str).unwrap_or("")
    }
}

/// Legacy `args` records stored one object applying to every variant;
/// current records store one entry per variant. Accept both shapes here and
/// expand single records during trie normalization, once the variant count
/// is known.
fn de_args<'de, D>(deserializer: D) -> Result<Option<Vec<Option<Value>>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) => Some(
            items
                .into_iter()
                .map(|item| match item {
                    Value::Null => None,
                    other => Some(other),
                })
                .collect(),
        ),
        Some(single) => Some(vec![Some(single)]),
    })
}

/// A node in a chain-of-thought trie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CotTrieNode {
    pub content: CotContent,
    #[serde(default)]
    pub children: Vec<CotTrieNode>,
    /// Exact text produced from the root through the end of this node.
    #[serde(default)]
    pub prefix: String,
    /// True iff this node has no children or the stream ended producing it.
    /// Legacy records omit the field; empty `children` implies it.
    #[serde(default)]
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u32>,
}

impl CotTrieNode {
    pub fn new(content: CotContent, prefix: impl Into<String>, node_id: u32) -> Self {
        Self {
            content,
            children: Vec::new(),
            prefix: prefix.into(),
            terminal: false,
            node_id: Some(node_id),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Depth-first pre-order walk.
    pub fn walk(&self, f: &mut impl FnMut(&CotTrieNode)) {
        f(self);
        for child in &self.children {
            child.walk(f);
        }
    }

    /// Depth-first pre-order walk with mutation.
    pub fn walk_mut(&mut self, f: &mut impl FnMut(&mut CotTrieNode)) {
        f(self);
        for child in &mut self.children {
            child.walk_mut(f);
        }
    }
}

impl std::fmt::Display for CotTrieNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", crate::visualize::TrieVisualizer::visualize(self))
    }
}
