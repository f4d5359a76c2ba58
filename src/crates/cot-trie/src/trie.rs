//! The chain-of-thought trie: stats, path extraction, evidence folding.

use crate::correctness::Correctness;
use crate::evidence::{ProblemCode, Severity, StepVerdict};
use crate::node::CotTrieNode;
use crate::path::{CotPath, NodeVisitStatus};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised when loading or manipulating a trie.
#[derive(Debug, Error)]
pub enum TrieError {
    #[error("invalid trie record: {0}")]
    Invalid(String),

    #[error("missing root node")]
    MissingRoot,

    #[error("no node with id {0}")]
    UnknownNode(u32),
}

/// A reasoning trie rooted at one primed solver step.
#[derive(Debug, Clone, PartialEq)]
pub struct CotTrie {
    pub root: CotTrieNode,
}

impl CotTrie {
    /// Build a trie from an in-memory root, normalizing legacy fields.
    pub fn from_root(mut root: CotTrieNode) -> Self {
        Self::normalize(&mut root);
        Self { root }
    }

    /// Deserialize the persisted `{"root": ...}` wrapper.
    ///
    /// Tolerates legacy records: missing `node_id`, `secondary_eval`,
    /// `step_indices`, `args`, and `meta`; missing `terminal` is implied by
    /// empty `children`; a single-record `args` applies to all variants.
    pub fn from_value(value: &Value) -> Result<Self, TrieError> {
        let root_value = value.get("root").ok_or(TrieError::MissingRoot)?;
        let root: CotTrieNode = serde_json::from_value(root_value.clone())
            .map_err(|e| TrieError::Invalid(e.to_string()))?;
        Ok(Self::from_root(root))
    }

    /// Serialize to the persisted `{"root": ...}` wrapper.
    pub fn to_value(&self) -> Result<Value, TrieError> {
        let root = serde_json::to_value(&self.root).map_err(|e| TrieError::Invalid(e.to_string()))?;
        Ok(serde_json::json!({ "root": root }))
    }

    fn normalize(root: &mut CotTrieNode) {
        root.walk_mut(&mut |node| {
            if node.children.is_empty() {
                node.terminal = true;
            }
            // Expand a legacy apply-to-all args record to one entry per
            // variant. A genuine per-variant list of length one only occurs
            // for single-variant nodes, where the expansion is the identity.
            if let Some(args) = &mut node.content.args {
                if args.len() == 1 && node.content.steps.len() > 1 {
                    let record = args[0].clone();
                    *args = vec![record; node.content.steps.len()];
                }
            }
        });
    }

    /// Total number of nodes.
    pub fn size(&self) -> usize {
        let mut count = 0;
        self.root.walk(&mut |_| count += 1);
        count
    }

    /// Maximum depth in nodes.
    pub fn depth(&self) -> usize {
        fn depth_of(node: &CotTrieNode) -> usize {
            1 + node.children.iter().map(depth_of).max().unwrap_or(0)
        }
        depth_of(&self.root)
    }

    /// Number of nodes labeled incorrect.
    pub fn count_incorrect_steps(&self) -> usize {
        let mut count = 0;
        self.root.walk(&mut |node| {
            if node.content.correct == Correctness::Incorrect {
                count += 1;
            }
        });
        count
    }

    /// Whether any node carries a judge explanation. Legacy tries don't.
    pub fn has_explanation(&self) -> bool {
        let mut found = false;
        self.root.walk(&mut |node| {
            found |= node.content.explanation.is_some();
        });
        found
    }

    /// Whether any node carries an id.
    pub fn has_node_ids(&self) -> bool {
        let mut found = false;
        self.root.walk(&mut |node| {
            found |= node.node_id.is_some();
        });
        found
    }

    /// Stamp a fresh pre-order numbering starting at 1 on every node.
    pub fn assign_node_ids(&mut self) {
        let mut next = 1u32;
        self.root.walk_mut(&mut |node| {
            node.node_id = Some(next);
            next += 1;
        });
    }

    /// Stamp ids only when the trie carries none (externally supplied
    /// legacy records).
    pub fn ensure_node_ids(&mut self) {
        if !self.has_node_ids() {
            self.assign_node_ids();
        }
    }

    /// Find a node by id.
    pub fn node(&self, node_id: u32) -> Option<&CotTrieNode> {
        fn find(node: &CotTrieNode, id: u32) -> Option<&CotTrieNode> {
            if node.node_id == Some(id) {
                return Some(node);
            }
            node.children.iter().find_map(|child| find(child, id))
        }
        find(&self.root, node_id)
    }

    /// Append a faithfulness verdict to the node with `node_id`.
    pub fn attach_evidence(&mut self, node_id: u32, verdict: StepVerdict) -> Result<(), TrieError> {
        fn find_mut(node: &mut CotTrieNode, id: u32) -> Option<&mut CotTrieNode> {
            if node.node_id == Some(id) {
                return Some(node);
            }
            node.children
                .iter_mut()
                .find_map(|child| find_mut(child, id))
        }

        let node = find_mut(&mut self.root, node_id).ok_or(TrieError::UnknownNode(node_id))?;
        node.content
            .secondary_eval
            .get_or_insert_with(Default::default)
            .add(verdict);
        Ok(())
    }

    /// Find the minimal set of valid paths covering every node that
    /// satisfies `condition`.
    ///
    /// Nodes matching the condition are marked "visiting". At a terminal
    /// leaf that passes `leaf_accept` (or when no acceptor is supplied), a
    /// path is emitted whenever any node on it is still visiting, and those
    /// nodes are promoted to "visited". A leaf that fails the acceptor
    /// never promotes — so a later accepted leaf under the same flagged
    /// node still gets its own path — but its path is emitted once per
    /// flagged region all the same, so every flagged node is represented
    /// even when no accepted leaf exists below it. A flagged node with one
    /// accepted and one rejected terminal descendant therefore yields two
    /// paths, one per leaf.
    pub fn find_paths(
        &self,
        condition: impl Fn(&CotTrieNode) -> bool,
        leaf_accept: Option<&dyn Fn(&CotTrieNode) -> bool>,
    ) -> Vec<CotPath> {
        // Status is keyed by node address; tries are not mutated during the
        // traversal so addresses are stable.
        struct Traversal<'f> {
            status: HashMap<usize, NodeVisitStatus>,
            reject_covered: std::collections::HashSet<usize>,
            condition: &'f dyn Fn(&CotTrieNode) -> bool,
            leaf_accept: Option<&'f dyn Fn(&CotTrieNode) -> bool>,
            paths: Vec<CotPath>,
        }

        fn key(node: &CotTrieNode) -> usize {
            node as *const CotTrieNode as usize
        }

        fn traverse<'a>(t: &mut Traversal<'_>, node: &'a CotTrieNode, current: &mut Vec<&'a CotTrieNode>) {
            let k = key(node);
            t.status.entry(k).or_insert(NodeVisitStatus::Unvisited);
            current.push(node);

            if (t.condition)(node) && t.status[&k] == NodeVisitStatus::Unvisited {
                t.status.insert(k, NodeVisitStatus::Visiting);
            }

            if node.terminal {
                let flagged: Vec<usize> = current
                    .iter()
                    .map(|n| key(n))
                    .filter(|k| t.status[k] != NodeVisitStatus::Unvisited)
                    .collect();
                let visiting: Vec<usize> = current
                    .iter()
                    .map(|n| key(n))
                    .filter(|k| t.status[k] == NodeVisitStatus::Visiting)
                    .collect();

                let accepted = t.leaf_accept.map_or(true, |accept| accept(node));
                if accepted {
                    if !visiting.is_empty() {
                        t.paths
                            .push(CotPath::new(current.iter().map(|n| (*n).clone()).collect()));
                        for k in visiting {
                            t.status.insert(k, NodeVisitStatus::Visited);
                        }
                    }
                } else if flagged.iter().any(|k| !t.reject_covered.contains(k)) {
                    t.paths
                        .push(CotPath::new(current.iter().map(|n| (*n).clone()).collect()));
                    t.reject_covered.extend(flagged);
                }
            }

            for child in &node.children {
                traverse(t, child, current);
            }

            current.pop();
        }

        let mut t = Traversal {
            status: HashMap::new(),
            reject_covered: std::collections::HashSet::new(),
            condition: &condition,
            leaf_accept,
            paths: Vec::new(),
        };
        let mut current = Vec::new();
        traverse(&mut t, &self.root, &mut current);
        t.paths
    }

    /// Whether a node carries a confirmed unfaithful verdict of audit-worthy
    /// severity.
    pub fn is_unfaithful_node(node: &CotTrieNode) -> bool {
        node.content.secondary_eval.as_ref().is_some_and(|evidence| {
            evidence.evaluations.iter().any(|verdict| {
                verdict.status == ProblemCode::Unfaithful
                    && matches!(
                        verdict.severity,
                        Severity::Minor | Severity::Major | Severity::Critical | Severity::Unknown
                    )
            })
        })
    }

    /// Whether a leaf carries a correct final-answer judgment.
    pub fn is_correct_answer_leaf(node: &CotTrieNode) -> bool {
        node.content
            .answer_correct
            .as_ref()
            .is_some_and(|check| check.correct == Correctness::Correct)
    }

    /// Paths covering every node labeled incorrect, ending in correct
    /// answer leaves.
    pub fn find_incorrect_paths(&self) -> Vec<CotPath> {
        self.find_paths(
            |node| node.content.correct == Correctness::Incorrect,
            Some(&Self::is_correct_answer_leaf),
        )
    }

    /// Paths covering every node with a qualifying unfaithful verdict.
    pub fn find_unfaithful_paths(&self) -> Vec<CotPath> {
        self.find_paths(Self::is_unfaithful_node, Some(&Self::is_correct_answer_leaf))
    }

    /// Union coverage: nodes labeled incorrect or carrying unfaithful
    /// verdicts. Needed because a chain can be step-correct everywhere yet
    /// flagged unfaithful by the path audit.
    pub fn find_incorrect_or_unfaithful_paths(&self) -> Vec<CotPath> {
        self.find_paths(
            |node| {
                node.content.correct == Correctness::Incorrect || Self::is_unfaithful_node(node)
            },
            Some(&Self::is_correct_answer_leaf),
        )
    }

    /// Whether the trie exhibits unfaithful-to-correct behavior: some
    /// emitted unfaithful path ends in a correct-answer leaf and contains a
    /// node with a confirmed unfaithful verdict.
    pub fn has_unfaithful_correct_path(&self) -> bool {
        self.find_unfaithful_paths().iter().any(|path| {
            let correct_end = path.leaf().is_some_and(Self::is_correct_answer_leaf);
            let unfaithful_count = path
                .nodes
                .iter()
                .filter(|node| Self::is_unfaithful_node(node))
                .count();
            correct_end && unfaithful_count >= 1
        })
    }
}
