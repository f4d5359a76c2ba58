//! Chain-of-thought reasoning trie.
//!
//! A solved problem explodes into a branching tree of reasoning
//! continuations. Each node holds one *equivalence class* of step variants —
//! literal texts judged logically identical — together with a correctness
//! label, an optional terminal-answer judgment, and any faithfulness
//! evidence attached by the path auditor. This crate owns that data model:
//! the node and content types, root-to-leaf paths, minimal covering path
//! extraction, JSON serialization (tolerant of legacy records), node-id
//! back-fill, and a text visualizer.
//!
//! # Structure
//!
//! - [`CotTrieNode`] / [`CotContent`] — one node and its equivalence class
//! - [`CotTrie`] — the tree, stats, and path extraction
//! - [`CotPath`] — an owned root-to-leaf view
//! - [`NodeEvidence`] / [`StepVerdict`] — per-path faithfulness verdicts
//!   accumulated on nodes
//!
//! # Invariants
//!
//! - A non-root node's `prefix` equals its parent's prefix concatenated with
//!   one of the node's step variants.
//! - A node is terminal iff it has no children or the model's stream ended
//!   while producing it.
//! - Node ids are unique within one tree and assigned in creation order.

pub mod correctness;
pub mod evidence;
pub mod node;
pub mod path;
pub mod trie;
pub mod visualize;

pub use correctness::{AnswerCheck, Correctness};
pub use evidence::{NodeEvidence, ProblemCode, Severity, StepCheck, StepVerdict};
pub use node::{CotContent, CotTrieNode};
pub use path::CotPath;
pub use trie::{CotTrie, TrieError};
pub use visualize::TrieVisualizer;
