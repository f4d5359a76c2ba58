//! Root-to-leaf paths through a trie.

use crate::node::CotTrieNode;
use serde::{Deserialize, Serialize};

/// Visit state used by minimal covering path extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeVisitStatus {
    Unvisited,
    Visiting,
    Visited,
}

/// An ordered sequence of nodes from the root to a leaf.
///
/// Paths are ephemeral views: they own deep copies of the nodes they cover,
/// so mutating the trie afterwards does not invalidate them. A path is valid
/// iff its last node is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CotPath {
    pub nodes: Vec<CotTrieNode>,
}

impl CotPath {
    pub fn new(nodes: Vec<CotTrieNode>) -> Self {
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the path ends in a terminal leaf.
    pub fn is_valid(&self) -> bool {
        self.nodes.last().is_some_and(|node| node.terminal)
    }

    /// The leaf node, if any.
    pub fn leaf(&self) -> Option<&CotTrieNode> {
        self.nodes.last()
    }
}

impl std::fmt::Display for CotPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "Step {}: {}", i + 1, node.content.first_step())?;
        }
        Ok(())
    }
}
