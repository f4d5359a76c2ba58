//! Hierarchical text rendering of tries, for logs and the explorer CLI.

use crate::node::CotTrieNode;

/// Renders a trie as indented text, one bracketed line per step variant.
pub struct TrieVisualizer;

impl TrieVisualizer {
    pub fn visualize(root: &CotTrieNode) -> String {
        let mut out = String::new();
        Self::visit(root, 0, &mut out);
        out
    }

    fn visit(node: &CotTrieNode, depth: usize, out: &mut String) {
        let indent = "    ".repeat(depth);
        for step in &node.content.steps {
            out.push_str(&indent);
            out.push('[');
            out.push_str(step);
            out.push_str("]\n");
        }
        out.push_str(&format!(
            "{}status: {}\n",
            indent,
            node.content.correct.as_str()
        ));
        if node.terminal {
            out.push_str(&indent);
            out.push_str("(terminal)\n");
        }
        out.push('\n');

        for child in &node.children {
            Self::visit(child, depth + 1, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correctness::Correctness;
    use crate::node::CotContent;

    #[test]
    fn renders_variants_status_and_terminality() {
        let mut root = CotTrieNode::new(
            CotContent::single("1. compute", Correctness::Correct),
            "1. compute",
            1,
        );
        let mut child = CotTrieNode::new(
            CotContent::single("2. done", Correctness::Incorrect),
            "1. compute2. done",
            2,
        );
        child.terminal = true;
        root.children.push(child);

        let text = TrieVisualizer::visualize(&root);
        assert!(text.contains("[1. compute]"));
        assert!(text.contains("status: correct"));
        assert!(text.contains("    [2. done]"));
        assert!(text.contains("    status: incorrect"));
        assert!(text.contains("    (terminal)"));
    }
}
