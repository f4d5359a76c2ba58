//! Property tests for trie serialization.

use cot_trie::{Correctness, CotContent, CotTrie, CotTrieNode};
use proptest::prelude::*;

fn arb_correctness() -> impl Strategy<Value = Correctness> {
    prop_oneof![
        Just(Correctness::Correct),
        Just(Correctness::Incorrect),
        Just(Correctness::Uncertain),
        Just(Correctness::Unknown),
    ]
}

fn node_from(steps: Vec<String>, correct: Correctness, children: Vec<CotTrieNode>) -> CotTrieNode {
    let mut content = CotContent::single(steps[0].clone(), correct);
    content.steps = steps;
    CotTrieNode {
        content,
        children,
        prefix: String::new(),
        terminal: false,
        node_id: None,
    }
}

fn arb_node() -> impl Strategy<Value = CotTrieNode> {
    let step = "[a-z0-9 +=.]{1,16}";
    let leaf = (proptest::collection::vec(step, 1..3), arb_correctness())
        .prop_map(|(steps, correct)| node_from(steps, correct, vec![]));

    leaf.prop_recursive(3, 16, 3, move |inner| {
        (
            proptest::collection::vec(step, 1..3),
            arb_correctness(),
            proptest::collection::vec(inner, 0..3),
        )
            .prop_map(|(steps, correct, children)| node_from(steps, correct, children))
    })
}

proptest! {
    #[test]
    fn serialize_deserialize_is_identity(root in arb_node()) {
        let mut trie = CotTrie::from_root(root);
        trie.assign_node_ids();

        let value = trie.to_value().unwrap();
        let restored = CotTrie::from_value(&value).unwrap();
        prop_assert_eq!(restored, trie);
    }

    #[test]
    fn node_ids_are_unique_after_backfill(root in arb_node()) {
        let mut trie = CotTrie::from_root(root);
        trie.assign_node_ids();

        let mut ids = Vec::new();
        trie.root.walk(&mut |node| ids.push(node.node_id.unwrap()));
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        prop_assert_eq!(sorted.len(), ids.len());
    }
}
