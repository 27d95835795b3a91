//! Property tests for the patch engine.
//!
//! - Applying the same batch twice to the same tree gives equal trees.
//! - Subtrees no operation addresses come out as the same `Arc`.
//! - Repeating an `updateProps` leaves the props unchanged.

use canopy_core::{apply, PatchOp, Props, UiNode};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

// ---------------------------------------------------------------
// Strategy helpers
// ---------------------------------------------------------------

/// Build a tree of `parents.len() + 1` nodes. Node `i + 1` hangs under
/// node `parents[i] % (i + 1)`, so every shape is reachable and ids
/// (`n0`, `n1`, ...) are unique.
fn build_tree(parents: &[usize]) -> Arc<UiNode> {
    let count = parents.len() + 1;
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (i, p) in parents.iter().enumerate() {
        children[p % (i + 1)].push(i + 1);
    }

    fn build(index: usize, children: &[Vec<usize>]) -> Arc<UiNode> {
        let mut node = UiNode::new("box", format!("n{index}")).with_prop("seq", json!(index));
        if !children[index].is_empty() {
            node = node.with_children(children[index].iter().map(|c| build(*c, children)).collect());
        }
        node.into_shared()
    }

    build(0, &children)
}

#[derive(Debug, Clone)]
enum OpSeed {
    Replace(usize),
    Update(usize, i64),
    Insert(usize, usize),
    Remove(usize),
}

fn op_seed_strategy(max_target: usize) -> impl Strategy<Value = OpSeed> {
    prop_oneof![
        (0..max_target).prop_map(OpSeed::Replace),
        (0..max_target, any::<i64>()).prop_map(|(t, v)| OpSeed::Update(t, v)),
        (0..max_target, 0usize..6).prop_map(|(t, i)| OpSeed::Insert(t, i)),
        (0..max_target).prop_map(OpSeed::Remove),
    ]
}

/// Turn seeds into operations. Targets past the tree size address ids
/// that do not exist; payload nodes use fresh `x*` ids.
fn materialize(seeds: &[OpSeed]) -> Vec<PatchOp> {
    seeds
        .iter()
        .enumerate()
        .map(|(k, seed)| match seed {
            OpSeed::Replace(t) => PatchOp::Replace {
                id: format!("n{t}"),
                node: UiNode::new("text", format!("x{k}")).into_shared(),
            },
            OpSeed::Update(t, v) => PatchOp::UpdateProps {
                id: format!("n{t}"),
                props: props(json!({ "value": v })),
            },
            OpSeed::Insert(t, i) => PatchOp::InsertChild {
                parent_id: format!("n{t}"),
                index: *i,
                node: UiNode::new("text", format!("x{k}")).into_shared(),
            },
            OpSeed::Remove(t) => PatchOp::Remove { id: format!("n{t}") },
        })
        .collect()
}

fn props(value: serde_json::Value) -> Props {
    value.as_object().cloned().unwrap_or_default()
}

fn subtree_ids(node: &UiNode, out: &mut HashSet<String>) {
    out.insert(node.id.clone());
    for child in node.children() {
        subtree_ids(child, out);
    }
}

fn all_nodes(node: &Arc<UiNode>, out: &mut Vec<Arc<UiNode>>) {
    out.push(node.clone());
    for child in node.children() {
        all_nodes(child, out);
    }
}

// ---------------------------------------------------------------
// Determinism
// ---------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn apply_is_deterministic(
        parents in prop::collection::vec(any::<usize>(), 0..30),
        seeds in prop::collection::vec(op_seed_strategy(40), 0..20),
    ) {
        let tree = build_tree(&parents);
        let ops = materialize(&seeds);

        let first = apply(&tree, &ops);
        let second = apply(&tree, &ops);
        prop_assert_eq!(&*first, &*second);
    }
}

// ---------------------------------------------------------------
// Structural sharing
// ---------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn unaddressed_subtrees_are_shared(
        parents in prop::collection::vec(any::<usize>(), 1..30),
        seeds in prop::collection::vec(op_seed_strategy(40), 1..10),
    ) {
        let tree = build_tree(&parents);
        let ops = materialize(&seeds);
        let targets: HashSet<&str> = ops.iter().map(|op| op.target()).collect();
        let next = apply(&tree, &ops);

        let mut nodes = Vec::new();
        all_nodes(&tree, &mut nodes);

        for node in nodes {
            let mut ids = HashSet::new();
            subtree_ids(&node, &mut ids);
            if ids.iter().any(|id| targets.contains(id.as_str())) {
                continue;
            }
            if let Some(after) = next.find(&node.id) {
                prop_assert!(
                    Arc::ptr_eq(&node, after),
                    "subtree {} was not addressed but was copied",
                    node.id
                );
            }
        }
    }

    #[test]
    fn input_tree_is_never_mutated(
        parents in prop::collection::vec(any::<usize>(), 0..30),
        seeds in prop::collection::vec(op_seed_strategy(40), 0..20),
    ) {
        let tree = build_tree(&parents);
        let snapshot = (*tree).clone();
        let _ = apply(&tree, &materialize(&seeds));
        prop_assert_eq!(&*tree, &snapshot);
    }
}

// ---------------------------------------------------------------
// updateProps idempotence
// ---------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn update_props_is_idempotent(
        parents in prop::collection::vec(any::<usize>(), 0..20),
        target in 0usize..20,
        value in any::<i64>(),
        label in "[a-z]{0,8}",
    ) {
        let tree = build_tree(&parents);
        let op = PatchOp::UpdateProps {
            id: format!("n{target}"),
            props: props(json!({ "value": value, "label": label })),
        };

        let once = apply(&tree, std::slice::from_ref(&op));
        let twice = apply(&tree, &[op.clone(), op]);
        prop_assert_eq!(&*once, &*twice);

        // A repeat on the already-updated tree keeps its identity.
        let again = apply(&once, &[PatchOp::UpdateProps {
            id: format!("n{target}"),
            props: props(json!({ "value": value, "label": label })),
        }]);
        prop_assert!(Arc::ptr_eq(&once, &again));
    }
}
