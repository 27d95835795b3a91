//! Patch engine: applies an ordered list of tree mutations to an immutable
//! tree.
//!
//! Each operation searches from the current root, so an operation sees the
//! tree produced by every earlier operation in the same batch. Only the
//! ancestor chain of a mutated node is rebuilt; siblings keep their `Arc`.
//! Operations whose target id does not exist are no-ops.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{Props, UiNode};

/// One tree mutation, in its wire form (`{"op": "updateProps", ...}`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum PatchOp {
    /// Substitute the node matching `id` (and its subtree) with `node`.
    Replace { id: String, node: Arc<UiNode> },
    /// Shallow-merge `props` into the matching node's props.
    UpdateProps { id: String, props: Props },
    /// Insert `node` as a child of `parent_id` at `index`.
    #[serde(rename_all = "camelCase")]
    InsertChild {
        parent_id: String,
        index: usize,
        node: Arc<UiNode>,
    },
    /// Delete the node matching `id` from its parent's children.
    Remove { id: String },
}

impl PatchOp {
    /// Id of the node this operation locates first.
    pub fn target(&self) -> &str {
        match self {
            PatchOp::Replace { id, .. }
            | PatchOp::UpdateProps { id, .. }
            | PatchOp::Remove { id } => id,
            PatchOp::InsertChild { parent_id, .. } => parent_id,
        }
    }

    /// Wire name of the operation kind.
    pub fn kind(&self) -> &'static str {
        match self {
            PatchOp::Replace { .. } => "replace",
            PatchOp::UpdateProps { .. } => "updateProps",
            PatchOp::InsertChild { .. } => "insertChild",
            PatchOp::Remove { .. } => "remove",
        }
    }

    /// Operation kinds this engine understands.
    pub const KINDS: [&'static str; 4] = ["replace", "updateProps", "insertChild", "remove"];
}

/// Counters for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Operations whose target was found.
    pub applied: usize,
    /// Operations whose target id was absent (no-ops).
    pub missed: usize,
}

/// Outcome of visiting a node during a rewrite.
enum Edit {
    Keep,
    Swap(Arc<UiNode>),
    Drop,
}

/// Walk from `node` looking for `id`; once found, let `edit` decide what
/// happens to it and rebuild the ancestors on the way back up.
///
/// Ids are unique, so the walk stops at the first match.
fn rewrite<F>(node: &Arc<UiNode>, id: &str, edit: &mut F) -> Edit
where
    F: FnMut(&Arc<UiNode>) -> Edit,
{
    if node.id == id {
        return edit(node);
    }

    let children = match &node.children {
        Some(children) => children,
        None => return Edit::Keep,
    };

    for (i, child) in children.iter().enumerate() {
        let next_children = match rewrite(child, id, edit) {
            Edit::Keep => continue,
            Edit::Swap(replacement) => {
                let mut next = children.clone();
                next[i] = replacement;
                next
            }
            Edit::Drop => {
                let mut next = children.clone();
                next.remove(i);
                next
            }
        };

        return Edit::Swap(Arc::new(UiNode {
            kind: node.kind.clone(),
            id: node.id.clone(),
            props: node.props.clone(),
            children: Some(next_children),
        }));
    }

    Edit::Keep
}

/// Apply one operation. Returns the new root and whether the target existed.
pub fn apply_op(root: &Arc<UiNode>, op: &PatchOp) -> (Arc<UiNode>, bool) {
    let mut found = false;

    let outcome = match op {
        PatchOp::Replace { id, node } => rewrite(root, id, &mut |_| {
            found = true;
            Edit::Swap(node.clone())
        }),

        PatchOp::UpdateProps { id, props } => rewrite(root, id, &mut |current| {
            found = true;
            let unchanged = props
                .iter()
                .all(|(key, value)| current.props.get(key) == Some(value));
            if unchanged {
                return Edit::Keep;
            }
            let mut next = UiNode::clone(current);
            for (key, value) in props {
                next.props.insert(key.clone(), value.clone());
            }
            Edit::Swap(Arc::new(next))
        }),

        PatchOp::InsertChild {
            parent_id,
            index,
            node,
        } => rewrite(root, parent_id, &mut |parent| {
            found = true;
            let mut next = UiNode::clone(parent);
            let children = next.children.get_or_insert_with(Vec::new);
            let at = (*index).min(children.len());
            children.insert(at, node.clone());
            Edit::Swap(Arc::new(next))
        }),

        PatchOp::Remove { id } => rewrite(root, id, &mut |_| {
            found = true;
            Edit::Drop
        }),
    };

    let next = match outcome {
        Edit::Swap(next) => next,
        // The root has no parent to be removed from.
        Edit::Keep | Edit::Drop => root.clone(),
    };
    (next, found)
}

/// Apply `ops` in order and report how many found their target.
pub fn apply_with_stats(tree: &Arc<UiNode>, ops: &[PatchOp]) -> (Arc<UiNode>, ApplyStats) {
    let mut stats = ApplyStats::default();
    let mut current = tree.clone();

    for op in ops {
        let (next, found) = apply_op(&current, op);
        if found {
            stats.applied += 1;
        } else {
            stats.missed += 1;
            log::debug!("Patch: {} target '{}' not in tree", op.kind(), op.target());
        }
        current = next;
    }

    (current, stats)
}

/// Apply `ops` in order to `tree`, producing the next tree.
///
/// Pure and deterministic; the input tree is never mutated.
pub fn apply(tree: &Arc<UiNode>, ops: &[PatchOp]) -> Arc<UiNode> {
    apply_with_stats(tree, ops).0
}
