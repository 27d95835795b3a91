//! # canopy-core — UI tree model and patch engine
//!
//! The tree is immutable: every node lives behind an `Arc`, and applying a
//! patch rebuilds only the ancestor chain of each mutated node. Untouched
//! subtrees are shared by reference between the old and new root, so a
//! renderer can skip them with `Arc::ptr_eq`.
//!
//! ```text
//!   old root            new root
//!   ┌───┐               ┌───┐
//!   │ A │               │ A'│        (rebuilt)
//!   └┬─┬┘               └┬─┬┘
//!    │ └──────┐   ┌──────┘ │
//!    ▼        ▼   ▼        ▼
//!  ┌───┐     ┌───┐       ┌───┐
//!  │ B │     │ C │       │ B'│      (C shared, B replaced)
//!  └───┘     └───┘       └───┘
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

pub mod patch;

pub use patch::{apply, apply_op, apply_with_stats, ApplyStats, PatchOp};

/// String-keyed property bag of a node. Key order carries no meaning.
pub type Props = Map<String, Value>;

/// A node of the UI tree.
///
/// `id` is unique within one tree and stable across updates to the same
/// logical widget. `children` is `None` for leaf widgets that never had a
/// child list, which is distinct on the wire from an empty list.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct UiNode {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub props: Props,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Arc<UiNode>>>,
}

impl UiNode {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            props: Props::new(),
            children: None,
        }
    }

    /// Builder: set a single prop.
    pub fn with_prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    /// Builder: replace the whole prop map.
    pub fn with_props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }

    /// Builder: set the child list.
    pub fn with_children(mut self, children: Vec<Arc<UiNode>>) -> Self {
        self.children = Some(children);
        self
    }

    /// Wrap into the shared form used by trees.
    pub fn into_shared(self) -> Arc<UiNode> {
        Arc::new(self)
    }

    /// Children as a slice (empty for leaves).
    #[inline]
    pub fn children(&self) -> &[Arc<UiNode>] {
        self.children.as_deref().unwrap_or(&[])
    }

    #[inline]
    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Depth-first search for the node with `id`.
    pub fn find(self: &Arc<Self>, id: &str) -> Option<&Arc<UiNode>> {
        if self.id == id {
            return Some(self);
        }
        self.children().iter().find_map(|child| child.find(id))
    }

    /// Total number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(|c| c.node_count()).sum::<usize>()
    }

    /// Parse a node from its JSON wire form.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}
