//! Page cache and navigation reconciliation.
//!
//! A multipage app renders a navigation control (`id = control_id`) whose
//! `options` prop lists the pages and whose `index` prop is the selected
//! one. The root's children split into sidebar nodes (`type =
//! sidebar_kind`), which persist across pages, and main content, which is
//! what the cache stores per page.
//!
//! On a cache hit the cached content is spliced in right away and the next
//! server patch is discarded: it was computed against the page that was on
//! screen before, not against the cached one. On a miss the view shows a
//! loading flag until the server's tree for that page arrives.

use canopy_core::{PatchOp, UiNode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Where navigation state lives in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Widget id of the navigation control
    pub control_id: String,
    /// Prop holding the selected page index
    pub index_prop: String,
    /// Prop holding the page labels
    pub options_prop: String,
    /// Node type of root children that survive page switches
    pub sidebar_kind: String,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            control_id: "nav".to_string(),
            index_prop: "index".to_string(),
            options_prop: "options".to_string(),
            sidebar_kind: "sidebar".to_string(),
        }
    }
}

impl NavigationConfig {
    /// Page the tree is showing, read from the control's selected index.
    pub fn selected_page(&self, tree: &Arc<UiNode>) -> Option<usize> {
        tree.find(&self.control_id)?
            .prop(&self.index_prop)?
            .as_u64()
            .and_then(|index| usize::try_from(index).ok())
    }

    /// Page labels offered by the control.
    pub fn page_labels(&self, tree: &Arc<UiNode>) -> Vec<String> {
        let Some(Value::Array(options)) = tree
            .find(&self.control_id)
            .and_then(|control| control.prop(&self.options_prop))
        else {
            return Vec::new();
        };
        options.iter().map(option_label).collect()
    }

    /// Root children that belong to the current page.
    pub fn main_content(&self, tree: &UiNode) -> Vec<Arc<UiNode>> {
        tree.children()
            .iter()
            .filter(|child| child.kind != self.sidebar_kind)
            .cloned()
            .collect()
    }

    /// Swap the main content of `tree` for `content`, keeping sidebars.
    pub fn splice(&self, tree: &Arc<UiNode>, content: &[Arc<UiNode>]) -> Arc<UiNode> {
        let mut children: Vec<Arc<UiNode>> = tree
            .children()
            .iter()
            .filter(|child| child.kind == self.sidebar_kind)
            .cloned()
            .collect();
        children.extend(content.iter().cloned());

        Arc::new(UiNode {
            kind: tree.kind.clone(),
            id: tree.id.clone(),
            props: tree.props.clone(),
            children: Some(children),
        })
    }

    /// Move the control's selection indicator to `page`.
    pub fn select(&self, tree: &Arc<UiNode>, page: usize) -> Arc<UiNode> {
        let mut props = Map::new();
        props.insert(self.index_prop.clone(), Value::from(page));
        let op = PatchOp::UpdateProps {
            id: self.control_id.clone(),
            props,
        };
        canopy_core::apply_op(tree, &op).0
    }
}

fn option_label(option: &Value) -> String {
    match option {
        Value::String(label) => label.clone(),
        Value::Object(fields) => fields
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        other => other.to_string(),
    }
}

/// URL-safe form of a page label: lowercase, dash separated.
pub fn slugify(label: &str) -> String {
    let mut slug = String::with_capacity(label.len());
    for c in label.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Path of a page: `/` for the first page, `/<slug>` otherwise.
pub fn page_path(labels: &[String], page: usize) -> String {
    match labels.get(page) {
        Some(label) if page > 0 => format!("/{}", slugify(label)),
        _ => "/".to_string(),
    }
}

/// Page named by a path, if any.
pub fn page_for_path(labels: &[String], path: &str) -> Option<usize> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let slug = path.trim_matches('/');
    if slug.is_empty() {
        return (!labels.is_empty()).then_some(0);
    }
    labels.iter().position(|label| slugify(label) == slug)
}

/// Last seen main content per page. Entries are never expired.
#[derive(Debug, Default)]
pub struct PageCache {
    pages: HashMap<usize, Vec<Arc<UiNode>>>,
}

impl PageCache {
    pub fn store(&mut self, page: usize, content: Vec<Arc<UiNode>>) {
        self.pages.insert(page, content);
    }

    pub fn get(&self, page: usize) -> Option<&[Arc<UiNode>]> {
        self.pages.get(&page).map(Vec::as_slice)
    }

    pub fn contains(&self, page: usize) -> bool {
        self.pages.contains_key(&page)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Result of starting a navigation.
#[derive(Debug, Clone)]
pub struct NavigationPlan {
    /// Tree to show right away.
    pub tree: Arc<UiNode>,
    /// Whether the tree came from the cache.
    pub cache_hit: bool,
}

/// Cache plus the state that ties optimistic navigations to server patches.
///
/// The local tree carries an optimistic selection index as soon as a
/// navigation starts, so the page the server is actually rendering is
/// tracked separately, from full trees and from the ops that touch the
/// navigation control.
#[derive(Debug, Default)]
pub struct NavigationReconciler {
    config: NavigationConfig,
    cache: PageCache,
    /// Server patches still to discard, one per cache-hit navigation.
    suppressed: u32,
    loading: Option<usize>,
    /// Page the server last said it is rendering.
    confirmed: Option<usize>,
}

impl NavigationReconciler {
    pub fn new(config: NavigationConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &NavigationConfig {
        &self.config
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    /// Page the view is waiting for, if any.
    pub fn loading(&self) -> Option<usize> {
        self.loading
    }

    /// Page the server is rendering, as far as its messages tell.
    pub fn confirmed_page(&self) -> Option<usize> {
        self.confirmed
    }

    pub fn suppressed_patches(&self) -> u32 {
        self.suppressed
    }

    /// Record a full tree from the server. It ends any wait.
    pub fn observe_full(&mut self, tree: &Arc<UiNode>) -> Option<usize> {
        self.confirmed = self.config.selected_page(tree);
        self.loading = None;
        self.remember(tree);
        self.confirmed
    }

    /// Record the result of applying `ops` from the server. The wait ends
    /// only once the ops move the server's selection to the awaited page.
    pub fn observe_patch(&mut self, tree: &Arc<UiNode>, ops: &[PatchOp]) -> Option<usize> {
        for op in ops {
            if let Some(selection) = self.selection_in(op) {
                self.confirmed = selection;
            }
        }
        if self.loading.is_some() && self.loading == self.confirmed {
            self.loading = None;
        }
        self.remember(tree);
        self.confirmed
    }

    fn remember(&mut self, tree: &Arc<UiNode>) {
        if let Some(page) = self.confirmed {
            self.cache.store(page, self.config.main_content(tree));
        }
    }

    /// New server selection set by `op`; `Some(None)` when the control goes away.
    fn selection_in(&self, op: &PatchOp) -> Option<Option<usize>> {
        match op {
            PatchOp::UpdateProps { id, props } if *id == self.config.control_id => props
                .get(&self.config.index_prop)
                .map(|index| index.as_u64().and_then(|index| usize::try_from(index).ok())),
            PatchOp::Replace { node, .. } | PatchOp::InsertChild { node, .. } => node
                .find(&self.config.control_id)
                .map(|_| self.config.selected_page(node)),
            PatchOp::Remove { id } if *id == self.config.control_id => Some(None),
            _ => None,
        }
    }

    /// Start navigating `tree` to `page`.
    pub fn begin(&mut self, tree: &Arc<UiNode>, page: usize) -> NavigationPlan {
        let selected = self.config.select(tree, page);

        match self.cache.get(page) {
            Some(content) => {
                let spliced = self.config.splice(&selected, content);
                // Cached content may carry its own copy of the control.
                let tree = self.config.select(&spliced, page);
                self.suppressed += 1;
                self.loading = None;
                // The discarded rerun patch is the one that moves the server here.
                self.confirmed = Some(page);
                log::info!("Navigation cache hit for page {page}");
                NavigationPlan {
                    tree,
                    cache_hit: true,
                }
            }
            None => {
                self.loading = Some(page);
                log::info!("Navigation cache miss for page {page}");
                NavigationPlan {
                    tree: selected,
                    cache_hit: false,
                }
            }
        }
    }

    /// Whether the incoming patch must be dropped. Consumes one suppression.
    pub fn take_suppressed(&mut self) -> bool {
        if self.suppressed > 0 {
            self.suppressed -= 1;
            true
        } else {
            false
        }
    }
}

/// The host's addressable location (URL path).
pub trait LocationSync: Send + Sync {
    fn current(&self) -> String;
    /// Change the location without adding a history entry.
    fn replace(&self, path: &str);
    /// Change the location and add a history entry.
    fn push(&self, path: &str);
}

#[derive(Debug)]
struct History {
    entries: Vec<String>,
    index: usize,
}

/// In-memory location with a history stack, for headless hosts and tests.
#[derive(Debug)]
pub struct MemoryLocation {
    history: Mutex<History>,
}

impl Default for MemoryLocation {
    fn default() -> Self {
        Self::new("/")
    }
}

impl MemoryLocation {
    pub fn new(initial: &str) -> Self {
        Self {
            history: Mutex::new(History {
                entries: vec![initial.to_string()],
                index: 0,
            }),
        }
    }

    /// Step back; returns the new location.
    pub fn back(&self) -> Option<String> {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.index == 0 {
            return None;
        }
        history.index -= 1;
        Some(history.entries[history.index].clone())
    }

    /// Step forward; returns the new location.
    pub fn forward(&self) -> Option<String> {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.index + 1 >= history.entries.len() {
            return None;
        }
        history.index += 1;
        Some(history.entries[history.index].clone())
    }

    pub fn history_len(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}

impl LocationSync for MemoryLocation {
    fn current(&self) -> String {
        let history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.entries[history.index].clone()
    }

    fn replace(&self, path: &str) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let index = history.index;
        history.entries[index] = path.to_string();
    }

    fn push(&self, path: &str) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        let next = history.index + 1;
        history.entries.truncate(next);
        history.entries.push(path.to_string());
        history.index = next;
    }
}
