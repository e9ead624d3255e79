//! Flat browsing list over a conversation tree plus the selection cursor.
//!
//! The navigator does not own the tree. Read operations take `&DialogTree`,
//! mutating ones take `&mut DialogTree` and rebuild the entry list afterwards so
//! the list never refers to deleted nodes.

use std::collections::HashSet;

use dialog_core::{DialogTree, ItemRemoval, Role, TreeError};
use serde::Serialize;
use uuid::Uuid;

use crate::describe;
use crate::error::{GraphError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavEntry {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    /// Distance from the root sentinel; top-level turns are at depth 1.
    pub depth: usize,
    pub role: Role,
    pub label: String,
    pub is_fork: bool,
    pub sibling_index: usize,
    pub selectable: bool,
    pub on_active_path: bool,
}

/// Outcome of [`GraphNavigator::delete_response_item`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseDeletion {
    /// The set still holds other alternatives.
    ItemRemoved(ItemRemoval),
    /// The item was the last one, so the whole turn and its subtree went away.
    NodeDeleted(Vec<Uuid>),
}

#[derive(Debug, Clone, Default)]
pub struct GraphNavigator {
    entries: Vec<NavEntry>,
    selected: Option<Uuid>,
}

impl GraphNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the list and selects the tree's current active leaf when it is selectable.
    pub fn from_tree(tree: &DialogTree) -> Self {
        let mut navigator = Self::new();
        navigator.refresh(tree);
        if navigator.is_node_selectable(tree, tree.active_leaf()) {
            navigator.selected = Some(tree.active_leaf());
        }
        navigator
    }

    /// Rebuilds entries in layout order. A selection that no longer resolves is cleared.
    pub fn refresh(&mut self, tree: &DialogTree) {
        let active_path: HashSet<Uuid> = tree
            .path_to(tree.active_leaf())
            .map(|path| path.into_iter().collect())
            .unwrap_or_default();

        self.entries = tree
            .depth_first_from(tree.root_id())
            .into_iter()
            .filter(|(id, _)| *id != tree.root_id())
            .filter_map(|(id, depth)| {
                let node = tree.node(id)?;
                Some(NavEntry {
                    id,
                    parent_id: node.parent_id(),
                    depth,
                    role: node.role(),
                    label: describe(node),
                    is_fork: node.is_fork(),
                    sibling_index: tree.sibling_index(id).unwrap_or(0),
                    selectable: !node.is_responding(),
                    on_active_path: active_path.contains(&id),
                })
            })
            .collect();

        if let Some(selected) = self.selected {
            if !self.entries.iter().any(|entry| entry.id == selected) {
                tracing::debug!(selected = %selected, "GraphNavigator: selection no longer in tree");
                self.selected = None;
            }
        }
    }

    pub fn entries(&self) -> &[NavEntry] {
        &self.entries
    }

    pub fn entry(&self, id: Uuid) -> Option<&NavEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn selected(&self) -> Option<Uuid> {
        self.selected
    }

    /// A node can be selected when it is attached, is not the root sentinel and
    /// is not waiting on a response.
    pub fn is_node_selectable(&self, tree: &DialogTree, id: Uuid) -> bool {
        let Some(node) = tree.node(id) else {
            return false;
        };
        !node.is_sentinel() && !node.is_responding() && tree.is_attached(id).unwrap_or(false)
    }

    pub fn select(&mut self, tree: &DialogTree, id: Uuid) -> Result<()> {
        if !tree.contains(id) {
            return Err(TreeError::NodeNotFound(id).into());
        }
        if !self.is_node_selectable(tree, id) {
            return Err(GraphError::NotSelectable(id));
        }
        self.selected = Some(id);
        Ok(())
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    /// Moves to the next selectable entry in list order. Wraps to the first
    /// selectable entry when nothing is selected.
    pub fn select_next(&mut self) -> Option<Uuid> {
        let start = self.selected_position().map_or(0, |pos| pos + 1);
        let next = self.entries[start.min(self.entries.len())..]
            .iter()
            .find(|entry| entry.selectable)
            .map(|entry| entry.id);
        if next.is_some() {
            self.selected = next;
        }
        self.selected
    }

    pub fn select_previous(&mut self) -> Option<Uuid> {
        let end = self.selected_position().unwrap_or(self.entries.len());
        let previous = self.entries[..end]
            .iter()
            .rev()
            .find(|entry| entry.selectable)
            .map(|entry| entry.id);
        if previous.is_some() {
            self.selected = previous;
        }
        self.selected
    }

    fn selected_position(&self) -> Option<usize> {
        let selected = self.selected?;
        self.entries.iter().position(|entry| entry.id == selected)
    }

    /// Makes the selection the tree's active leaf.
    pub fn commit(&mut self, tree: &mut DialogTree) -> Result<Uuid> {
        let selected = self.selected.ok_or(GraphError::NothingSelected)?;
        if !self.is_node_selectable(tree, selected) {
            return Err(GraphError::NotSelectable(selected));
        }
        tree.set_active_leaf(selected)?;
        tracing::info!(node_id = %selected, "GraphNavigator: committed active leaf");
        self.refresh(tree);
        Ok(selected)
    }

    /// Like [`GraphNavigator::commit`], but continues down first children to a leaf.
    pub fn commit_to_leaf(&mut self, tree: &mut DialogTree) -> Result<Uuid> {
        let selected = self.selected.ok_or(GraphError::NothingSelected)?;
        let leaf = tree.descend_to_leaf(selected)?;
        self.select(tree, leaf)?;
        self.commit(tree)
    }

    /// Deletes `id` and its subtree. A selection inside the subtree moves to the
    /// deleted node's parent (or clears if the parent is the root); the tree
    /// re-resolves its own active leaf the same way.
    pub fn delete(&mut self, tree: &mut DialogTree, id: Uuid) -> Result<Vec<Uuid>> {
        let parent = tree.parent(id)?;
        let removed = tree.delete_subtree(id)?;

        if self.selected.is_some_and(|selected| removed.contains(&selected)) {
            self.selected = parent.filter(|p| self.is_node_selectable(tree, *p));
        }
        self.refresh(tree);
        tracing::info!(
            node_id = %id,
            removed = removed.len(),
            selected = ?self.selected,
            "GraphNavigator: deleted node"
        );
        Ok(removed)
    }

    /// Discards one alternative. The last alternative takes its turn with it,
    /// so a response set never stays in the tree empty.
    pub fn delete_response_item(
        &mut self,
        tree: &mut DialogTree,
        node_id: Uuid,
        item_id: Uuid,
    ) -> Result<ResponseDeletion> {
        let set = tree.response_set(node_id)?;
        if set.position(item_id).is_none() {
            return Err(TreeError::ItemNotFound { node_id, item_id }.into());
        }
        if set.len() > 1 {
            let removal = tree.remove_response_item(node_id, item_id)?;
            self.refresh(tree);
            return Ok(ResponseDeletion::ItemRemoved(removal));
        }
        let removed = self.delete(tree, node_id)?;
        Ok(ResponseDeletion::NodeDeleted(removed))
    }
}
