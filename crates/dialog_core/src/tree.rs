//! The conversation tree: a flat node pool keyed by id, with parent ids and
//! ordered child id lists standing in for back-references.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Result, TreeError};
use crate::events::{EventHub, TreeEvent};
use crate::node::{DialogNode, NodeKind, TextTurn};
use crate::response::{ItemCompletion, ItemRemoval, ResponseComparison, ResponseSet, Usage};

#[derive(Debug)]
pub struct DialogTree {
    root_id: Uuid,
    /// Every node owned by this tree, including detached subtrees awaiting re-attachment.
    nodes: HashMap<Uuid, DialogNode>,
    active_leaf: Uuid,
    events: EventHub,
}

impl Default for DialogTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DialogTree {
    pub fn new() -> Self {
        let root = DialogNode::new(NodeKind::Sentinel);
        let root_id = root.id;
        let mut nodes = HashMap::new();
        nodes.insert(root_id, root);
        Self {
            root_id,
            nodes,
            active_leaf: root_id,
            events: EventHub::default(),
        }
    }

    /// Rebuilds a tree from validated parts. Children lists must already be linked.
    pub(crate) fn from_parts(
        root_id: Uuid,
        nodes: HashMap<Uuid, DialogNode>,
        active_leaf: Uuid,
    ) -> Self {
        Self {
            root_id,
            nodes,
            active_leaf,
            events: EventHub::default(),
        }
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TreeEvent> {
        self.events.subscribe()
    }

    pub fn root_id(&self) -> Uuid {
        self.root_id
    }

    pub fn root(&self) -> &DialogNode {
        &self.nodes[&self.root_id]
    }

    pub fn active_leaf(&self) -> Uuid {
        self.active_leaf
    }

    /// Number of nodes in the pool, the root sentinel included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the tree holds nothing but its root sentinel.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn node(&self, id: Uuid) -> Option<&DialogNode> {
        self.nodes.get(&id)
    }

    pub fn get(&self, id: Uuid) -> Result<&DialogNode> {
        self.nodes.get(&id).ok_or(TreeError::NodeNotFound(id))
    }

    pub fn children(&self, id: Uuid) -> Result<&[Uuid]> {
        Ok(self.get(id)?.children())
    }

    pub fn parent(&self, id: Uuid) -> Result<Option<Uuid>> {
        Ok(self.get(id)?.parent_id)
    }

    pub fn is_fork(&self, id: Uuid) -> Result<bool> {
        Ok(self.get(id)?.is_fork())
    }

    /// Position among the parent's children; 0 for the root or a detached node.
    pub fn sibling_index(&self, id: Uuid) -> Result<usize> {
        let node = self.get(id)?;
        let Some(parent_id) = node.parent_id else {
            return Ok(0);
        };
        Ok(self
            .nodes
            .get(&parent_id)
            .and_then(|parent| parent.children.iter().position(|c| *c == id))
            .unwrap_or(0))
    }

    // ---------------------------------------------------------------------
    // Structure
    // ---------------------------------------------------------------------

    /// Creates a new turn under `parent_id` and returns its id.
    pub fn insert(&mut self, parent_id: Uuid, kind: NodeKind) -> Result<Uuid> {
        if matches!(kind, NodeKind::Sentinel) {
            return Err(TreeError::SentinelImmutable);
        }
        if let NodeKind::Responses(set) = &kind {
            if set.is_empty() {
                return Err(TreeError::EmptyResponseSet);
            }
        }
        self.get(parent_id)?;

        let node = DialogNode::new(kind);
        let id = node.id;
        tracing::info!(
            node_id = %id,
            parent_id = %parent_id,
            role = ?node.role(),
            tokens = node.tokens(),
            "DialogTree: inserting node"
        );
        self.nodes.insert(id, node);
        self.link(parent_id, id);
        Ok(id)
    }

    pub fn add_user_message(&mut self, parent_id: Uuid, content: impl Into<String>) -> Result<Uuid> {
        self.insert(parent_id, NodeKind::User(TextTurn::new(content)))
    }

    pub fn add_system_message(
        &mut self,
        parent_id: Uuid,
        content: impl Into<String>,
    ) -> Result<Uuid> {
        self.insert(parent_id, NodeKind::System(TextTurn::new(content)))
    }

    /// Starts an assistant turn with one responding placeholder from `backend`.
    /// Returns `(node_id, item_id)`.
    pub fn add_response_set(
        &mut self,
        parent_id: Uuid,
        backend: impl Into<String>,
    ) -> Result<(Uuid, Uuid)> {
        let mut set = ResponseSet::new();
        let item_id = set.begin_item(backend);
        let node_id = self.insert(parent_id, NodeKind::Responses(set))?;
        Ok((node_id, item_id))
    }

    /// Moves an existing node (with its subtree) under `parent_id`, detaching it
    /// from its current parent first so a node is never linked twice.
    pub fn append_child(&mut self, parent_id: Uuid, child_id: Uuid) -> Result<()> {
        if child_id == self.root_id {
            return Err(TreeError::SentinelImmutable);
        }
        self.get(parent_id)?;
        self.get(child_id)?;
        if parent_id == child_id || self.is_ancestor(child_id, parent_id)? {
            return Err(TreeError::WouldCreateCycle {
                parent: parent_id,
                child: child_id,
            });
        }

        if let Some(previous) = self.nodes[&child_id].parent_id {
            self.unlink(previous, child_id);
        }
        self.link(parent_id, child_id);
        Ok(())
    }

    /// Detaches `child_id` from `parent_id`. The subtree stays in the pool and can be
    /// re-attached with [`DialogTree::append_child`]. Returns `false` if it was not a child.
    pub fn remove_child(&mut self, parent_id: Uuid, child_id: Uuid) -> Result<bool> {
        self.get(parent_id)?;
        self.get(child_id)?;
        if !self.nodes[&parent_id].children.contains(&child_id) {
            return Ok(false);
        }
        self.unlink(parent_id, child_id);
        if self.active_leaf == child_id || self.is_ancestor(child_id, self.active_leaf)? {
            self.set_active_leaf_unchecked(parent_id);
        }
        Ok(true)
    }

    /// Removes `id` and everything below it. Returns the removed ids, `id` first.
    pub fn delete_subtree(&mut self, id: Uuid) -> Result<Vec<Uuid>> {
        if id == self.root_id {
            return Err(TreeError::SentinelImmutable);
        }
        let parent_id = self.get(id)?.parent_id;
        let removed = self.subtree_ids(id);
        let active_inside = removed.contains(&self.active_leaf);

        if let Some(parent_id) = parent_id {
            self.unlink(parent_id, id);
        }
        for node_id in &removed {
            self.nodes.remove(node_id);
            self.events.publish(TreeEvent::NodeDeleted { node_id: *node_id });
        }
        tracing::info!(
            node_id = %id,
            removed = removed.len(),
            pool_size = self.nodes.len(),
            "DialogTree: deleted subtree"
        );

        if active_inside {
            let fallback = parent_id
                .filter(|p| self.nodes.contains_key(p))
                .unwrap_or(self.root_id);
            self.set_active_leaf_unchecked(fallback);
        }
        Ok(removed)
    }

    pub fn set_active_leaf(&mut self, id: Uuid) -> Result<()> {
        self.get(id)?;
        if !self.is_attached(id)? {
            return Err(TreeError::NodeNotFound(id));
        }
        self.set_active_leaf_unchecked(id);
        Ok(())
    }

    fn set_active_leaf_unchecked(&mut self, id: Uuid) {
        if self.active_leaf == id {
            return;
        }
        let previous = std::mem::replace(&mut self.active_leaf, id);
        tracing::debug!(previous = %previous, current = %id, "DialogTree: active leaf changed");
        self.events.publish(TreeEvent::ActiveLeafChanged {
            previous,
            current: id,
        });
    }

    fn link(&mut self, parent_id: Uuid, child_id: Uuid) {
        if let Some(child) = self.nodes.get_mut(&child_id) {
            child.parent_id = Some(parent_id);
        }
        let Some(parent) = self.nodes.get_mut(&parent_id) else {
            return;
        };
        parent.children.push(child_id);
        let index = parent.children.len() - 1;
        let child_count = parent.children.len();

        self.events.publish(TreeEvent::ChildAdded {
            parent_id,
            child_id,
            index,
        });
        if child_count > 1 {
            self.events.publish(TreeEvent::ForkChanged {
                node_id: parent_id,
                is_fork: true,
                child_count,
            });
        }
    }

    fn unlink(&mut self, parent_id: Uuid, child_id: Uuid) {
        if let Some(child) = self.nodes.get_mut(&child_id) {
            child.parent_id = None;
        }
        let Some(parent) = self.nodes.get_mut(&parent_id) else {
            return;
        };
        parent.children.retain(|c| *c != child_id);
        let child_count = parent.children.len();

        self.events.publish(TreeEvent::ChildRemoved {
            parent_id,
            child_id,
        });
        self.events.publish(TreeEvent::ForkChanged {
            node_id: parent_id,
            is_fork: child_count > 1,
            child_count,
        });
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Ids from the top of `id`'s chain (the root when attached) down to `id`.
    /// Fails if the parent chain revisits a node.
    pub fn path_to(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut cursor = Some(id);

        while let Some(current) = cursor {
            if !visited.insert(current) {
                tracing::error!(node_id = %id, revisited = %current, "DialogTree: cyclic ancestor chain");
                return Err(TreeError::CyclicAncestry(id));
            }
            let node = self.get(current)?;
            path.push(current);
            cursor = node.parent_id;
        }

        path.reverse();
        Ok(path)
    }

    /// Number of edges between the root and `id`.
    pub fn depth(&self, id: Uuid) -> Result<usize> {
        Ok(self.path_to(id)?.len().saturating_sub(1))
    }

    /// True when `id` is connected to the root sentinel.
    pub fn is_attached(&self, id: Uuid) -> Result<bool> {
        Ok(self.path_to(id)?.first() == Some(&self.root_id))
    }

    /// True when `ancestor` lies strictly above `node`.
    pub fn is_ancestor(&self, ancestor: Uuid, node: Uuid) -> Result<bool> {
        if ancestor == node {
            return Ok(false);
        }
        Ok(self.path_to(node)?.contains(&ancestor))
    }

    /// Follows first children from `id` down to a leaf.
    pub fn descend_to_leaf(&self, id: Uuid) -> Result<Uuid> {
        let mut current = self.get(id)?;
        let mut guard = 0usize;
        while let Some(first) = current.children.first() {
            guard += 1;
            if guard > self.nodes.len() {
                return Err(TreeError::CyclicAncestry(id));
            }
            current = self.get(*first)?;
        }
        Ok(current.id)
    }

    /// First-child chain below the root, root excluded.
    pub fn main_branch(&self) -> Vec<Uuid> {
        let mut branch = Vec::new();
        let mut current = self.root();
        while let Some(first) = current.children.first() {
            let Some(next) = self.nodes.get(first) else {
                break;
            };
            if branch.len() >= self.nodes.len() {
                break;
            }
            branch.push(next.id);
            current = next;
        }
        branch
    }

    /// Pre-order walk from `id` in child order, with depth relative to `id`.
    pub fn depth_first_from(&self, id: Uuid) -> Vec<(Uuid, usize)> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![(id, 0usize)];
        while let Some((current, depth)) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            if !seen.insert(current) {
                continue;
            }
            out.push((current, depth));
            for child in node.children.iter().rev() {
                stack.push((*child, depth + 1));
            }
        }
        out
    }

    /// Pre-order walk of the attached tree, root first.
    pub fn iter_depth_first(&self) -> impl Iterator<Item = &DialogNode> + '_ {
        self.depth_first_from(self.root_id)
            .into_iter()
            .filter_map(move |(id, _)| self.nodes.get(&id))
    }

    fn subtree_ids(&self, id: Uuid) -> Vec<Uuid> {
        self.depth_first_from(id).into_iter().map(|(id, _)| id).collect()
    }

    // ---------------------------------------------------------------------
    // Response sets
    // ---------------------------------------------------------------------

    pub fn response_set(&self, node_id: Uuid) -> Result<&ResponseSet> {
        self.get(node_id)?
            .response_set()
            .ok_or(TreeError::NotAResponseSet(node_id))
    }

    fn response_set_mut(
        nodes: &mut HashMap<Uuid, DialogNode>,
        node_id: Uuid,
    ) -> Result<&mut ResponseSet> {
        match nodes.get_mut(&node_id) {
            Some(DialogNode {
                kind: NodeKind::Responses(set),
                ..
            }) => Ok(set),
            Some(_) => Err(TreeError::NotAResponseSet(node_id)),
            None => Err(TreeError::NodeNotFound(node_id)),
        }
    }

    /// Appends a responding placeholder for `backend` and accepts it.
    pub fn begin_response_item(&mut self, node_id: Uuid, backend: impl Into<String>) -> Result<Uuid> {
        let set = Self::response_set_mut(&mut self.nodes, node_id)?;
        let item_id = set.begin_item(backend);
        let index = set.len() - 1;
        self.publish_item_added(node_id, item_id, index);
        Ok(item_id)
    }

    /// Adds a fresh alternative regenerating `item_id` with the same backend.
    pub fn retry_response_item(&mut self, node_id: Uuid, item_id: Uuid) -> Result<Uuid> {
        let set = Self::response_set_mut(&mut self.nodes, node_id)?;
        let new_id = set.retry(item_id).map_err(|e| e.in_node(node_id))?;
        let index = set.len() - 1;
        self.publish_item_added(node_id, new_id, index);
        Ok(new_id)
    }

    fn publish_item_added(&mut self, node_id: Uuid, item_id: Uuid, index: usize) {
        tracing::info!(node_id = %node_id, item_id = %item_id, index, "DialogTree: response item added");
        self.events.publish(TreeEvent::ItemAdded {
            node_id,
            item_id,
            index,
        });
        self.events.publish(TreeEvent::AcceptedChanged { node_id, index });
    }

    pub fn accept_response(&mut self, node_id: Uuid, index: usize) -> Result<()> {
        let set = Self::response_set_mut(&mut self.nodes, node_id)?;
        if set.accept(index)? {
            tracing::info!(node_id = %node_id, index, "DialogTree: accepted response changed");
            self.events.publish(TreeEvent::AcceptedChanged { node_id, index });
        }
        Ok(())
    }

    /// Removes one alternative. Fails with [`TreeError::LastResponseItem`] for the
    /// last remaining item; delete the node to drop the whole turn.
    pub fn remove_response_item(&mut self, node_id: Uuid, item_id: Uuid) -> Result<ItemRemoval> {
        let set = Self::response_set_mut(&mut self.nodes, node_id)?;
        let removal = set.remove(item_id).map_err(|e| e.in_node(node_id))?;
        let accepted = set.accepted_index();

        self.events.publish(TreeEvent::ItemRemoved {
            node_id,
            item_id,
            index: removal.index,
        });
        if removal.accepted_changed {
            if let Some(index) = accepted {
                self.events.publish(TreeEvent::AcceptedChanged { node_id, index });
            }
        }
        Ok(removal)
    }

    pub fn append_response_delta(&mut self, node_id: Uuid, item_id: Uuid, delta: &str) -> Result<()> {
        let set = Self::response_set_mut(&mut self.nodes, node_id)?;
        let item = set.item_mut(item_id).ok_or(TreeError::ItemNotFound { node_id, item_id })?;
        item.content.push_str(delta);
        self.events.publish(TreeEvent::ItemUpdated { node_id, item_id });
        Ok(())
    }

    pub fn restart_response_item(&mut self, node_id: Uuid, item_id: Uuid) -> Result<()> {
        let set = Self::response_set_mut(&mut self.nodes, node_id)?;
        set.restart_item(item_id).map_err(|e| e.in_node(node_id))?;
        self.events.publish(TreeEvent::ItemUpdated { node_id, item_id });
        Ok(())
    }

    pub fn complete_response_item(
        &mut self,
        node_id: Uuid,
        item_id: Uuid,
        completion: ItemCompletion,
    ) -> Result<()> {
        let set = Self::response_set_mut(&mut self.nodes, node_id)?;
        set.complete_item(item_id, completion)
            .map_err(|e| e.in_node(node_id))?;
        self.events.publish(TreeEvent::ItemUpdated { node_id, item_id });
        Ok(())
    }

    pub fn fail_response_item(
        &mut self,
        node_id: Uuid,
        item_id: Uuid,
        error: impl Into<String>,
        usage: Usage,
    ) -> Result<()> {
        let set = Self::response_set_mut(&mut self.nodes, node_id)?;
        set.fail_item(item_id, error, usage)
            .map_err(|e| e.in_node(node_id))?;
        self.events.publish(TreeEvent::ItemUpdated { node_id, item_id });
        Ok(())
    }

    pub fn compare_all(&self, node_id: Uuid) -> Result<Vec<ResponseComparison>> {
        Ok(self.response_set(node_id)?.compare_all())
    }

    /// Nodes currently in the pool (attached or not), in no particular order.
    pub(crate) fn nodes(&self) -> &HashMap<Uuid, DialogNode> {
        &self.nodes
    }
}
