//! Turning a root-to-leaf path into the linear history a model call needs.

use serde::Serialize;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::Result;
use crate::node::Role;
use crate::tree::DialogTree;

/// One message of a materialized history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextMessage {
    pub node_id: Uuid,
    pub role: Role,
    pub content: String,
    pub tokens: u32,
}

/// Linear view of one conversation path, built fresh for every turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DialogContext {
    pub history: Vec<ContextMessage>,
    pub system_prompt: Option<String>,
    /// The user turn awaiting a response, when the path ends on one.
    pub active_request: Option<Uuid>,
    pub leaf_id: Uuid,
}

impl DialogContext {
    pub fn total_tokens(&self) -> u32 {
        self.history.iter().map(|message| message.tokens).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContextMaterializer {
    system_prompt: Option<String>,
    max_messages: Option<usize>,
}

impl ContextMaterializer {
    pub fn new(system_prompt: Option<String>) -> Self {
        Self {
            system_prompt: system_prompt.filter(|prompt| !prompt.trim().is_empty()),
            max_messages: None,
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.system_prompt.clone()).with_max_messages(config.max_context_messages)
    }

    /// Keep only the most recent `max` messages. The system prompt is never dropped.
    pub fn with_max_messages(mut self, max: Option<usize>) -> Self {
        self.max_messages = max;
        self
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn materialize_active(&self, tree: &DialogTree) -> Result<DialogContext> {
        self.materialize(tree, tree.active_leaf())
    }

    /// Walks `leaf`'s ancestors, keeps the nodes that contribute to context and
    /// returns them root-first. Response sets contribute their accepted item only.
    pub fn materialize(&self, tree: &DialogTree, leaf: Uuid) -> Result<DialogContext> {
        let path = tree.path_to(leaf)?;

        let mut history: Vec<ContextMessage> = Vec::with_capacity(path.len());
        for id in &path {
            let node = tree.get(*id)?;
            if !node.is_available_in_context() {
                continue;
            }
            let Some(content) = node.content() else {
                continue;
            };
            history.push(ContextMessage {
                node_id: *id,
                role: node.role(),
                content: content.to_string(),
                tokens: node.tokens(),
            });
        }

        if let Some(max) = self.max_messages {
            if history.len() > max {
                let dropped = history.len() - max;
                history.drain(..dropped);
                tracing::debug!(leaf = %leaf, dropped, "ContextMaterializer: trimmed history");
            }
        }

        let leaf_node = tree.get(leaf)?;
        let active_request =
            (leaf_node.role() == Role::User && leaf_node.is_available_in_context()).then_some(leaf);

        tracing::debug!(
            leaf = %leaf,
            depth = path.len().saturating_sub(1),
            messages = history.len(),
            "ContextMaterializer: materialized context"
        );

        Ok(DialogContext {
            history,
            system_prompt: self.system_prompt.clone(),
            active_request,
            leaf_id: leaf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;
    use crate::response::{ItemCompletion, ResponseItem, ResponseSet};

    #[test]
    fn root_only_tree_yields_empty_history() {
        let tree = DialogTree::new();
        let context = ContextMaterializer::new(Some("sys".to_string()))
            .materialize_active(&tree)
            .unwrap();
        assert!(context.is_empty());
        assert_eq!(context.system_prompt.as_deref(), Some("sys"));
        assert!(context.active_request.is_none());
    }

    #[test]
    fn history_is_root_first_and_uses_accepted_item() {
        let mut tree = DialogTree::new();
        let user = tree.add_user_message(tree.root_id(), "hi").unwrap();
        let mut set = ResponseSet::with_item(ResponseItem::completed("gpt", "first"));
        set.push(ResponseItem::completed("gpt", "second"));
        set.accept(1).unwrap();
        let reply = tree.insert(user, NodeKind::Responses(set)).unwrap();
        let follow = tree.add_user_message(reply, "and then?").unwrap();

        let context = ContextMaterializer::default().materialize(&tree, follow).unwrap();

        let contents: Vec<&str> = context.history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "second", "and then?"]);
        assert_eq!(context.history[1].role, Role::Assistant);
        assert_eq!(context.active_request, Some(follow));
    }

    #[test]
    fn responding_and_blank_turns_are_skipped() {
        let mut tree = DialogTree::new();
        let user = tree.add_user_message(tree.root_id(), "hi").unwrap();
        let (reply, _item) = tree.add_response_set(user, "gpt").unwrap();
        let blank = tree.add_user_message(reply, "  ").unwrap();

        let context = ContextMaterializer::default().materialize(&tree, blank).unwrap();

        assert_eq!(context.history.len(), 1);
        assert_eq!(context.history[0].node_id, user);
        assert!(context.active_request.is_none());
    }

    #[test]
    fn materialization_is_idempotent() {
        let mut tree = DialogTree::new();
        let user = tree.add_user_message(tree.root_id(), "hi").unwrap();
        let (reply, item) = tree.add_response_set(user, "gpt").unwrap();
        tree.complete_response_item(
            reply,
            item,
            ItemCompletion {
                content: "hello".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        let materializer = ContextMaterializer::new(Some("be nice".to_string()));

        let first = materializer.materialize(&tree, reply).unwrap();
        let second = materializer.materialize(&tree, reply).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.history.len(), 2);
    }

    #[test]
    fn max_messages_keeps_most_recent() {
        let mut tree = DialogTree::new();
        let mut parent = tree.root_id();
        for text in ["one", "two", "three"] {
            parent = tree.add_user_message(parent, text).unwrap();
        }

        let context = ContextMaterializer::new(None)
            .with_max_messages(Some(2))
            .materialize(&tree, parent)
            .unwrap();

        let contents: Vec<&str> = context.history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three"]);
    }

    #[test]
    fn blank_system_prompt_is_dropped() {
        let materializer = ContextMaterializer::new(Some("   ".to_string()));
        assert!(materializer.system_prompt().is_none());
    }
}
