//! Dialog turns stored in the tree's node pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::response::ResponseSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Sentinel,
}

/// Rough token estimate used when a provider does not report one.
pub fn estimate_tokens(content: &str) -> u32 {
    let chars = content.chars().count() as u32;
    chars.div_ceil(4)
}

/// A single authored message (user input, system note, or an imported assistant reply).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextTurn {
    pub content: String,
    pub tokens: u32,
}

impl TextTurn {
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let tokens = estimate_tokens(&content);
        Self { content, tokens }
    }

    pub fn with_tokens(content: impl Into<String>, tokens: u32) -> Self {
        Self {
            content: content.into(),
            tokens,
        }
    }
}

/// The closed set of turn kinds a node can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Sentinel,
    System(TextTurn),
    User(TextTurn),
    Assistant(TextTurn),
    Responses(ResponseSet),
}

impl NodeKind {
    pub fn role(&self) -> Role {
        match self {
            NodeKind::Sentinel => Role::Sentinel,
            NodeKind::System(_) => Role::System,
            NodeKind::User(_) => Role::User,
            NodeKind::Assistant(_) | NodeKind::Responses(_) => Role::Assistant,
        }
    }
}

/// One conversation turn. Structure (`parent_id`/`children`) is maintained by
/// [`crate::DialogTree`]; the fields are read-only outside this crate.
#[derive(Debug, Clone)]
pub struct DialogNode {
    pub(crate) id: Uuid,
    pub(crate) parent_id: Option<Uuid>,
    pub(crate) children: Vec<Uuid>,
    pub(crate) kind: NodeKind,
    pub(crate) created_at: DateTime<Utc>,
}

impl DialogNode {
    pub(crate) fn new(kind: NodeKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            children: Vec::new(),
            kind,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    pub fn children(&self) -> &[Uuid] {
        &self.children
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn role(&self) -> Role {
        self.kind.role()
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self.kind, NodeKind::Sentinel)
    }

    pub fn is_fork(&self) -> bool {
        self.children.len() > 1
    }

    pub fn response_set(&self) -> Option<&ResponseSet> {
        match &self.kind {
            NodeKind::Responses(set) => Some(set),
            _ => None,
        }
    }

    /// Effective content: the turn's text, or the accepted item's text for a response set.
    pub fn content(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Sentinel => None,
            NodeKind::System(turn) | NodeKind::User(turn) | NodeKind::Assistant(turn) => {
                Some(turn.content.as_str())
            }
            NodeKind::Responses(set) => set.accepted_item().map(|item| item.content.as_str()),
        }
    }

    pub fn tokens(&self) -> u32 {
        match &self.kind {
            NodeKind::Sentinel => 0,
            NodeKind::System(turn) | NodeKind::User(turn) | NodeKind::Assistant(turn) => turn.tokens,
            NodeKind::Responses(set) => set.accepted_item().map_or(0, |item| item.tokens),
        }
    }

    /// Whether materialization should emit a message for this node.
    pub fn is_available_in_context(&self) -> bool {
        match &self.kind {
            NodeKind::Sentinel => false,
            NodeKind::System(turn) | NodeKind::User(turn) | NodeKind::Assistant(turn) => {
                !turn.content.trim().is_empty()
            }
            NodeKind::Responses(set) => set.is_available_in_context(),
        }
    }

    /// True while any alternative of this turn is still streaming.
    pub fn is_responding(&self) -> bool {
        self.response_set().is_some_and(ResponseSet::is_responding)
    }
}
