//! Error types for tree mutation, materialization and persistence.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("response item {item_id} not found in node {node_id}")]
    ItemNotFound { node_id: Uuid, item_id: Uuid },

    #[error("node {0} is not a response set")]
    NotAResponseSet(Uuid),

    #[error("the root sentinel cannot be modified or removed")]
    SentinelImmutable,

    #[error("a response set must hold at least one item")]
    EmptyResponseSet,

    #[error("cannot remove {0}: it is the last item of its response set")]
    LastResponseItem(Uuid),

    #[error("accepted index {index} is out of range for {len} items")]
    AcceptedIndexOutOfRange { index: usize, len: usize },

    #[error("appending {child} under {parent} would create a cycle")]
    WouldCreateCycle { parent: Uuid, child: Uuid },

    #[error("ancestor chain of {0} revisits a node; the tree is corrupted")]
    CyclicAncestry(Uuid),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TreeError>;

impl TreeError {
    /// Attach the owning node to item-level errors raised by a detached response set.
    pub(crate) fn in_node(self, node_id: Uuid) -> Self {
        match self {
            TreeError::ItemNotFound { item_id, .. } => TreeError::ItemNotFound { node_id, item_id },
            other => other,
        }
    }
}
