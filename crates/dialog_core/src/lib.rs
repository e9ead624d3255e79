//! dialog_core - the branching conversation engine.
//!
//! - `tree` - DialogTree, the node pool with parent/child links and the active leaf
//! - `node` - DialogNode and the closed set of turn kinds
//! - `response` - ResponseSet, alternative completions for one assistant turn
//! - `materialize` - ContextMaterializer, root-to-leaf path to linear history
//! - `events` - TreeEvent notifications for renderers
//! - `persistence` - snapshots and file storage
//! - `config` - session-level settings

pub mod config;
pub mod error;
pub mod events;
pub mod materialize;
pub mod node;
pub mod persistence;
pub mod response;
pub mod tree;

pub use config::{SessionConfig, DEFAULT_RETRY_COUNT};
pub use error::{Result, TreeError};
pub use events::TreeEvent;
pub use materialize::{ContextMaterializer, ContextMessage, DialogContext};
pub use node::{estimate_tokens, DialogNode, NodeKind, Role, TextTurn};
pub use persistence::{
    JsonFileTreeStorage, NodeRecord, TreeSnapshot, TreeStorage, SNAPSHOT_VERSION,
    UNFINISHED_ON_LOAD,
};
pub use response::{
    ItemCompletion, ItemRemoval, ResponseComparison, ResponseItem, ResponseSet, Usage,
};
pub use tree::DialogTree;
