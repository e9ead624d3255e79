//! dialog_graph - visual layout and browsing for conversation trees.
//!
//! The layout keeps the first child of every node in its parent's column (the
//! main branch) and opens new columns to the right for forks. The navigator
//! flattens the tree in the same order and owns the selection that becomes the
//! tree's active leaf.

use dialog_core::DialogNode;

pub mod error;
pub mod layout;
pub mod navigator;

pub use error::{GraphError, Result};
pub use layout::{
    Connector, ConnectorKind, GraphLayout, GraphLayoutEngine, LayoutOptions, Point,
    PositionedNode,
};
pub use navigator::{GraphNavigator, NavEntry, ResponseDeletion};

const LABEL_CHARS: usize = 40;

/// Short display text for a node; response sets show which alternative is accepted.
pub(crate) fn describe(node: &DialogNode) -> String {
    let text = node_label(node.content().unwrap_or(""), LABEL_CHARS);
    match node.response_set() {
        Some(set) if set.len() > 1 => {
            let accepted = set.accepted_index().unwrap_or(0) + 1;
            format!("{text} [{accepted}/{}]", set.len())
        }
        _ => text,
    }
}

/// First line of `content`, shortened to `max` characters.
pub(crate) fn node_label(content: &str, max: usize) -> String {
    let line = content.trim().lines().next().unwrap_or("");
    if line.chars().count() <= max {
        line.to_string()
    } else {
        format!("{}...", line.chars().take(max).collect::<String>())
    }
}
