//! Serializable form of a [`DialogTree`] and file-backed storage for it.
//!
//! A snapshot lists the attached nodes depth-first with their parent id, so
//! structure and child order are rebuilt by replaying the records in order.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::error::{Result, TreeError};
use crate::node::{DialogNode, NodeKind};
use crate::tree::DialogTree;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Error recorded on items that were still streaming when the snapshot was taken.
pub const UNFINISHED_ON_LOAD: &str = "response was still streaming when the conversation was saved";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NodeRecord {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub turn: NodeKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TreeSnapshot {
    pub version: u32,
    pub root_id: Uuid,
    pub active_leaf: Uuid,
    pub saved_at: DateTime<Utc>,
    pub nodes: Vec<NodeRecord>,
}

impl DialogTree {
    /// Captures every node reachable from the root. Detached subtrees are not saved.
    pub fn to_snapshot(&self) -> TreeSnapshot {
        let nodes = self
            .iter_depth_first()
            .map(|node| NodeRecord {
                id: node.id(),
                parent_id: node.parent_id(),
                turn: node.kind().clone(),
                created_at: node.created_at(),
            })
            .collect();

        let active_leaf = if self.is_attached(self.active_leaf()).unwrap_or(false) {
            self.active_leaf()
        } else {
            self.root_id()
        };

        TreeSnapshot {
            version: SNAPSHOT_VERSION,
            root_id: self.root_id(),
            active_leaf,
            saved_at: Utc::now(),
            nodes,
        }
    }

    /// Validates a snapshot and rebuilds parent/child links and the active leaf.
    pub fn from_snapshot(snapshot: TreeSnapshot) -> Result<Self> {
        let invalid = |reason: String| {
            tracing::error!(%reason, "DialogTree: rejecting snapshot");
            TreeError::InvalidSnapshot(reason)
        };

        if snapshot.version > SNAPSHOT_VERSION {
            return Err(invalid(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let mut records = snapshot.nodes.into_iter();
        let root = records
            .next()
            .ok_or_else(|| invalid("snapshot has no nodes".to_string()))?;
        if root.id != snapshot.root_id
            || root.parent_id.is_some()
            || !matches!(root.turn, NodeKind::Sentinel)
        {
            return Err(invalid(
                "first record must be the parentless sentinel root".to_string(),
            ));
        }

        let mut nodes: HashMap<Uuid, DialogNode> = HashMap::new();
        nodes.insert(
            root.id,
            DialogNode {
                id: root.id,
                parent_id: None,
                children: Vec::new(),
                kind: NodeKind::Sentinel,
                created_at: root.created_at,
            },
        );

        let mut seen = HashSet::from([root.id]);
        for mut record in records {
            if !seen.insert(record.id) {
                return Err(invalid(format!("duplicate node id {}", record.id)));
            }
            match &record.turn {
                NodeKind::Sentinel => {
                    return Err(invalid(format!("unexpected second sentinel {}", record.id)))
                }
                NodeKind::Responses(set) => {
                    set.validate()
                        .map_err(|reason| invalid(format!("node {}: {reason}", record.id)))?;
                }
                _ => {}
            }
            // nothing can finish a stream across a reload
            if let NodeKind::Responses(set) = &mut record.turn {
                let settled = set.settle_responding(UNFINISHED_ON_LOAD);
                if settled > 0 {
                    tracing::warn!(node = %record.id, settled, "DialogTree: settled unfinished responses");
                }
            }
            let parent_id = record
                .parent_id
                .ok_or_else(|| invalid(format!("node {} has no parent", record.id)))?;
            let parent = nodes.get_mut(&parent_id).ok_or_else(|| {
                invalid(format!(
                    "node {} references unknown or later parent {parent_id}",
                    record.id
                ))
            })?;
            parent.children.push(record.id);
            nodes.insert(
                record.id,
                DialogNode {
                    id: record.id,
                    parent_id: Some(parent_id),
                    children: Vec::new(),
                    kind: record.turn,
                    created_at: record.created_at,
                },
            );
        }

        let active_leaf = if nodes.contains_key(&snapshot.active_leaf) {
            snapshot.active_leaf
        } else {
            tracing::warn!(
                active_leaf = %snapshot.active_leaf,
                "DialogTree: saved active leaf missing, falling back to root"
            );
            snapshot.root_id
        };

        tracing::debug!(nodes = nodes.len(), "DialogTree: restored from snapshot");
        Ok(DialogTree::from_parts(snapshot.root_id, nodes, active_leaf))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_snapshot())?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: TreeSnapshot = serde_json::from_str(json)?;
        Self::from_snapshot(snapshot)
    }
}

/// Persistence seam for conversation trees.
#[async_trait]
pub trait TreeStorage: Send + Sync {
    async fn save_tree(&self, conversation_id: &str, tree: &DialogTree) -> Result<()>;

    async fn load_tree(&self, conversation_id: &str) -> Result<DialogTree>;

    async fn tree_exists(&self, conversation_id: &str) -> bool;

    /// Returns `true` if something was deleted.
    async fn delete_tree(&self, conversation_id: &str) -> Result<bool>;

    async fn list_trees(&self) -> Result<Vec<String>>;
}

/// One pretty-printed JSON file per conversation.
#[derive(Debug, Clone)]
pub struct JsonFileTreeStorage {
    base_path: PathBuf,
}

impl JsonFileTreeStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn tree_path(&self, conversation_id: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", conversation_id))
    }
}

#[async_trait]
impl TreeStorage for JsonFileTreeStorage {
    async fn save_tree(&self, conversation_id: &str, tree: &DialogTree) -> Result<()> {
        fs::create_dir_all(&self.base_path).await?;
        let contents = tree.to_json()?;
        fs::write(self.tree_path(conversation_id), contents).await?;
        tracing::debug!(conversation_id, nodes = tree.len(), "JsonFileTreeStorage: saved");
        Ok(())
    }

    async fn load_tree(&self, conversation_id: &str) -> Result<DialogTree> {
        let path = self.tree_path(conversation_id);
        if !path.exists() {
            return Err(TreeError::ConversationNotFound(conversation_id.to_string()));
        }
        let contents = fs::read_to_string(&path).await?;
        DialogTree::from_json(&contents)
    }

    async fn tree_exists(&self, conversation_id: &str) -> bool {
        self.tree_path(conversation_id).exists()
    }

    async fn delete_tree(&self, conversation_id: &str) -> Result<bool> {
        match fs::remove_file(self.tree_path(conversation_id)).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn list_trees(&self) -> Result<Vec<String>> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.base_path).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
