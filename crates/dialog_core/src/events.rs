//! Structural change notifications published by [`crate::DialogTree`].
//!
//! Events are delivered on the mutating call path, right after the mutation,
//! so a subscriber that drains its receiver after a call observes every change
//! that call made.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeEvent {
    ChildAdded {
        parent_id: Uuid,
        child_id: Uuid,
        index: usize,
    },
    ChildRemoved {
        parent_id: Uuid,
        child_id: Uuid,
    },
    ForkChanged {
        node_id: Uuid,
        is_fork: bool,
        child_count: usize,
    },
    /// A node left the tree, either directly or as part of a cascading delete.
    NodeDeleted {
        node_id: Uuid,
    },
    AcceptedChanged {
        node_id: Uuid,
        index: usize,
    },
    ItemAdded {
        node_id: Uuid,
        item_id: Uuid,
        index: usize,
    },
    ItemRemoved {
        node_id: Uuid,
        item_id: Uuid,
        index: usize,
    },
    ItemUpdated {
        node_id: Uuid,
        item_id: Uuid,
    },
    ActiveLeafChanged {
        previous: Uuid,
        current: Uuid,
    },
}

/// Fan-out of tree events to any number of subscribers.
#[derive(Debug, Default)]
pub(crate) struct EventHub {
    subscribers: Vec<mpsc::UnboundedSender<TreeEvent>>,
}

impl EventHub {
    pub(crate) fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TreeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub(crate) fn publish(&mut self, event: TreeEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        tracing::trace!(?event, "DialogTree: publishing event");
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
