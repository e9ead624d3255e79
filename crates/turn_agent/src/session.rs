//! Session orchestration: user input and regenerations turned into tree updates.
//!
//! The tree lives behind a `tokio::sync::RwLock`. Every access goes through
//! [`ChatSession::with_tree`] or a short read guard, so no guard is ever held
//! while a backend call is awaited. Each in-flight response item owns a
//! cancellation token that is a child of the session token.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dialog_core::{
    ContextMaterializer, DialogContext, DialogTree, ItemCompletion, SessionConfig, TreeError,
    TreeStorage, Usage,
};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{TurnAgent, TurnCompletion};
use crate::backend::ChatBackend;
use crate::config::AgentConfig;
use crate::error::{Result, TurnError};
use crate::events::TurnEvent;

/// A turn that landed in the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub node_id: Uuid,
    pub item_id: Uuid,
    pub content: String,
    pub usage: Usage,
    pub attempts: u32,
    pub latency: Duration,
}

/// A [`TurnEvent`] tagged with the response item it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemTurnEvent {
    pub node_id: Uuid,
    pub item_id: Uuid,
    pub event: TurnEvent,
}

pub struct ChatSession {
    id: String,
    tree: Arc<RwLock<DialogTree>>,
    config: SessionConfig,
    materializer: ContextMaterializer,
    default_backend: String,
    backends: DashMap<String, Arc<dyn ChatBackend>>,
    in_flight: DashMap<Uuid, CancellationToken>,
    shutdown: CancellationToken,
    observer: Option<mpsc::UnboundedSender<ItemTurnEvent>>,
}

impl ChatSession {
    pub fn new(
        id: impl Into<String>,
        tree: DialogTree,
        config: SessionConfig,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        let default_backend = backend.name().to_string();
        let backends = DashMap::new();
        backends.insert(default_backend.clone(), backend);
        Self {
            id: id.into(),
            tree: Arc::new(RwLock::new(tree)),
            materializer: ContextMaterializer::from_config(&config),
            config,
            default_backend,
            backends,
            in_flight: DashMap::new(),
            shutdown: CancellationToken::new(),
            observer: None,
        }
    }

    /// Loads the conversation `id` from `storage`.
    pub async fn load(
        id: impl Into<String>,
        storage: &dyn TreeStorage,
        config: SessionConfig,
        backend: Arc<dyn ChatBackend>,
    ) -> Result<Self> {
        let id = id.into();
        let tree = storage.load_tree(&id).await?;
        Ok(Self::new(id, tree, config, backend))
    }

    /// Forward every turn event, tagged with its item, to `observer`.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<ItemTurnEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn register_backend(&self, backend: Arc<dyn ChatBackend>) {
        log::debug!("[{}] Registered backend '{}'", self.id, backend.name());
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Shared handle for readers such as layout and navigation.
    pub fn tree(&self) -> Arc<RwLock<DialogTree>> {
        Arc::clone(&self.tree)
    }

    pub async fn with_tree<R>(&self, f: impl FnOnce(&mut DialogTree) -> R) -> R {
        let mut tree = self.tree.write().await;
        f(&mut tree)
    }

    pub async fn materialize_active(&self) -> Result<DialogContext> {
        let tree = self.tree.read().await;
        Ok(self.materializer.materialize_active(&tree)?)
    }

    pub async fn save(&self, storage: &dyn TreeStorage) -> Result<()> {
        let copy = {
            let tree = self.tree.read().await;
            DialogTree::from_snapshot(tree.to_snapshot())?
        };
        storage.save_tree(&self.id, &copy).await?;
        Ok(())
    }

    fn backend(&self, name: &str) -> Result<Arc<dyn ChatBackend>> {
        self.backends
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TurnError::UnknownBackend(name.to_string()))
    }

    /// Appends `content` as a user turn under the active leaf and answers it
    /// with the default backend.
    pub async fn submit_user_message(&self, content: impl Into<String>) -> Result<TurnReport> {
        let backend = self.backend(&self.default_backend)?;
        let content = content.into();

        let (node_id, item_id, context) = self
            .with_tree(|tree| -> Result<_> {
                let user_id = tree.add_user_message(tree.active_leaf(), content)?;
                tree.set_active_leaf(user_id)?;
                let (node_id, item_id) = tree.add_response_set(user_id, backend.name())?;
                let context = self.materializer.materialize(tree, user_id)?;
                Ok((node_id, item_id, context))
            })
            .await?;

        let result = self.run_item(node_id, item_id, backend, context).await;
        if !matches!(result, Err(TurnError::Cancelled { .. }) | Err(TurnError::Tree(_))) {
            self.with_tree(|tree| -> Result<()> {
                if tree.contains(node_id) {
                    tree.set_active_leaf(node_id)?;
                }
                Ok(())
            })
            .await?;
        }
        result
    }

    /// Adds one alternative to the response set `node_id` from the default backend.
    pub async fn regenerate(&self, node_id: Uuid) -> Result<TurnReport> {
        let mut results = self
            .regenerate_parallel(node_id, &[self.default_backend.as_str()])
            .await?;
        results
            .pop()
            .unwrap_or_else(|| Err(TurnError::UnknownBackend(self.default_backend.clone())))
    }

    /// Starts one alternative per backend and runs them concurrently. Each item
    /// can be cancelled on its own with [`ChatSession::cancel_item`].
    pub async fn regenerate_parallel(
        &self,
        node_id: Uuid,
        backend_names: &[&str],
    ) -> Result<Vec<Result<TurnReport>>> {
        let backends = backend_names
            .iter()
            .map(|name| self.backend(name))
            .collect::<Result<Vec<_>>>()?;

        let (items, context) = self
            .with_tree(|tree| -> Result<_> {
                tree.response_set(node_id)?;
                let parent = tree
                    .parent(node_id)?
                    .ok_or(TurnError::NothingToAnswer(node_id))?;
                let context = self.materializer.materialize(tree, parent)?;
                let mut items = Vec::with_capacity(backends.len());
                for backend in &backends {
                    items.push(tree.begin_response_item(node_id, backend.name())?);
                }
                Ok((items, context))
            })
            .await?;

        log::info!(
            "[{}] Regenerating node {} with {} backend(s)",
            self.id,
            node_id,
            backends.len()
        );

        let runs = items
            .into_iter()
            .zip(backends)
            .map(|(item_id, backend)| self.run_item(node_id, item_id, backend, context.clone()));
        Ok(join_all(runs).await)
    }

    /// Regenerates `item_id` as a new alternative from the backend that produced it.
    pub async fn retry_item(&self, node_id: Uuid, item_id: Uuid) -> Result<TurnReport> {
        let name = {
            let tree = self.tree.read().await;
            tree.response_set(node_id)?
                .item(item_id)
                .map(|item| item.backend.clone())
                .ok_or(TreeError::ItemNotFound { node_id, item_id })?
        };
        let backend = self.backend(&name)?;

        let (new_item, context) = self
            .with_tree(|tree| -> Result<_> {
                let parent = tree
                    .parent(node_id)?
                    .ok_or(TurnError::NothingToAnswer(node_id))?;
                let context = self.materializer.materialize(tree, parent)?;
                let new_item = tree.retry_response_item(node_id, item_id)?;
                Ok((new_item, context))
            })
            .await?;

        self.run_item(node_id, new_item, backend, context).await
    }

    pub async fn accept(&self, node_id: Uuid, index: usize) -> Result<()> {
        self.with_tree(|tree| tree.accept_response(node_id, index))
            .await?;
        Ok(())
    }

    /// Returns `false` when the item is not in flight.
    pub fn cancel_item(&self, item_id: Uuid) -> bool {
        match self.in_flight.get(&item_id) {
            Some(token) => {
                log::info!("[{}] Cancelling item {}", self.id, item_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    pub fn in_flight_items(&self) -> Vec<Uuid> {
        self.in_flight.iter().map(|entry| *entry.key()).collect()
    }

    async fn run_item(
        &self,
        node_id: Uuid,
        item_id: Uuid,
        backend: Arc<dyn ChatBackend>,
        context: DialogContext,
    ) -> Result<TurnReport> {
        let cancel = self.shutdown.child_token();
        self.in_flight.insert(item_id, cancel.clone());

        let agent = TurnAgent::new(backend, AgentConfig::from(&self.config))
            .with_session_id(self.id.clone());
        let (event_tx, event_rx) = mpsc::channel(64);

        let (result, ()) = tokio::join!(
            agent.run_with_events(&context, &cancel, event_tx),
            self.stream_into_tree(node_id, item_id, event_rx),
        );

        self.in_flight.remove(&item_id);
        self.finish_item(node_id, item_id, result).await
    }

    async fn stream_into_tree(
        &self,
        node_id: Uuid,
        item_id: Uuid,
        mut event_rx: mpsc::Receiver<TurnEvent>,
    ) {
        while let Some(event) = event_rx.recv().await {
            let applied = match &event {
                TurnEvent::AttemptStarted { attempt, .. } if *attempt > 1 => {
                    self.with_tree(|tree| tree.restart_response_item(node_id, item_id))
                        .await
                }
                TurnEvent::Delta { content, .. } => {
                    self.with_tree(|tree| tree.append_response_delta(node_id, item_id, content))
                        .await
                }
                _ => Ok(()),
            };
            if let Err(error) = applied {
                log::warn!(
                    "[{}] Dropping stream update for item {}: {}",
                    self.id,
                    item_id,
                    error
                );
            }
            if let Some(observer) = &self.observer {
                let _ = observer.send(ItemTurnEvent {
                    node_id,
                    item_id,
                    event,
                });
            }
        }
    }

    /// Records the outcome on the item. Failures stay visible on the item;
    /// cancellations remove it, and the whole turn when it was the only item.
    async fn finish_item(
        &self,
        node_id: Uuid,
        item_id: Uuid,
        result: Result<TurnCompletion>,
    ) -> Result<TurnReport> {
        match result {
            Ok(completion) => {
                let tokens = (completion.attempt_usage.completion_tokens > 0)
                    .then_some(completion.attempt_usage.completion_tokens);
                let item = ItemCompletion {
                    content: completion.content.clone(),
                    tokens,
                    usage: completion.usage,
                    latency_ms: completion.latency.as_millis() as u64,
                    finish_reason: completion.finish_reason.clone(),
                };
                let recorded = self
                    .with_tree(|tree| tree.complete_response_item(node_id, item_id, item))
                    .await;
                self.tolerate_discarded(node_id, item_id, recorded)?;
                Ok(TurnReport {
                    node_id,
                    item_id,
                    content: completion.content,
                    usage: completion.usage,
                    attempts: completion.attempts,
                    latency: completion.latency,
                })
            }
            Err(error @ TurnError::Exhausted { .. }) => {
                let message = error.to_string();
                let usage = error.usage().unwrap_or_default();
                let recorded = self
                    .with_tree(|tree| tree.fail_response_item(node_id, item_id, message, usage))
                    .await;
                self.tolerate_discarded(node_id, item_id, recorded)?;
                Err(error)
            }
            Err(error @ TurnError::Cancelled { .. }) => {
                let discarded = self
                    .with_tree(|tree| -> std::result::Result<(), TreeError> {
                        let set = tree.response_set(node_id)?;
                        if set.item(item_id).is_none() {
                            return Err(TreeError::ItemNotFound { node_id, item_id });
                        }
                        if set.len() > 1 {
                            tree.remove_response_item(node_id, item_id)?;
                        } else {
                            tree.delete_subtree(node_id)?;
                        }
                        Ok(())
                    })
                    .await;
                self.tolerate_discarded(node_id, item_id, discarded)?;
                log::debug!("[{}] Discarded cancelled item {}", self.id, item_id);
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// A node or item deleted while its turn ran has nothing left to record.
    fn tolerate_discarded(
        &self,
        node_id: Uuid,
        item_id: Uuid,
        recorded: std::result::Result<(), TreeError>,
    ) -> Result<()> {
        match recorded {
            Err(TreeError::NodeNotFound(id)) if id == node_id => {}
            Err(TreeError::ItemNotFound { item_id: id, .. }) if id == item_id => {}
            other => return other.map_err(TurnError::from),
        }
        log::debug!(
            "[{}] Item {} was removed from the tree before its turn finished",
            self.id,
            item_id
        );
        Ok(())
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
