//! Application root: intent dispatch and change notifications
//!
//! A `Session` wires the store, coordinator, resolver, selection and layout
//! engine together for one client. The rendering side sends `Intent`s through
//! [`Session::dispatch`] and subscribes to `SessionEvent`s; it never reaches
//! into the components directly.

use crate::auth::AuthProvider;
use crate::backend::*;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult, ErrorOrigin};
use crate::mutation::{MutationCoordinator, MutationOutcome};
use crate::pending::OperationKind;
use crate::providers::create_backend;
use crate::retry::RetryPolicy;
use crate::shape::ShapeResolver;
use crate::store::GraphStore;
use lineage_core::{
    DiffEngine, Edge, GraphDiff, GraphSnapshot, LayoutEngine, Node, NodeId, Position, SelectionManager,
    Shape, WorkspaceId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};

const EVENT_CAPACITY: usize = 256;

fn default_page() -> u32 {
    1
}

fn stale(node_id: NodeId) -> IntentOutcome {
    tracing::debug!("Ignoring intent for missing node {}", node_id);
    IntentOutcome::Skipped(ClientError::StaleReference { node_id })
}

/// Requests emitted by the rendering collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    ToggleSelect { node_id: NodeId },
    SetSelection { node_ids: Vec<NodeId> },
    ClearSelection,
    /// Make a node the current node and load a page of its rows.
    OpenNode {
        node_id: NodeId,
        #[serde(default = "default_page")]
        page: u32,
    },
    RequestResolveShape { node_id: NodeId },
    RequestRename { node_id: NodeId, new_name: String },
    RequestDelete { node_id: NodeId },
    RequestConvert { node_id: NodeId, target: ConvertTarget },
    RequestCast { node_id: NodeId, spec: CastSpec },
    RequestFilter { node_id: NodeId, spec: FilterSpec },
    RequestSlice { node_id: NodeId, spec: SliceSpec },
    RequestJoin { spec: JoinSpec },
    /// Join the first two selected nodes.
    RequestJoinSelected {
        left_on: String,
        #[serde(default)]
        right_on: Option<String>,
        #[serde(default)]
        how: JoinHow,
        #[serde(default)]
        new_node_name: Option<String>,
    },
    RequestDetach { node_id: NodeId, spec: DetachSpec },
    RequestCreateFromFile { filename: String },
}

/// What handling an intent produced for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum IntentOutcome {
    Selection(Vec<NodeId>),
    /// `page` is `None` when the cursor moved before the rows arrived.
    Opened { node_id: NodeId, page: Option<Arc<NodePage>> },
    Shape { node_id: NodeId, shape: Shape },
    Mutation(MutationOutcome),
    /// Nothing done: the node is no longer in the graph. Carries the `StaleReference` error.
    Skipped(ClientError),
}

/// Published on the session's broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    GraphChanged(GraphDiff),
    SelectionChanged(Vec<NodeId>),
    CurrentNodeChanged(Option<NodeId>),
    ShapeResolved { node_id: NodeId, shape: Shape },
    /// Transient; the node keeps an unresolved row count.
    ShapeFailed { node_id: NodeId, error: ClientError },
    MutationApplied { kind: OperationKind, receipt: MutationReceipt },
    MutationSkipped { kind: OperationKind, error: ClientError },
    MutationFailed { kind: OperationKind, error: ClientError },
    WorkspaceSwitched(WorkspaceId),
    Notice(String),
}

/// Everything the renderer needs for one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphView {
    pub workspace_id: WorkspaceId,
    /// Nodes with any resolved row count merged into their shape.
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub positions: BTreeMap<NodeId, Position>,
    pub ranks: BTreeMap<NodeId, u32>,
    pub selected_ids: Vec<NodeId>,
    pub current_node: Option<NodeId>,
}

/// Last snapshot the session announced, for diffing.
struct Mirror {
    diff: DiffEngine,
    last: Option<Arc<GraphSnapshot>>,
}

pub struct Session {
    store: Arc<GraphStore>,
    coordinator: MutationCoordinator,
    resolver: Arc<ShapeResolver>,
    selection: Arc<RwLock<SelectionManager>>,
    layout: Mutex<LayoutEngine>,
    mirror: Mutex<Mirror>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl Session {
    pub fn new(backend: Arc<dyn WorkspaceBackend>, auth: Arc<dyn AuthProvider>, config: &ClientConfig) -> Self {
        let store = Arc::new(GraphStore::new(backend.clone(), auth.clone(), config));
        let resolver = Arc::new(ShapeResolver::new(backend, auth, RetryPolicy::reads(&config.retry)));
        let selection = Arc::new(RwLock::new(SelectionManager::new()));
        let coordinator = MutationCoordinator::new(
            store.clone(),
            resolver.clone(),
            selection.clone(),
            RetryPolicy::mutations(&config.retry),
        );
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            store,
            coordinator,
            resolver,
            selection,
            layout: Mutex::new(LayoutEngine::new(config.layout.clone())),
            mirror: Mutex::new(Mirror {
                diff: DiffEngine::new(),
                last: None,
            }),
            event_tx,
        }
    }

    /// Build a session over the named backend kind (`http` or `local`).
    pub fn connect(kind: &str, config: &ClientConfig, auth: Arc<dyn AuthProvider>) -> ClientResult<Self> {
        let backend = create_backend(kind, config, auth.clone())?;
        tracing::info!("Using {} backend", backend.name());
        Ok(Self::new(backend, auth, config))
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    pub fn resolver(&self) -> &Arc<ShapeResolver> {
        &self.resolver
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    /// Attach to the backend's current workspace, or the first one listed.
    pub async fn open(&self) -> ClientResult<WorkspaceId> {
        let workspace = match self.store.current_workspace().await? {
            Some(workspace) => workspace,
            None => self
                .store
                .workspaces()
                .await?
                .first()
                .map(|w| w.workspace_id.clone())
                .ok_or_else(|| ClientError::Validation("No workspaces available".to_string()))?,
        };
        self.attach(workspace.clone()).await?;
        Ok(workspace)
    }

    /// Make `workspace` active without touching the backend's current pointer.
    pub async fn attach(&self, workspace: WorkspaceId) -> ClientResult<Arc<GraphSnapshot>> {
        tracing::info!("Attaching to workspace {}", workspace);
        self.store.attach(workspace).await;
        self.refresh().await
    }

    pub async fn switch_workspace(&self, workspace: &WorkspaceId) -> ClientResult<Arc<GraphSnapshot>> {
        let before = self.selected_ids().await;
        self.store.switch_workspace(workspace).await?;
        self.resolver.clear();
        self.selection.write().await.clear();
        self.layout.lock().await.reset();
        {
            let mut mirror = self.mirror.lock().await;
            mirror.last = None;
        }
        self.publish(SessionEvent::WorkspaceSwitched(workspace.clone()));
        let snapshot = self.sync().await;
        self.publish_selection_if_changed(&before).await;
        snapshot
    }

    pub async fn selected_ids(&self) -> Vec<NodeId> {
        self.selection.read().await.ids().to_vec()
    }

    /// Load the active graph and announce what changed since the last load.
    pub async fn refresh(&self) -> ClientResult<Arc<GraphSnapshot>> {
        let before = self.selected_ids().await;
        let snapshot = self.sync().await;
        self.publish_selection_if_changed(&before).await;
        snapshot
    }

    async fn sync(&self) -> ClientResult<Arc<GraphSnapshot>> {
        let workspace = self.store.require_active_workspace().await?;
        let snapshot = self.store.load(&workspace).await?;

        let diff = {
            let mut guard = self.mirror.lock().await;
            let mirror = &mut *guard;
            if mirror.last.as_ref().is_some_and(|last| Arc::ptr_eq(last, &snapshot)) {
                None
            } else {
                let diff = mirror.diff.compute_diff(mirror.last.as_deref(), &snapshot);
                mirror.last = Some(snapshot.clone());
                Some(diff)
            }
        };
        if let Some(diff) = diff.filter(|d| !d.is_empty()) {
            tracing::debug!(
                "Graph diff #{}: +{} -{} ~{} nodes",
                diff.sequence,
                diff.added_nodes.len(),
                diff.removed_nodes.len(),
                diff.modified_nodes.len()
            );
            self.publish(SessionEvent::GraphChanged(diff));
        }

        let removed = self
            .selection
            .write()
            .await
            .retain_known(snapshot.nodes.iter().map(|n| &n.id));
        if !removed.is_empty() {
            tracing::debug!("Pruned {} missing node(s) from the selection", removed.len());
        }
        if let Some(current) = self.store.current_node().await {
            if !snapshot.contains(&current) && self.store.clear_current_node_if(&current).await {
                self.publish(SessionEvent::CurrentNodeChanged(None));
            }
        }
        Ok(snapshot)
    }

    async fn publish_selection_if_changed(&self, before: &[NodeId]) {
        let after = self.selected_ids().await;
        if after.as_slice() != before {
            self.publish(SessionEvent::SelectionChanged(after));
        }
    }

    /// Nodes, edges, positions and selection of the active workspace. The
    /// selection is re-synced against the snapshot first.
    pub async fn view(&self) -> ClientResult<GraphView> {
        let snapshot = self.refresh().await?;
        let layout = self.layout.lock().await.layout(&snapshot);
        let nodes = snapshot
            .nodes
            .iter()
            .map(|node| {
                let mut node = node.clone();
                node.shape = self.resolver.effective_shape(&node);
                node
            })
            .collect();

        Ok(GraphView {
            workspace_id: snapshot.workspace_id.clone(),
            nodes,
            edges: snapshot.edges.clone(),
            positions: layout.positions.clone(),
            ranks: layout.ranks.clone(),
            selected_ids: self.selected_ids().await,
            current_node: self.store.current_node().await,
        })
    }

    pub async fn dispatch(&self, intent: Intent) -> ClientResult<IntentOutcome> {
        tracing::debug!("Intent: {:?}", intent);
        let before = self.selected_ids().await;
        let outcome = self.handle(intent).await;
        self.publish_selection_if_changed(&before).await;
        outcome
    }

    async fn handle(&self, intent: Intent) -> ClientResult<IntentOutcome> {
        let coordinator = &self.coordinator;
        match intent {
            Intent::ToggleSelect { node_id } => {
                let snapshot = self.sync().await?;
                if !snapshot.contains(&node_id) {
                    return Ok(stale(node_id));
                }
                self.selection.write().await.toggle(node_id);
                Ok(IntentOutcome::Selection(self.selected_ids().await))
            }
            Intent::SetSelection { node_ids } => {
                let snapshot = self.sync().await?;
                let known = node_ids.into_iter().filter(|id| snapshot.contains(id));
                self.selection.write().await.set_all(known);
                Ok(IntentOutcome::Selection(self.selected_ids().await))
            }
            Intent::ClearSelection => {
                self.selection.write().await.clear();
                Ok(IntentOutcome::Selection(Vec::new()))
            }
            Intent::OpenNode { node_id, page } => {
                let snapshot = self.sync().await?;
                if !snapshot.contains(&node_id) {
                    return Ok(stale(node_id));
                }
                if self.store.current_node().await.as_ref() != Some(&node_id) {
                    self.store.set_current_node(Some(node_id.clone())).await;
                    self.publish(SessionEvent::CurrentNodeChanged(Some(node_id.clone())));
                }
                let page = self.store.current_node_data(page).await?;
                Ok(IntentOutcome::Opened { node_id, page })
            }
            Intent::RequestResolveShape { node_id } => self.resolve_shape(node_id).await,
            Intent::RequestRename { node_id, new_name } => {
                let result = coordinator.rename(&node_id, &new_name).await;
                self.finish(OperationKind::Rename, result).await
            }
            Intent::RequestDelete { node_id } => {
                let result = coordinator.delete(&node_id).await;
                self.finish(OperationKind::Delete, result).await
            }
            Intent::RequestConvert { node_id, target } => {
                let result = coordinator.convert(&node_id, target).await;
                self.finish(OperationKind::Convert, result).await
            }
            Intent::RequestCast { node_id, spec } => {
                let result = coordinator.cast(&node_id, spec).await;
                self.finish(OperationKind::Cast, result).await
            }
            Intent::RequestFilter { node_id, spec } => {
                let result = coordinator.filter(&node_id, spec).await;
                self.finish(OperationKind::Filter, result).await
            }
            Intent::RequestSlice { node_id, spec } => {
                let result = coordinator.slice(&node_id, spec).await;
                self.finish(OperationKind::Slice, result).await
            }
            Intent::RequestJoin { spec } => {
                let result = coordinator.join(spec).await;
                self.finish(OperationKind::Join, result).await
            }
            Intent::RequestJoinSelected {
                left_on,
                right_on,
                how,
                new_node_name,
            } => {
                let Some(pair) = self.selection.read().await.first_two() else {
                    return Err(ClientError::Validation("Select two nodes to join".to_string()));
                };
                if pair.truncated {
                    self.publish(SessionEvent::Notice(
                        "More than two nodes are selected; only the first two are joined".to_string(),
                    ));
                }
                let spec = JoinSpec {
                    left: pair.left,
                    right: pair.right,
                    right_on: right_on.unwrap_or_else(|| left_on.clone()),
                    left_on,
                    how,
                    new_node_name,
                };
                let result = coordinator.join(spec).await;
                self.finish(OperationKind::Join, result).await
            }
            Intent::RequestDetach { node_id, spec } => {
                let result = coordinator.detach_concordance(&node_id, spec).await;
                self.finish(OperationKind::ConcordanceDetach, result).await
            }
            Intent::RequestCreateFromFile { filename } => {
                let result = coordinator.create_node_from_file(&filename).await;
                self.finish(OperationKind::CreateFromFile, result).await
            }
        }
    }

    async fn resolve_shape(&self, node_id: NodeId) -> ClientResult<IntentOutcome> {
        let workspace = self.store.require_active_workspace().await?;
        let snapshot = self.store.load(&workspace).await?;
        let Some(node) = snapshot.node(&node_id) else {
            return Ok(stale(node_id));
        };
        match self.resolver.resolve(&workspace, node).await {
            Ok(shape) => {
                self.publish(SessionEvent::ShapeResolved {
                    node_id: node_id.clone(),
                    shape,
                });
                Ok(IntentOutcome::Shape { node_id, shape })
            }
            Err(error) => {
                self.publish(SessionEvent::ShapeFailed {
                    node_id,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Announce a mutation result and pull the refreshed graph on success.
    async fn finish(
        &self,
        kind: OperationKind,
        result: ClientResult<MutationOutcome>,
    ) -> ClientResult<IntentOutcome> {
        match result {
            Ok(MutationOutcome::Applied(receipt)) => {
                self.publish(SessionEvent::MutationApplied {
                    kind,
                    receipt: receipt.clone(),
                });
                if let Err(error) = self.sync().await {
                    tracing::warn!("Refetch after {} failed: {}", kind.as_str(), error);
                }
                Ok(IntentOutcome::Mutation(MutationOutcome::Applied(receipt)))
            }
            Ok(MutationOutcome::Skipped(error)) => {
                self.publish(SessionEvent::MutationSkipped {
                    kind,
                    error: error.clone(),
                });
                Ok(IntentOutcome::Mutation(MutationOutcome::Skipped(error)))
            }
            Err(error) if !error.is_fatal(ErrorOrigin::Mutation) => Err(error),
            Err(error) => {
                self.publish(SessionEvent::MutationFailed {
                    kind,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }
}
