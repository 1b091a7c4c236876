//! Graph-mutating operations
//!
//! Each operation validates its arguments, claims its operation key, issues
//! one backend request and, only on success, invalidates the store scopes the
//! operation affects. The claim is released on every exit path.

use crate::backend::*;
use crate::error::{ClientError, ClientResult};
use crate::pending::{OperationKey, OperationKind, OperationTarget, PendingOperations};
use crate::retry::RetryPolicy;
use crate::shape::ShapeResolver;
use crate::store::{GraphStore, InvalidationScope};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use lineage_core::{ColumnType, Node, NodeId, SelectionManager, WorkspaceId};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Result of a mutation that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied(MutationReceipt),
    /// Not sent: the target no longer exists. Carries the `StaleReference` error.
    Skipped(ClientError),
}

impl MutationOutcome {
    pub fn receipt(&self) -> Option<&MutationReceipt> {
        match self {
            MutationOutcome::Applied(receipt) => Some(receipt),
            MutationOutcome::Skipped(_) => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, MutationOutcome::Applied(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationError {
    pub error: ClientError,
    pub at: DateTime<Utc>,
}

/// Last failure per operation key.
#[derive(Debug, Default)]
pub struct OperationErrors {
    inner: DashMap<OperationKey, OperationError>,
}

impl OperationErrors {
    pub fn record(&self, key: OperationKey, error: ClientError) {
        self.inner.insert(
            key,
            OperationError {
                error,
                at: Utc::now(),
            },
        );
    }

    pub fn get(&self, key: &OperationKey) -> Option<OperationError> {
        self.inner.get(key).map(|e| e.clone())
    }

    pub fn clear(&self, key: &OperationKey) -> bool {
        self.inner.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Scopes a successful operation invalidates.
pub fn invalidations_for(
    kind: OperationKind,
    workspace: &WorkspaceId,
    node: Option<&NodeId>,
) -> Vec<InvalidationScope> {
    let mut scopes = vec![InvalidationScope::Graph(workspace.clone())];
    if let Some(node) = node {
        match kind {
            OperationKind::Delete => {
                scopes.push(InvalidationScope::node_data(workspace, node));
            }
            OperationKind::Cast | OperationKind::Convert => {
                scopes.push(InvalidationScope::node_data(workspace, node));
                scopes.push(InvalidationScope::node_schema(workspace, node));
            }
            _ => {}
        }
    }
    scopes
}

fn invalid(message: impl Into<String>) -> ClientError {
    ClientError::Validation(message.into())
}

fn require_column(node: Option<&Node>, column: &str) -> ClientResult<()> {
    if column.trim().is_empty() {
        return Err(invalid("A column must be selected"));
    }
    match node {
        Some(node) if !node.columns.is_empty() && !node.has_column(column) => Err(invalid(format!(
            "Column '{}' does not exist on '{}'",
            column, node.name
        ))),
        _ => Ok(()),
    }
}

pub struct MutationCoordinator {
    store: Arc<GraphStore>,
    resolver: Arc<ShapeResolver>,
    selection: Arc<RwLock<SelectionManager>>,
    pending: Arc<PendingOperations>,
    errors: OperationErrors,
    /// Nodes this coordinator has deleted.
    deleted: DashSet<(WorkspaceId, NodeId)>,
    retry: RetryPolicy,
}

impl MutationCoordinator {
    pub fn new(
        store: Arc<GraphStore>,
        resolver: Arc<ShapeResolver>,
        selection: Arc<RwLock<SelectionManager>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            resolver,
            selection,
            pending: Arc::new(PendingOperations::new()),
            errors: OperationErrors::default(),
            deleted: DashSet::new(),
            retry,
        }
    }

    pub fn is_pending(&self, key: &OperationKey) -> bool {
        self.pending.contains(key)
    }

    pub fn pending_keys(&self) -> Vec<OperationKey> {
        self.pending.keys()
    }

    pub fn last_error(&self, key: &OperationKey) -> Option<OperationError> {
        self.errors.get(key)
    }

    pub fn clear_error(&self, key: &OperationKey) -> bool {
        self.errors.clear(key)
    }

    /// Best local knowledge of a node's columns, from any cached snapshot or descriptor.
    async fn known_node(&self, workspace: &WorkspaceId, node: &NodeId) -> Option<Node> {
        if let Some(found) = self
            .store
            .cached_graph(workspace)
            .await
            .and_then(|g| g.node(node).cloned())
        {
            return Some(found);
        }
        self.store
            .cached_node_schema(workspace, node)
            .await
            .map(|n| n.as_ref().clone())
    }

    fn skip_stale(&self, key: &OperationKey, node: &NodeId) -> ClientResult<MutationOutcome> {
        tracing::warn!("Skipping {}: node {} is no longer present", key, node);
        Ok(MutationOutcome::Skipped(ClientError::StaleReference { node_id: node.clone() }))
    }

    fn reject(&self, key: OperationKey, error: ClientError) -> ClientResult<MutationOutcome> {
        tracing::warn!("Rejected {}: {}", key, error);
        self.errors.record(key, error.clone());
        Err(error)
    }

    /// The shared envelope: claim, stale check, request, invalidate.
    async fn execute<F, Fut>(
        &self,
        key: OperationKey,
        workspace: &WorkspaceId,
        targets: &[&NodeId],
        request: F,
    ) -> ClientResult<MutationOutcome>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<MutationReceipt>>,
    {
        self.store.ensure_authenticated()?;

        let Some(_guard) = self.pending.try_acquire(key.clone()) else {
            tracing::debug!("{} is already in flight; rejecting duplicate", key);
            return Err(ClientError::Busy { key: key.to_string() });
        };
        self.errors.clear(&key);

        if let Some(gone) = targets
            .iter()
            .find(|id| self.deleted.contains(&(workspace.clone(), (**id).clone())))
        {
            return self.skip_stale(&key, gone);
        }
        if let Some(snapshot) = self.store.fresh_graph(workspace).await {
            if let Some(missing) = targets.iter().find(|id| !snapshot.contains(id)) {
                return self.skip_stale(&key, missing);
            }
        }

        let node = match &key.target {
            OperationTarget::Node(id) => Some(id),
            OperationTarget::Workspace(_) => None,
        };
        tracing::info!("Executing {}", key);
        let label = key.to_string();
        match self.retry.run(&label, request).await {
            Ok(receipt) => {
                for scope in invalidations_for(key.kind, workspace, node) {
                    self.store.invalidate(&scope).await;
                }
                if let Some(node) = node {
                    self.after_success(key.kind, workspace, node).await;
                }
                tracing::info!("{} succeeded", key);
                Ok(MutationOutcome::Applied(receipt))
            }
            Err(error) => {
                // The server no longer has the node: same as a stale reference.
                if let (ClientError::Http { status: 404, .. }, Some(node)) = (&error, node) {
                    self.store.invalidate(&InvalidationScope::Graph(workspace.clone())).await;
                    return self.skip_stale(&key, node);
                }
                tracing::warn!("{} failed: {}", key, error);
                self.errors.record(key, error.clone());
                Err(error)
            }
        }
    }

    async fn after_success(&self, kind: OperationKind, workspace: &WorkspaceId, node: &NodeId) {
        match kind {
            OperationKind::Delete => {
                self.deleted.insert((workspace.clone(), node.clone()));
                self.selection.write().await.remove(node);
                if self.store.clear_current_node_if(node).await {
                    tracing::debug!("Cleared current node {}", node);
                }
                self.resolver.forget(node);
            }
            OperationKind::Cast | OperationKind::Convert => self.resolver.forget(node),
            _ => {}
        }
    }

    /// Ingest an uploaded file as a new root node.
    pub async fn create_node_from_file(&self, filename: &str) -> ClientResult<MutationOutcome> {
        let workspace = self.store.require_active_workspace().await?;
        let key = OperationKey::workspace(&workspace, OperationKind::CreateFromFile);
        if filename.trim().is_empty() {
            return self.reject(key, invalid("A file must be selected"));
        }
        let backend = self.store.backend();
        self.execute(key, &workspace, &[], || {
            backend.create_node_from_file(&workspace, filename)
        })
        .await
    }

    pub async fn rename(&self, node: &NodeId, new_name: &str) -> ClientResult<MutationOutcome> {
        let workspace = self.store.require_active_workspace().await?;
        let key = OperationKey::node(node, OperationKind::Rename);
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return self.reject(key, invalid("Name must not be empty"));
        }
        let backend = self.store.backend();
        self.execute(key, &workspace, &[node], || {
            backend.rename_node(&workspace, node, new_name)
        })
        .await
    }

    /// Remove a node and its incident edges.
    pub async fn delete(&self, node: &NodeId) -> ClientResult<MutationOutcome> {
        let workspace = self.store.require_active_workspace().await?;
        let key = OperationKey::node(node, OperationKind::Delete);
        let backend = self.store.backend();
        self.execute(key, &workspace, &[node], || backend.delete_node(&workspace, node))
            .await
    }

    pub async fn cast(&self, node: &NodeId, spec: CastSpec) -> ClientResult<MutationOutcome> {
        let workspace = self.store.require_active_workspace().await?;
        let key = OperationKey::node(node, OperationKind::Cast);
        let known = self.known_node(&workspace, node).await;
        if let Err(error) = require_column(known.as_ref(), &spec.column) {
            return self.reject(key, error);
        }
        if spec.format.is_some() && spec.target_type != CastTarget::Datetime {
            return self.reject(key, invalid("A format only applies to datetime casts"));
        }
        let backend = self.store.backend();
        self.execute(key, &workspace, &[node], || backend.cast_node(&workspace, node, &spec))
            .await
    }

    /// Change a node's frame type in place.
    pub async fn convert(&self, node: &NodeId, target: ConvertTarget) -> ClientResult<MutationOutcome> {
        let workspace = self.store.require_active_workspace().await?;
        let key = OperationKey::node(node, OperationKind::Convert);
        if target.data_kind().is_document() {
            let known = self.known_node(&workspace, node).await;
            let check = match (target.document_column(), known.as_ref()) {
                (Some(column), known) => require_column(known, column),
                (None, Some(known))
                    if known.document_column.is_none()
                        && !known.schema.is_empty()
                        && !known.schema.values().any(|t| *t == ColumnType::String) =>
                {
                    Err(invalid(format!(
                        "'{}' has no text column to use as the document column",
                        known.name
                    )))
                }
                _ => Ok(()),
            };
            if let Err(error) = check {
                return self.reject(key, error);
            }
        }
        let backend = self.store.backend();
        self.execute(key, &workspace, &[node], || {
            backend.convert_node(&workspace, node, &target)
        })
        .await
    }

    /// Derive a new node with the rows matching `spec`.
    pub async fn filter(&self, node: &NodeId, spec: FilterSpec) -> ClientResult<MutationOutcome> {
        let workspace = self.store.require_active_workspace().await?;
        let key = OperationKey::node(node, OperationKind::Filter);
        if spec.conditions.is_empty() {
            return self.reject(key, invalid("At least one filter condition is required"));
        }
        let known = self.known_node(&workspace, node).await;
        for condition in &spec.conditions {
            if let Err(error) = require_column(known.as_ref(), &condition.column) {
                return self.reject(key, error);
            }
        }
        let backend = self.store.backend();
        self.execute(key, &workspace, &[node], || backend.filter_node(&workspace, node, &spec))
            .await
    }

    /// Derive a new node from a row range and/or column subset.
    pub async fn slice(&self, node: &NodeId, spec: SliceSpec) -> ClientResult<MutationOutcome> {
        let workspace = self.store.require_active_workspace().await?;
        let key = OperationKey::node(node, OperationKind::Slice);
        if let (Some(start), Some(end)) = (spec.start_row, spec.end_row) {
            if start > end {
                return self.reject(key, invalid("Start row must not be after end row"));
            }
        }
        let known = self.known_node(&workspace, node).await;
        for column in spec.columns.iter().flatten() {
            if let Err(error) = require_column(known.as_ref(), column) {
                return self.reject(key, error);
            }
        }
        let backend = self.store.backend();
        self.execute(key, &workspace, &[node], || backend.slice_node(&workspace, node, &spec))
            .await
    }

    /// Derive a new node joining two others. Keyed on the workspace.
    pub async fn join(&self, spec: JoinSpec) -> ClientResult<MutationOutcome> {
        let workspace = self.store.require_active_workspace().await?;
        let key = OperationKey::workspace(&workspace, OperationKind::Join);
        if spec.left == spec.right {
            return self.reject(key, invalid("A join needs two different nodes"));
        }
        if spec.how != JoinHow::Cross {
            let left = self.known_node(&workspace, &spec.left).await;
            let right = self.known_node(&workspace, &spec.right).await;
            let check = require_column(left.as_ref(), &spec.left_on)
                .and_then(|_| require_column(right.as_ref(), &spec.right_on));
            if let Err(error) = check {
                return self.reject(key, error);
            }
        }
        let backend = self.store.backend();
        self.execute(key, &workspace, &[&spec.left, &spec.right], || {
            backend.join_nodes(&workspace, &spec)
        })
        .await
    }

    /// Derive a new node with concordance matches attached to the source rows.
    pub async fn detach_concordance(&self, node: &NodeId, spec: DetachSpec) -> ClientResult<MutationOutcome> {
        let workspace = self.store.require_active_workspace().await?;
        let key = OperationKey::node(node, OperationKind::ConcordanceDetach);
        if spec.search_word.trim().is_empty() {
            return self.reject(key, invalid("A search word is required"));
        }
        let known = self.known_node(&workspace, node).await;
        if let Err(error) = require_column(known.as_ref(), &spec.column) {
            return self.reject(key, error);
        }
        let backend = self.store.backend();
        self.execute(key, &workspace, &[node], || {
            backend.detach_concordance(&workspace, node, &spec)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidation_table() {
        let w = WorkspaceId::from("w");
        let n = NodeId::from("n");
        assert_eq!(
            invalidations_for(OperationKind::Rename, &w, Some(&n)),
            vec![InvalidationScope::Graph(w.clone())]
        );
        assert_eq!(invalidations_for(OperationKind::Delete, &w, Some(&n)).len(), 2);
        assert_eq!(
            invalidations_for(OperationKind::Cast, &w, Some(&n)),
            vec![
                InvalidationScope::Graph(w.clone()),
                InvalidationScope::node_data(&w, &n),
                InvalidationScope::node_schema(&w, &n),
            ]
        );
        assert_eq!(invalidations_for(OperationKind::Join, &w, None).len(), 1);
        assert_eq!(invalidations_for(OperationKind::Filter, &w, Some(&n)).len(), 1);
    }

    #[test]
    fn test_unknown_schema_accepts_any_column() {
        assert!(require_column(None, "anything").is_ok());
        assert!(require_column(None, " ").is_err());

        let node = Node::new("n", "sales", lineage_core::DataKind::DataFrame)
            .with_column("amount", ColumnType::Number);
        assert!(require_column(Some(&node), "amount").is_ok());
        assert!(require_column(Some(&node), "amout").is_err());
    }
}
