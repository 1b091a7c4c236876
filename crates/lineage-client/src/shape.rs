//! On-demand row counts for lazy nodes
//!
//! Concurrent `resolve` calls for one node share a single backend request.
//! Resolved shapes are kept until the node is forgotten (deleted or converted)
//! or the workspace changes.

use crate::auth::AuthProvider;
use crate::backend::WorkspaceBackend;
use crate::error::{ClientError, ClientResult};
use crate::retry::RetryPolicy;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use lineage_core::{Node, NodeId, Shape, WorkspaceId};
use std::sync::Arc;

type InFlight = Shared<BoxFuture<'static, ClientResult<Shape>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeStatus {
    Unknown,
    Resolving,
    Resolved(Shape),
    /// Transient; cleared by the next attempt.
    Failed(ClientError),
}

pub struct ShapeResolver {
    backend: Arc<dyn WorkspaceBackend>,
    auth: Arc<dyn AuthProvider>,
    retry: RetryPolicy,
    resolved: DashMap<NodeId, Shape>,
    in_flight: DashMap<NodeId, InFlight>,
    failed: DashMap<NodeId, ClientError>,
}

impl ShapeResolver {
    pub fn new(backend: Arc<dyn WorkspaceBackend>, auth: Arc<dyn AuthProvider>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            auth,
            retry,
            resolved: DashMap::new(),
            in_flight: DashMap::new(),
            failed: DashMap::new(),
        }
    }

    /// Exact shape of `node`. Nodes whose row count is already known return
    /// immediately; otherwise at most one request per node is in flight.
    pub async fn resolve(&self, workspace: &WorkspaceId, node: &Node) -> ClientResult<Shape> {
        if node.shape.is_resolved() {
            return Ok(node.shape);
        }
        if let Some(shape) = self.resolved.get(&node.id) {
            return Ok(*shape);
        }
        if !self.auth.is_authenticated() {
            return Err(ClientError::Unauthenticated);
        }

        let request = match self.in_flight.entry(node.id.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(slot) => {
                self.failed.remove(&node.id);
                let backend = Arc::clone(&self.backend);
                let retry = self.retry;
                let workspace = workspace.clone();
                let id = node.id.clone();
                tracing::debug!("Resolving shape of {}", id);
                let request = async move {
                    let report = retry
                        .run("node_shape", || backend.node_shape(&workspace, &id))
                        .await?;
                    Ok::<Shape, ClientError>(report.shape)
                }
                .boxed()
                .shared();
                slot.insert(request.clone());
                request
            }
        };

        let result = request.clone().await;

        // Only the first caller to finish records the outcome, and only if the
        // request was not forgotten meanwhile.
        let owner = self
            .in_flight
            .remove_if(&node.id, |_, current| current.ptr_eq(&request))
            .is_some();
        if owner {
            match &result {
                Ok(shape) => {
                    tracing::debug!("Shape of {} resolved: {}", node.id, shape);
                    self.resolved.insert(node.id.clone(), *shape);
                }
                Err(err) => {
                    tracing::warn!("Failed to resolve shape of {}: {}", node.id, err);
                    self.failed.insert(node.id.clone(), err.clone());
                }
            }
        }
        result
    }

    pub fn status(&self, node: &NodeId) -> ShapeStatus {
        if self.in_flight.contains_key(node) {
            ShapeStatus::Resolving
        } else if let Some(shape) = self.resolved.get(node) {
            ShapeStatus::Resolved(*shape)
        } else if let Some(err) = self.failed.get(node) {
            ShapeStatus::Failed(err.clone())
        } else {
            ShapeStatus::Unknown
        }
    }

    pub fn resolved(&self, node: &NodeId) -> Option<Shape> {
        self.resolved.get(node).map(|s| *s)
    }

    /// The node's declared shape with a resolved row count merged in.
    pub fn effective_shape(&self, node: &Node) -> Shape {
        match (node.shape.rows, self.resolved(&node.id)) {
            (None, Some(resolved)) => Shape::new(resolved.rows, node.shape.cols),
            _ => node.shape,
        }
    }

    /// Drop everything known about a node. A request still in flight is
    /// answered but its result is not kept.
    pub fn forget(&self, node: &NodeId) {
        self.resolved.remove(node);
        self.failed.remove(node);
        self.in_flight.remove(node);
    }

    pub fn clear(&self) {
        self.resolved.clear();
        self.failed.clear();
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SingleUser;
    use crate::providers::local::{Endpoint, LocalBackend};
    use lineage_core::DataKind;

    async fn lazy_orders() -> (Arc<LocalBackend>, ShapeResolver, WorkspaceId, Node) {
        let backend = Arc::new(LocalBackend::with_sample_data());
        let ws = backend.current_workspace().await.unwrap().unwrap();
        let orders = backend
            .graph(&ws)
            .await
            .unwrap()
            .nodes
            .into_iter()
            .find(|n| n.data_kind == DataKind::LazyFrame)
            .unwrap();
        let resolver = ShapeResolver::new(backend.clone(), Arc::new(SingleUser), RetryPolicy::none());
        (backend, resolver, ws, orders)
    }

    #[tokio::test]
    async fn test_known_rows_skip_the_backend() {
        let (backend, resolver, ws, mut node) = lazy_orders().await;
        node.shape.rows = Some(3);
        assert_eq!(resolver.resolve(&ws, &node).await.unwrap(), node.shape);
        assert_eq!(backend.calls(Endpoint::NodeShape), 0);
    }

    #[tokio::test]
    async fn test_failure_is_transient() {
        let (backend, resolver, ws, node) = lazy_orders().await;
        backend.fail_next(Endpoint::NodeShape, ClientError::Network("reset".into()), 1);

        assert!(resolver.resolve(&ws, &node).await.is_err());
        assert!(matches!(resolver.status(&node.id), ShapeStatus::Failed(_)));
        assert_eq!(resolver.effective_shape(&node).rows, None);

        let shape = resolver.resolve(&ws, &node).await.unwrap();
        assert_eq!(resolver.status(&node.id), ShapeStatus::Resolved(shape));
        assert_eq!(resolver.effective_shape(&node), Shape::new(Some(8), 4));
    }

    #[tokio::test]
    async fn test_forget_drops_resolution() {
        let (backend, resolver, ws, node) = lazy_orders().await;
        resolver.resolve(&ws, &node).await.unwrap();
        resolver.resolve(&ws, &node).await.unwrap();
        assert_eq!(backend.calls(Endpoint::NodeShape), 1);

        resolver.forget(&node.id);
        assert_eq!(resolver.status(&node.id), ShapeStatus::Unknown);
        resolver.resolve(&ws, &node).await.unwrap();
        assert_eq!(backend.calls(Endpoint::NodeShape), 2);
    }
}
