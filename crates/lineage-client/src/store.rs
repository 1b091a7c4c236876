//! Cache-coherent mirror of the backend's workspaces
//!
//! Every query goes through a [`TtlCache`] keyed by its composite key. Reads
//! return the cached value while it is fresh and refetch otherwise. Mutations
//! never write into the caches; they invalidate scopes and the next read
//! refetches.

use crate::auth::AuthProvider;
use crate::backend::{NodePage, WorkspaceBackend, WorkspaceSummary};
use crate::cache::{CacheStats, TtlCache};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::retry::RetryPolicy;
use lineage_core::{GraphSnapshot, Node, NodeId, WorkspaceId};
use serde::Serialize;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// A named cache region that can be marked stale independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum InvalidationScope {
    Graph(WorkspaceId),
    /// `page: None` covers every page of the node.
    NodeData {
        workspace: WorkspaceId,
        node: NodeId,
        page: Option<u32>,
    },
    NodeSchema {
        workspace: WorkspaceId,
        node: NodeId,
    },
    WorkspaceList,
    CurrentWorkspace,
}

impl InvalidationScope {
    pub fn node_data(workspace: &WorkspaceId, node: &NodeId) -> Self {
        InvalidationScope::NodeData {
            workspace: workspace.clone(),
            node: node.clone(),
            page: None,
        }
    }

    pub fn node_schema(workspace: &WorkspaceId, node: &NodeId) -> Self {
        InvalidationScope::NodeSchema {
            workspace: workspace.clone(),
            node: node.clone(),
        }
    }
}

/// `(workspace, node, page, page_size)`
type DataKey = (WorkspaceId, NodeId, u32, u32);
type SchemaKey = (WorkspaceId, NodeId);

struct Caches {
    workspaces: TtlCache<(), Arc<Vec<WorkspaceSummary>>>,
    current: TtlCache<(), Option<WorkspaceId>>,
    graphs: TtlCache<WorkspaceId, Arc<GraphSnapshot>>,
    node_data: TtlCache<DataKey, Arc<NodePage>>,
    node_schema: TtlCache<SchemaKey, Arc<Node>>,
}

impl Caches {
    fn workspace_cache(&mut self) -> &mut TtlCache<(), Arc<Vec<WorkspaceSummary>>> {
        &mut self.workspaces
    }

    fn current_cache(&mut self) -> &mut TtlCache<(), Option<WorkspaceId>> {
        &mut self.current
    }

    fn graph_cache(&mut self) -> &mut TtlCache<WorkspaceId, Arc<GraphSnapshot>> {
        &mut self.graphs
    }

    fn data_cache(&mut self) -> &mut TtlCache<DataKey, Arc<NodePage>> {
        &mut self.node_data
    }

    fn schema_cache(&mut self) -> &mut TtlCache<SchemaKey, Arc<Node>> {
        &mut self.node_schema
    }
}

#[derive(Debug, Default)]
struct Cursor {
    node: Option<NodeId>,
    /// Bumped on every move so in-flight detail fetches can tell they were superseded.
    generation: u64,
}

pub struct GraphStore {
    backend: Arc<dyn WorkspaceBackend>,
    auth: Arc<dyn AuthProvider>,
    caches: Mutex<Caches>,
    retry: RetryPolicy,
    page_size: u32,
    active: RwLock<Option<WorkspaceId>>,
    cursor: RwLock<Cursor>,
}

impl GraphStore {
    pub fn new(
        backend: Arc<dyn WorkspaceBackend>,
        auth: Arc<dyn AuthProvider>,
        config: &ClientConfig,
    ) -> Self {
        let freshness = &config.freshness;
        Self {
            backend,
            auth,
            caches: Mutex::new(Caches {
                workspaces: TtlCache::new(freshness.workspace_list()),
                current: TtlCache::new(freshness.current_workspace()),
                graphs: TtlCache::new(freshness.graph()),
                node_data: TtlCache::new(freshness.node_data()),
                node_schema: TtlCache::new(freshness.node_schema()),
            }),
            retry: RetryPolicy::reads(&config.retry),
            page_size: config.page_size,
            active: RwLock::new(None),
            cursor: RwLock::new(Cursor::default()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn WorkspaceBackend> {
        &self.backend
    }

    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub(crate) fn ensure_authenticated(&self) -> ClientResult<()> {
        if self.auth.is_authenticated() {
            Ok(())
        } else {
            Err(ClientError::Unauthenticated)
        }
    }

    async fn cached<K, V, F, Fut>(
        &self,
        label: &str,
        select: fn(&mut Caches) -> &mut TtlCache<K, V>,
        key: K,
        fetch: F,
    ) -> ClientResult<V>
    where
        K: Eq + Hash + Clone,
        V: Clone,
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<V>>,
    {
        self.ensure_authenticated()?;

        let ticket = {
            let mut caches = self.caches.lock().await;
            let cache = select(&mut *caches);
            if let Some(value) = cache.get(&key) {
                tracing::debug!("Cache hit: {}", label);
                return Ok(value);
            }
            let pruned = cache.cleanup_expired();
            if pruned > 0 {
                tracing::debug!("Pruned {} expired entries", pruned);
            }
            cache.begin(key)
        };

        tracing::debug!("Cache miss: {}", label);
        let value = match self.retry.run(label, fetch).await {
            Ok(value) => value,
            Err(error) => {
                select(&mut *self.caches.lock().await).abandon(ticket);
                return Err(error);
            }
        };

        let mut caches = self.caches.lock().await;
        if !select(&mut *caches).complete(ticket, value.clone()) {
            tracing::debug!("{} changed while in flight; not cached as fresh", label);
        }
        Ok(value)
    }

    /// Graph snapshot of a workspace.
    pub async fn load(&self, workspace: &WorkspaceId) -> ClientResult<Arc<GraphSnapshot>> {
        let label = format!("graph({})", workspace);
        self.cached(&label, Caches::graph_cache, workspace.clone(), || async move {
            Ok::<_, ClientError>(Arc::new(self.backend.graph(workspace).await?))
        })
        .await
    }

    pub async fn workspaces(&self) -> ClientResult<Arc<Vec<WorkspaceSummary>>> {
        self.cached("workspace_list", Caches::workspace_cache, (), || async move {
            Ok::<_, ClientError>(Arc::new(self.backend.list_workspaces().await?))
        })
        .await
    }

    /// The backend's current-workspace pointer.
    pub async fn current_workspace(&self) -> ClientResult<Option<WorkspaceId>> {
        self.cached("current_workspace", Caches::current_cache, (), || {
            self.backend.current_workspace()
        })
        .await
    }

    /// Node descriptor with schema.
    pub async fn node_schema(&self, workspace: &WorkspaceId, node: &NodeId) -> ClientResult<Arc<Node>> {
        let label = format!("node_schema({}, {})", workspace, node);
        let key = (workspace.clone(), node.clone());
        self.cached(&label, Caches::schema_cache, key, || async move {
            Ok::<_, ClientError>(Arc::new(self.backend.node(workspace, node).await?))
        })
        .await
    }

    /// One page (1-based) of a node's rows.
    pub async fn node_data(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        page: u32,
    ) -> ClientResult<Arc<NodePage>> {
        let label = format!("node_data({}, {}, {})", workspace, node, page);
        let key = (workspace.clone(), node.clone(), page, self.page_size);
        self.cached(&label, Caches::data_cache, key, || async move {
            Ok::<_, ClientError>(Arc::new(
                self.backend
                    .node_data(workspace, node, page, self.page_size)
                    .await?,
            ))
        })
        .await
    }

    /// Mark a scope stale so the next read refetches. Idempotent.
    pub async fn invalidate(&self, scope: &InvalidationScope) -> usize {
        let mut caches = self.caches.lock().await;
        let affected = match scope {
            InvalidationScope::Graph(w) => caches.graphs.invalidate_where(|k| k == w),
            InvalidationScope::NodeData { workspace, node, page } => {
                caches.node_data.invalidate_where(|(w, n, p, _)| {
                    w == workspace && n == node && page.is_none_or(|page| page == *p)
                })
            }
            InvalidationScope::NodeSchema { workspace, node } => caches
                .node_schema
                .invalidate_where(|(w, n)| w == workspace && n == node),
            InvalidationScope::WorkspaceList => caches.workspaces.invalidate_where(|_| true),
            InvalidationScope::CurrentWorkspace => caches.current.invalidate_where(|_| true),
        };
        tracing::debug!("Invalidated {:?} ({} entries)", scope, affected);
        affected
    }

    /// Workspace the session is bound to.
    pub async fn active_workspace(&self) -> Option<WorkspaceId> {
        self.active.read().await.clone()
    }

    pub(crate) async fn require_active_workspace(&self) -> ClientResult<WorkspaceId> {
        self.active_workspace()
            .await
            .ok_or_else(|| ClientError::Validation("No workspace is active".to_string()))
    }

    /// Bind to a workspace without telling the backend, e.g. at startup.
    pub async fn attach(&self, workspace: WorkspaceId) {
        let mut active = self.active.write().await;
        if active.as_ref() != Some(&workspace) {
            tracing::info!("Attached to workspace {}", workspace);
            *active = Some(workspace);
        }
    }

    /// Make `workspace` current on the backend and drop every workspace-scoped
    /// cache entry. In-flight reads for the previous workspace are discarded on arrival.
    pub async fn switch_workspace(&self, workspace: &WorkspaceId) -> ClientResult<()> {
        self.ensure_authenticated()?;
        self.retry
            .run("set_current_workspace", || self.backend.set_current_workspace(workspace))
            .await?;

        {
            let mut caches = self.caches.lock().await;
            let discarded = caches.graphs.remove_where(|_| true)
                + caches.node_data.remove_where(|_| true)
                + caches.node_schema.remove_where(|_| true);
            caches.workspaces.invalidate_where(|_| true);
            caches.current.invalidate_where(|_| true);
            tracing::debug!("Discarded {} cached entries", discarded);
        }
        *self.active.write().await = Some(workspace.clone());
        self.set_current_node(None).await;
        tracing::info!("Switched to workspace {}", workspace);
        Ok(())
    }

    /// Move the detail-view cursor.
    pub async fn set_current_node(&self, node: Option<NodeId>) {
        let mut cursor = self.cursor.write().await;
        cursor.node = node;
        cursor.generation += 1;
    }

    pub async fn current_node(&self) -> Option<NodeId> {
        self.cursor.read().await.node.clone()
    }

    /// Clear the cursor if it points at `node`. Returns whether it did.
    pub async fn clear_current_node_if(&self, node: &NodeId) -> bool {
        let mut cursor = self.cursor.write().await;
        if cursor.node.as_ref() == Some(node) {
            cursor.node = None;
            cursor.generation += 1;
            true
        } else {
            false
        }
    }

    /// Rows for the current node. `Ok(None)` when there is no current node or
    /// the cursor moved while the page was loading.
    pub async fn current_node_data(&self, page: u32) -> ClientResult<Option<Arc<NodePage>>> {
        let (node, generation) = {
            let cursor = self.cursor.read().await;
            (cursor.node.clone(), cursor.generation)
        };
        let Some(node) = node else {
            return Ok(None);
        };
        let workspace = self.require_active_workspace().await?;

        let data = self.node_data(&workspace, &node, page).await?;
        if self.cursor.read().await.generation != generation {
            tracing::warn!("Discarding node data for {}: current node changed", node);
            return Ok(None);
        }
        Ok(Some(data))
    }

    /// Last snapshot stored for a workspace, fresh or not. Never fetches.
    pub async fn cached_graph(&self, workspace: &WorkspaceId) -> Option<Arc<GraphSnapshot>> {
        self.caches.lock().await.graphs.peek(workspace).cloned()
    }

    /// The stored snapshot only while it is fresh.
    pub async fn fresh_graph(&self, workspace: &WorkspaceId) -> Option<Arc<GraphSnapshot>> {
        let caches = self.caches.lock().await;
        if caches.graphs.is_fresh(workspace) {
            caches.graphs.peek(workspace).cloned()
        } else {
            None
        }
    }

    pub async fn cached_node_schema(&self, workspace: &WorkspaceId, node: &NodeId) -> Option<Arc<Node>> {
        self.caches
            .lock()
            .await
            .node_schema
            .peek(&(workspace.clone(), node.clone()))
            .cloned()
    }

    pub async fn cached_node_data(
        &self,
        workspace: &WorkspaceId,
        node: &NodeId,
        page: u32,
    ) -> Option<Arc<NodePage>> {
        self.caches
            .lock()
            .await
            .node_data
            .peek(&(workspace.clone(), node.clone(), page, self.page_size))
            .cloned()
    }

    pub async fn is_graph_fresh(&self, workspace: &WorkspaceId) -> bool {
        self.caches.lock().await.graphs.is_fresh(workspace)
    }

    /// Keys still tracked across all caches, stored or in flight.
    pub async fn tracked_keys(&self) -> usize {
        let caches = self.caches.lock().await;
        caches.workspaces.tracked_keys()
            + caches.current.tracked_keys()
            + caches.graphs.tracked_keys()
            + caches.node_data.tracked_keys()
            + caches.node_schema.tracked_keys()
    }

    pub async fn stats(&self) -> CacheStats {
        let caches = self.caches.lock().await;
        caches
            .workspaces
            .stats()
            .merge(caches.current.stats())
            .merge(caches.graphs.stats())
            .merge(caches.node_data.stats())
            .merge(caches.node_schema.stats())
    }
}
