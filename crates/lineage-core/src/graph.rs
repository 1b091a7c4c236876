//! Lineage graph wrapper using petgraph::StableDiGraph keyed by NodeId

use crate::error::{GraphError, GraphResult};
use crate::layout::compute_ranks;
use crate::model::*;
use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use std::collections::{BTreeMap, HashMap};

/// A workspace DAG. Edges point from dependency to derived node.
pub struct LineageGraph {
    inner: StableDiGraph<Node, ()>,
    index: HashMap<NodeId, NodeIndex>,
}

impl std::fmt::Debug for LineageGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineageGraph")
            .field("node_count", &self.inner.node_count())
            .field("edge_count", &self.inner.edge_count())
            .finish()
    }
}

impl LineageGraph {
    pub fn new() -> Self {
        LineageGraph {
            inner: StableDiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Build a graph from a snapshot. Edges with a missing endpoint are skipped.
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> GraphResult<Self> {
        let mut graph = LineageGraph::new();
        for node in &snapshot.nodes {
            graph.add_node(node.clone())?;
        }
        for edge in &snapshot.edges {
            match graph.add_edge(&edge.from, &edge.to) {
                Err(GraphError::UnknownNode(id)) => {
                    tracing::warn!("Skipping edge {} with unknown endpoint {}", edge.id(), id);
                }
                other => other?,
            }
        }
        Ok(graph)
    }

    /// Add a node. Ids must be unique.
    pub fn add_node(&mut self, node: Node) -> GraphResult<()> {
        if self.index.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode(node.id));
        }
        let id = node.id.clone();
        let idx = self.inner.add_node(node);
        self.index.insert(id, idx);
        Ok(())
    }

    /// Add a lineage edge. Duplicate edges are ignored; edges closing a cycle are rejected.
    pub fn add_edge(&mut self, from: &NodeId, to: &NodeId) -> GraphResult<()> {
        let source = self.index_of(from)?;
        let target = self.index_of(to)?;
        if self.inner.contains_edge(source, target) {
            return Ok(());
        }
        if source == target || has_path_connecting(&self.inner, target, source, None) {
            return Err(GraphError::Cycle {
                from: from.clone(),
                to: to.clone(),
            });
        }
        self.inner.add_edge(source, target, ());
        Ok(())
    }

    fn index_of(&self, id: &NodeId) -> GraphResult<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| GraphError::UnknownNode(id.clone()))
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).and_then(|idx| self.inner.node_weight(*idx))
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        let idx = *self.index.get(id)?;
        self.inner.node_weight_mut(idx)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    /// Remove a node together with all its incident edges.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        let idx = self.index.remove(id)?;
        self.inner.remove_node(idx)
    }

    /// All node ids, sorted.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.index.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> Vec<&Node> {
        self.node_ids()
            .iter()
            .filter_map(|id| self.node(id))
            .collect()
    }

    /// All edges, sorted by (from, to).
    pub fn edges(&self) -> Vec<Edge> {
        let mut edges: Vec<Edge> = self
            .inner
            .edge_indices()
            .filter_map(|e| self.inner.edge_endpoints(e))
            .filter_map(|(a, b)| {
                let from = self.inner.node_weight(a)?.id.clone();
                let to = self.inner.node_weight(b)?.id.clone();
                Some(Edge { from, to })
            })
            .collect();
        edges.sort();
        edges
    }

    fn neighbors(&self, id: &NodeId, direction: Direction) -> Vec<NodeId> {
        let Some(idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<NodeId> = self
            .inner
            .neighbors_directed(*idx, direction)
            .filter_map(|n| self.inner.node_weight(n).map(|node| node.id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Direct dependencies of a node.
    pub fn parents(&self, id: &NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Nodes derived directly from this one.
    pub fn children(&self, id: &NodeId) -> Vec<NodeId> {
        self.neighbors(id, Direction::Outgoing)
    }

    pub fn roots(&self) -> Vec<NodeId> {
        self.node_ids()
            .into_iter()
            .filter(|id| self.parents(id).is_empty())
            .collect()
    }

    pub fn leaves(&self) -> Vec<NodeId> {
        self.node_ids()
            .into_iter()
            .filter(|id| self.children(id).is_empty())
            .collect()
    }

    pub fn role(&self, id: &NodeId) -> Option<NodeRole> {
        if !self.contains(id) {
            return None;
        }
        if self.parents(id).is_empty() {
            Some(NodeRole::Root)
        } else {
            Some(NodeRole::Derived)
        }
    }

    /// Longest-path distance of every node from its nearest root.
    pub fn ranks(&self) -> BTreeMap<NodeId, u32> {
        compute_ranks(&self.node_ids(), &self.edges())
    }

    /// Export as a snapshot with nodes in id order.
    pub fn to_snapshot(&self, workspace_id: WorkspaceId) -> GraphSnapshot {
        GraphSnapshot {
            workspace_id,
            nodes: self.nodes().into_iter().cloned().collect(),
            edges: self.edges(),
        }
    }
}

impl Default for LineageGraph {
    fn default() -> Self {
        Self::new()
    }
}
