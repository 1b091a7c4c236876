//! Deterministic layered layout for the lineage DAG
//!
//! Nodes are ranked by their longest distance from a root and placed on the
//! rank axis at `rank * rank_separation`. Nodes sharing a rank are ordered by
//! id and spaced `node_separation` apart on the cross axis. No crossing
//! minimisation is attempted; identical input always yields identical output.

use crate::model::{Edge, GraphSnapshot, NodeId};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Which screen axis the ranks advance along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LayoutDirection {
    #[default]
    LeftToRight,
    TopToBottom,
}

/// Spacing parameters for the layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Distance between consecutive ranks.
    pub rank_separation: f64,
    /// Distance between siblings within a rank.
    pub node_separation: f64,
    /// Estimated rendered node size. Rendered nodes may differ.
    pub node_width: f64,
    pub node_height: f64,
    pub direction: LayoutDirection,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        LayoutConfig {
            rank_separation: 300.0,
            node_separation: 150.0,
            node_width: 240.0,
            node_height: 110.0,
            direction: LayoutDirection::LeftToRight,
        }
    }
}

impl LayoutConfig {
    fn rank_step(&self) -> f64 {
        let extent = match self.direction {
            LayoutDirection::LeftToRight => self.node_width,
            LayoutDirection::TopToBottom => self.node_height,
        };
        self.rank_separation.max(extent)
    }

    fn cross_step(&self) -> f64 {
        let extent = match self.direction {
            LayoutDirection::LeftToRight => self.node_height,
            LayoutDirection::TopToBottom => self.node_width,
        };
        self.node_separation.max(extent)
    }
}

/// Top-left corner of a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Rank of every node: 0 for roots, otherwise `1 + max(rank(parent))`.
///
/// Edges with an endpoint outside `nodes` are ignored. Nodes caught in a cycle
/// cannot be ranked and are placed at rank 0.
pub fn compute_ranks(nodes: &[NodeId], edges: &[Edge]) -> BTreeMap<NodeId, u32> {
    let mut sorted: Vec<&NodeId> = nodes.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut graph: DiGraph<&NodeId, ()> = DiGraph::with_capacity(sorted.len(), edges.len());
    let mut index: HashMap<&NodeId, NodeIndex> = HashMap::with_capacity(sorted.len());
    for id in &sorted {
        index.insert(*id, graph.add_node(*id));
    }
    for edge in edges {
        if let (Some(&a), Some(&b)) = (index.get(&edge.from), index.get(&edge.to)) {
            if a != b {
                graph.update_edge(a, b, ());
            }
        }
    }

    let mut indegree: Vec<usize> = graph
        .node_indices()
        .map(|i| graph.neighbors_directed(i, Direction::Incoming).count())
        .collect();
    let mut rank = vec![0u32; graph.node_count()];
    let mut ready: VecDeque<NodeIndex> = graph
        .node_indices()
        .filter(|i| indegree[i.index()] == 0)
        .collect();
    let mut visited = 0usize;

    while let Some(current) = ready.pop_front() {
        visited += 1;
        let next_rank = rank[current.index()] + 1;
        for child in graph.neighbors_directed(current, Direction::Outgoing) {
            let c = child.index();
            rank[c] = rank[c].max(next_rank);
            indegree[c] -= 1;
            if indegree[c] == 0 {
                ready.push_back(child);
            }
        }
    }

    if visited < graph.node_count() {
        tracing::warn!(
            "Layout input contains a cycle; {} nodes placed at rank 0",
            graph.node_count() - visited
        );
        for i in graph.node_indices() {
            if indegree[i.index()] > 0 {
                rank[i.index()] = 0;
            }
        }
    }

    graph
        .node_indices()
        .map(|i| (graph[i].clone(), rank[i.index()]))
        .collect()
}

/// Position every node. Pure: depends only on the ids, the edges and the config.
pub fn compute_layout(
    nodes: &[NodeId],
    edges: &[Edge],
    config: &LayoutConfig,
) -> BTreeMap<NodeId, Position> {
    place(&compute_ranks(nodes, edges), config)
}

fn place(ranks: &BTreeMap<NodeId, u32>, config: &LayoutConfig) -> BTreeMap<NodeId, Position> {
    let rank_step = config.rank_step();
    let cross_step = config.cross_step();
    let mut next_slot: BTreeMap<u32, u32> = BTreeMap::new();
    let mut positions = BTreeMap::new();

    // BTreeMap iteration is id order, which fixes the sibling order.
    for (id, rank) in ranks {
        let slot = next_slot.entry(*rank).or_insert(0);
        let along = *rank as f64 * rank_step;
        let across = *slot as f64 * cross_step;
        *slot += 1;
        let position = match config.direction {
            LayoutDirection::LeftToRight => Position { x: along, y: across },
            LayoutDirection::TopToBottom => Position { x: across, y: along },
        };
        positions.insert(id.clone(), position);
    }
    positions
}

/// Change-detection signature over everything that affects what is drawn.
///
/// Covers the node ids, the edges, and per node its name, type tag, laziness
/// and document column. Selection state is deliberately not an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutSignature(pub u64);

impl LayoutSignature {
    pub fn of(snapshot: &GraphSnapshot) -> Self {
        let mut hasher = DefaultHasher::new();

        let mut nodes: Vec<_> = snapshot.nodes.iter().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes.len().hash(&mut hasher);
        for node in nodes {
            node.id.hash(&mut hasher);
            node.name.hash(&mut hasher);
            node.data_kind.hash(&mut hasher);
            node.is_lazy.hash(&mut hasher);
            node.document_column.hash(&mut hasher);
        }

        let mut edges: Vec<_> = snapshot.edges.iter().collect();
        edges.sort();
        edges.dedup();
        edges.len().hash(&mut hasher);
        for edge in edges {
            edge.hash(&mut hasher);
        }

        LayoutSignature(hasher.finish())
    }
}

/// Positions and ranks computed for one signature.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Layout {
    pub positions: BTreeMap<NodeId, Position>,
    pub ranks: BTreeMap<NodeId, u32>,
}

/// Memoising front-end to [`compute_layout`].
#[derive(Debug, Default)]
pub struct LayoutEngine {
    config: LayoutConfig,
    last: Option<(LayoutSignature, Arc<Layout>)>,
    recomputations: u64,
}

impl LayoutEngine {
    pub fn new(config: LayoutConfig) -> Self {
        LayoutEngine {
            config,
            last: None,
            recomputations: 0,
        }
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    /// Return the layout for a snapshot, recomputing only if its signature changed.
    pub fn layout(&mut self, snapshot: &GraphSnapshot) -> Arc<Layout> {
        let signature = LayoutSignature::of(snapshot);
        if let Some((last_signature, layout)) = &self.last {
            if *last_signature == signature {
                return Arc::clone(layout);
            }
        }

        let ids = snapshot.node_ids();
        let ranks = compute_ranks(&ids, &snapshot.edges);
        let positions = place(&ranks, &self.config);
        let layout = Arc::new(Layout { positions, ranks });
        self.recomputations += 1;
        tracing::debug!(
            "Layout recomputed for {} nodes ({} total recomputations)",
            ids.len(),
            self.recomputations
        );
        self.last = Some((signature, Arc::clone(&layout)));
        layout
    }

    /// How many times a layout has actually been computed.
    pub fn recomputations(&self) -> u64 {
        self.recomputations
    }

    /// Forget the memoised layout, e.g. after a workspace switch.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataKind, Node, WorkspaceId};

    fn ids(list: &[&str]) -> Vec<NodeId> {
        list.iter().map(|s| NodeId::from(*s)).collect()
    }

    #[test]
    fn test_diamond_uses_longest_path() {
        // a -> b -> d, a -> d
        let edges = vec![Edge::new("a", "b"), Edge::new("b", "d"), Edge::new("a", "d")];
        let ranks = compute_ranks(&ids(&["d", "b", "a"]), &edges);
        assert_eq!(ranks[&NodeId::from("a")], 0);
        assert_eq!(ranks[&NodeId::from("b")], 1);
        assert_eq!(ranks[&NodeId::from("d")], 2);
    }

    #[test]
    fn test_cycle_does_not_hang() {
        let edges = vec![Edge::new("a", "b"), Edge::new("b", "a"), Edge::new("c", "a")];
        let ranks = compute_ranks(&ids(&["a", "b", "c"]), &edges);
        assert_eq!(ranks.len(), 3);
        assert_eq!(ranks[&NodeId::from("c")], 0);
    }

    #[test]
    fn test_unknown_edge_endpoints_ignored() {
        let edges = vec![Edge::new("ghost", "a")];
        let layout = compute_layout(&ids(&["a"]), &edges, &LayoutConfig::default());
        assert_eq!(layout[&NodeId::from("a")], Position { x: 0.0, y: 0.0 });
    }

    #[test]
    fn test_top_to_bottom_swaps_axes() {
        let config = LayoutConfig {
            direction: LayoutDirection::TopToBottom,
            ..LayoutConfig::default()
        };
        let layout = compute_layout(&ids(&["a", "b"]), &[Edge::new("a", "b")], &config);
        assert_eq!(layout[&NodeId::from("b")], Position { x: 0.0, y: 300.0 });
    }

    #[test]
    fn test_small_separation_is_widened_to_node_box() {
        let config = LayoutConfig {
            node_separation: 10.0,
            ..LayoutConfig::default()
        };
        let layout = compute_layout(&ids(&["a", "b"]), &[], &config);
        assert_eq!(layout[&NodeId::from("b")].y, 110.0);
    }

    #[test]
    fn test_signature_ignores_shape_but_not_name() {
        let mut snapshot = GraphSnapshot {
            workspace_id: WorkspaceId::from("w"),
            nodes: vec![Node::new("a", "A", DataKind::LazyFrame)],
            edges: vec![],
        };
        let before = LayoutSignature::of(&snapshot);

        snapshot.nodes[0].shape.rows = Some(10);
        assert_eq!(LayoutSignature::of(&snapshot), before);

        snapshot.nodes[0].name = "renamed".to_string();
        assert_ne!(LayoutSignature::of(&snapshot), before);
    }
}
