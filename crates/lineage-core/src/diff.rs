//! Snapshot diff computation for change notifications

use crate::model::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What changed between two snapshots of the same workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphDiff {
    /// Monotonically increasing diff sequence number.
    pub sequence: u64,
    pub added_nodes: Vec<NodeId>,
    pub removed_nodes: Vec<NodeId>,
    /// Same id, different fields.
    pub modified_nodes: Vec<NodeId>,
    pub added_edges: Vec<Edge>,
    pub removed_edges: Vec<Edge>,
}

impl GraphDiff {
    /// Create an empty diff with given sequence number.
    pub fn new(sequence: u64) -> Self {
        GraphDiff {
            sequence,
            added_nodes: Vec::new(),
            removed_nodes: Vec::new(),
            modified_nodes: Vec::new(),
            added_edges: Vec::new(),
            removed_edges: Vec::new(),
        }
    }

    /// Check if this diff is empty (no changes).
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty()
            && self.removed_nodes.is_empty()
            && self.modified_nodes.is_empty()
            && self.added_edges.is_empty()
            && self.removed_edges.is_empty()
    }

    /// Whether nodes or edges appeared or disappeared.
    pub fn is_structural(&self) -> bool {
        !(self.added_nodes.is_empty()
            && self.removed_nodes.is_empty()
            && self.added_edges.is_empty()
            && self.removed_edges.is_empty())
    }
}

/// Sequence-numbering diff producer.
pub struct DiffEngine {
    sequence: u64,
}

impl DiffEngine {
    pub fn new() -> Self {
        DiffEngine { sequence: 0 }
    }

    /// Compute the difference between two snapshots. A missing `old` snapshot
    /// reports every node and edge of `new` as added.
    pub fn compute_diff(&mut self, old: Option<&GraphSnapshot>, new: &GraphSnapshot) -> GraphDiff {
        self.sequence += 1;
        let mut diff = GraphDiff::new(self.sequence);

        let old_nodes: BTreeMap<&NodeId, &Node> = old
            .map(|s| s.nodes.iter().map(|n| (&n.id, n)).collect())
            .unwrap_or_default();
        let new_nodes: BTreeMap<&NodeId, &Node> = new.nodes.iter().map(|n| (&n.id, n)).collect();

        for (id, node) in &new_nodes {
            match old_nodes.get(id) {
                None => diff.added_nodes.push((*id).clone()),
                Some(previous) if previous != node => diff.modified_nodes.push((*id).clone()),
                Some(_) => {}
            }
        }
        for id in old_nodes.keys() {
            if !new_nodes.contains_key(id) {
                diff.removed_nodes.push((*id).clone());
            }
        }

        let old_edges: BTreeSet<&Edge> = old.map(|s| s.edges.iter().collect()).unwrap_or_default();
        let new_edges: BTreeSet<&Edge> = new.edges.iter().collect();
        diff.added_edges = new_edges.difference(&old_edges).map(|e| (*e).clone()).collect();
        diff.removed_edges = old_edges.difference(&new_edges).map(|e| (*e).clone()).collect();

        diff
    }

    /// Get current sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::new()
    }
}
