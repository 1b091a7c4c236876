//! Ordered multi-node selection

use crate::model::NodeId;
use serde::Serialize;
use std::collections::HashSet;

/// The two nodes a binary operation (join, comparison) acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairSelection {
    pub left: NodeId,
    pub right: NodeId,
    /// More than two ids were selected; only the first two are used.
    pub truncated: bool,
}

/// Insertion-ordered, duplicate-free set of selected node ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionManager {
    ids: Vec<NodeId>,
}

impl SelectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove the id if selected, otherwise append it. Returns whether it is now selected.
    pub fn toggle(&mut self, id: NodeId) -> bool {
        if let Some(pos) = self.ids.iter().position(|s| s == &id) {
            self.ids.remove(pos);
            false
        } else {
            self.ids.push(id);
            true
        }
    }

    /// Replace the selection. Later duplicates are dropped.
    pub fn set_all(&mut self, ids: impl IntoIterator<Item = NodeId>) {
        let mut seen = HashSet::new();
        self.ids = ids.into_iter().filter(|id| seen.insert(id.clone())).collect();
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Drop a single id. Returns whether it was selected.
    pub fn remove(&mut self, id: &NodeId) -> bool {
        let before = self.ids.len();
        self.ids.retain(|s| s != id);
        self.ids.len() != before
    }

    /// The selected id when exactly one is selected.
    pub fn primary(&self) -> Option<&NodeId> {
        match self.ids.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    /// First two ids in insertion order, for binary operations.
    pub fn first_two(&self) -> Option<PairSelection> {
        match self.ids.as_slice() {
            [left, right, rest @ ..] => Some(PairSelection {
                left: left.clone(),
                right: right.clone(),
                truncated: !rest.is_empty(),
            }),
            _ => None,
        }
    }

    /// Re-sync against the current node set, keeping the order of survivors.
    /// Returns the ids that were dropped.
    pub fn retain_known<'a>(&mut self, known: impl IntoIterator<Item = &'a NodeId>) -> Vec<NodeId> {
        let known: HashSet<&NodeId> = known.into_iter().collect();
        let mut removed = Vec::new();
        self.ids.retain(|id| {
            let keep = known.contains(id);
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        removed
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
