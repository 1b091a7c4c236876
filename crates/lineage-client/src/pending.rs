//! Set of in-flight mutations, at most one per operation key

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lineage_core::{NodeId, WorkspaceId};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateFromFile,
    Rename,
    Delete,
    Cast,
    Convert,
    Filter,
    Slice,
    Join,
    ConcordanceDetach,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreateFromFile => "create_from_file",
            OperationKind::Rename => "rename",
            OperationKind::Delete => "delete",
            OperationKind::Cast => "cast",
            OperationKind::Convert => "convert",
            OperationKind::Filter => "filter",
            OperationKind::Slice => "slice",
            OperationKind::Join => "join",
            OperationKind::ConcordanceDetach => "concordance_detach",
        }
    }
}

/// What an operation is keyed on: a node, or the workspace for operations
/// that have no single source node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum OperationTarget {
    Workspace(WorkspaceId),
    Node(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OperationKey {
    pub target: OperationTarget,
    pub kind: OperationKind,
}

impl OperationKey {
    pub fn node(node: &NodeId, kind: OperationKind) -> Self {
        OperationKey {
            target: OperationTarget::Node(node.clone()),
            kind,
        }
    }

    pub fn workspace(workspace: &WorkspaceId, kind: OperationKind) -> Self {
        OperationKey {
            target: OperationTarget::Workspace(workspace.clone()),
            kind,
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            OperationTarget::Workspace(id) => write!(f, "workspace:{}/{}", id, self.kind.as_str()),
            OperationTarget::Node(id) => write!(f, "node:{}/{}", id, self.kind.as_str()),
        }
    }
}

/// Concurrent pending-operation set.
#[derive(Debug, Default)]
pub struct PendingOperations {
    inner: DashMap<OperationKey, DateTime<Utc>>,
}

impl PendingOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`. Returns `None` if it is already pending. The claim is
    /// released when the guard is dropped, whatever the outcome.
    pub fn try_acquire(self: &Arc<Self>, key: OperationKey) -> Option<PendingGuard> {
        match self.inner.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
                Some(PendingGuard {
                    set: Arc::clone(self),
                    key,
                })
            }
        }
    }

    pub fn contains(&self, key: &OperationKey) -> bool {
        self.inner.contains_key(key)
    }

    pub fn started_at(&self, key: &OperationKey) -> Option<DateTime<Utc>> {
        self.inner.get(key).map(|t| *t)
    }

    /// Pending keys, sorted.
    pub fn keys(&self) -> Vec<OperationKey> {
        let mut keys: Vec<OperationKey> = self.inner.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Held for the duration of one mutation.
#[derive(Debug)]
pub struct PendingGuard {
    set: Arc<PendingOperations>,
    key: OperationKey,
}

impl PendingGuard {
    pub fn key(&self) -> &OperationKey {
        &self.key
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.set.inner.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_rejected_until_release() {
        let pending = Arc::new(PendingOperations::new());
        let key = OperationKey::node(&"n1".into(), OperationKind::Delete);

        let guard = pending.try_acquire(key.clone()).unwrap();
        assert!(pending.try_acquire(key.clone()).is_none());
        assert!(pending.contains(&key));

        let other = pending
            .try_acquire(OperationKey::node(&"n1".into(), OperationKind::Rename))
            .unwrap();
        assert_eq!(pending.len(), 2);

        drop(guard);
        drop(other);
        assert!(pending.is_empty());
        assert!(pending.try_acquire(key).is_some());
    }

    #[test]
    fn test_key_display() {
        let key = OperationKey::workspace(&"w".into(), OperationKind::Join);
        assert_eq!(key.to_string(), "workspace:w/join");
    }
}
