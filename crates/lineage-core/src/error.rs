//! Error types for graph construction

use crate::model::NodeId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Duplicate node: {0}")]
    DuplicateNode(NodeId),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Edge {from} -> {to} would create a cycle")]
    Cycle { from: NodeId, to: NodeId },
}

pub type GraphResult<T> = Result<T, GraphError>;
