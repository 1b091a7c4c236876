//! Lineage Core: workspace graph model, topology, layout and selection

pub mod model;
pub mod error;
pub mod graph;
pub mod diff;
pub mod layout;
pub mod selection;

#[cfg(test)]
pub mod tests;

pub use model::{NodeId, WorkspaceId, DataKind, ColumnType, NodeRole, Shape, Node, Edge, GraphSnapshot};
pub use error::{GraphError, GraphResult};
pub use graph::LineageGraph;
pub use diff::{GraphDiff, DiffEngine};
pub use layout::{compute_layout, compute_ranks, Layout, LayoutConfig, LayoutDirection, LayoutEngine, LayoutSignature, Position};
pub use selection::{PairSelection, SelectionManager};
