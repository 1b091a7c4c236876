//! Core data structures for the workspace lineage graph

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, stable identifier for a node. Unique within a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(id.to_string())
    }
}

/// Identifier of a workspace owned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct WorkspaceId(pub String);

impl WorkspaceId {
    pub fn new(id: impl Into<String>) -> Self {
        WorkspaceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkspaceId {
    fn from(id: &str) -> Self {
        WorkspaceId(id.to_string())
    }
}

/// Concrete frame type backing a node. This is the node's type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataKind {
    DataFrame,
    LazyFrame,
    DocDataFrame,
    DocLazyFrame,
}

impl DataKind {
    /// Parse the backend's `module.Class` tag; only the class name is significant.
    /// Unknown tags are treated as a plain frame.
    pub fn from_tag(tag: &str) -> Self {
        match tag.rsplit('.').next().unwrap_or(tag) {
            "LazyFrame" => DataKind::LazyFrame,
            "DocDataFrame" => DataKind::DocDataFrame,
            "DocLazyFrame" => DataKind::DocLazyFrame,
            _ => DataKind::DataFrame,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            DataKind::DataFrame => "polars.DataFrame",
            DataKind::LazyFrame => "polars.LazyFrame",
            DataKind::DocDataFrame => "docframe.DocDataFrame",
            DataKind::DocLazyFrame => "docframe.DocLazyFrame",
        }
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self, DataKind::LazyFrame | DataKind::DocLazyFrame)
    }

    pub fn is_document(&self) -> bool {
        matches!(self, DataKind::DocDataFrame | DataKind::DocLazyFrame)
    }
}

impl From<String> for DataKind {
    fn from(tag: String) -> Self {
        DataKind::from_tag(&tag)
    }
}

impl From<DataKind> for String {
    fn from(kind: DataKind) -> Self {
        kind.tag().to_string()
    }
}

/// Column type tag as exposed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Number,
    String,
    Boolean,
    Datetime,
}

impl ColumnType {
    /// Normalise a backend dtype string (`Int64`, `Utf8`, `Datetime(ms)`, ...) to a tag.
    pub fn from_dtype(dtype: &str) -> Self {
        let lower = dtype.to_lowercase();
        match lower.as_str() {
            "number" => return ColumnType::Number,
            "string" => return ColumnType::String,
            "boolean" => return ColumnType::Boolean,
            "datetime" => return ColumnType::Datetime,
            _ => {}
        }
        if ["int", "float", "double"].iter().any(|k| lower.contains(k)) {
            ColumnType::Number
        } else if ["str", "string", "utf8"].iter().any(|k| lower.contains(k)) {
            ColumnType::String
        } else if lower.contains("bool") {
            ColumnType::Boolean
        } else if ["date", "time"].iter().any(|k| lower.contains(k)) {
            ColumnType::Datetime
        } else {
            ColumnType::String
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Number => "number",
            ColumnType::String => "string",
            ColumnType::Boolean => "boolean",
            ColumnType::Datetime => "datetime",
        }
    }
}

/// Whether a node was ingested directly or derived from other nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Root,
    Derived,
}

/// `(rows, cols)` of a node's data. `rows == None` marks a deferred computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(from = "(Option<u64>, u64)", into = "(Option<u64>, u64)")]
pub struct Shape {
    pub rows: Option<u64>,
    pub cols: u64,
}

impl Shape {
    pub fn new(rows: Option<u64>, cols: u64) -> Self {
        Shape { rows, cols }
    }

    pub fn is_resolved(&self) -> bool {
        self.rows.is_some()
    }
}

impl From<(Option<u64>, u64)> for Shape {
    fn from((rows, cols): (Option<u64>, u64)) -> Self {
        Shape { rows, cols }
    }
}

impl From<Shape> for (Option<u64>, u64) {
    fn from(shape: Shape) -> Self {
        (shape.rows, shape.cols)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rows {
            Some(rows) => write!(f, "{} x {}", rows, self.cols),
            None => write!(f, "? x {}", self.cols),
        }
    }
}

/// A single data artifact in the workspace graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub data_kind: DataKind,
    /// Server-side lineage label, e.g. `filter(sales)` or `load`.
    pub operation: Option<String>,
    pub columns: Vec<String>,
    pub schema: BTreeMap<String, ColumnType>,
    pub shape: Shape,
    pub is_lazy: bool,
    /// Only set for document-oriented frames.
    pub document_column: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, name: impl Into<String>, data_kind: DataKind) -> Self {
        Node {
            id: id.into(),
            name: name.into(),
            data_kind,
            operation: None,
            columns: Vec::new(),
            schema: BTreeMap::new(),
            shape: Shape::default(),
            is_lazy: data_kind.is_lazy(),
            document_column: None,
        }
    }

    /// Append a column, keeping `columns`, `schema` and `shape.cols` in step.
    pub fn with_column(mut self, name: &str, column_type: ColumnType) -> Self {
        if !self.schema.contains_key(name) {
            self.columns.push(name.to_string());
        }
        self.schema.insert(name.to_string(), column_type);
        self.shape.cols = self.columns.len() as u64;
        self
    }

    pub fn with_rows(mut self, rows: Option<u64>) -> Self {
        self.shape.rows = rows;
        self
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.schema.contains_key(column) || self.columns.iter().any(|c| c == column)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId(id)
    }
}

/// Directed lineage edge: `from` is a dependency of `to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
}

impl Edge {
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Edge {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Stable edge identifier, `from->to`.
    pub fn id(&self) -> String {
        format!("{}->{}", self.from, self.to)
    }
}

/// The nodes and edges of one workspace at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub workspace_id: WorkspaceId,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl GraphSnapshot {
    pub fn empty(workspace_id: WorkspaceId) -> Self {
        GraphSnapshot {
            workspace_id,
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.iter().any(|n| &n.id == id)
    }

    /// Node ids in snapshot order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }

    pub fn parents(&self, id: &NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|e| &e.to == id)
            .map(|e| e.from.clone())
            .collect()
    }

    pub fn children(&self, id: &NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|e| &e.from == id)
            .map(|e| e.to.clone())
            .collect()
    }

    /// Root if the node has no incoming edge, derived otherwise.
    pub fn role(&self, id: &NodeId) -> Option<NodeRole> {
        if !self.contains(id) {
            return None;
        }
        if self.edges.iter().any(|e| &e.to == id) {
            Some(NodeRole::Derived)
        } else {
            Some(NodeRole::Root)
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}
