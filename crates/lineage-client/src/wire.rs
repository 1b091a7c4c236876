//! JSON shapes returned by the workspace server and their conversion into core types

use crate::error::ClientResult;
use lineage_core::{ColumnType, DataKind, Edge, GraphSnapshot, Node, NodeId, Shape, WorkspaceId};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct WireGraph {
    #[serde(default)]
    nodes: Vec<WireNode>,
    #[serde(default)]
    edges: Vec<WireEdge>,
}

#[derive(Debug, Deserialize)]
struct WireNode {
    id: NodeId,
    #[serde(default)]
    data: WireNodeData,
}

/// Graph node payload. Older servers send `label`/`nodeType` instead of
/// `nodeName`/`dataType`, so both spellings are accepted.
#[derive(Debug, Default, Deserialize)]
struct WireNodeData {
    #[serde(rename = "nodeName")]
    node_name: Option<String>,
    label: Option<String>,
    #[serde(rename = "dataType")]
    data_type: Option<String>,
    #[serde(rename = "nodeType")]
    node_type: Option<String>,
    shape: Option<(Option<u64>, Option<u64>)>,
    #[serde(rename = "isLazy")]
    is_lazy: Option<bool>,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    dtypes: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    schema: BTreeMap<String, serde_json::Value>,
    document_column: Option<String>,
    operation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireEdge {
    source: NodeId,
    target: NodeId,
}

/// Descriptor returned by `GET /workspaces/{w}/nodes/{n}`.
#[derive(Debug, Deserialize)]
struct WireNodeInfo {
    id: NodeId,
    name: String,
    dtype: Option<String>,
    lazy: Option<bool>,
    operation: Option<String>,
    shape: Option<(Option<u64>, Option<u64>)>,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    schema: BTreeMap<String, serde_json::Value>,
    document_column: Option<String>,
}

fn schema_of(types: &BTreeMap<String, serde_json::Value>) -> BTreeMap<String, ColumnType> {
    types
        .iter()
        .map(|(column, dtype)| {
            let tag = match dtype {
                serde_json::Value::String(s) => ColumnType::from_dtype(s),
                other => ColumnType::from_dtype(&other.to_string()),
            };
            (column.clone(), tag)
        })
        .collect()
}

fn assemble(
    id: NodeId,
    name: String,
    data_kind: DataKind,
    is_lazy: Option<bool>,
    shape: Option<(Option<u64>, Option<u64>)>,
    columns: Vec<String>,
    schema: BTreeMap<String, ColumnType>,
) -> Node {
    let columns = if columns.is_empty() {
        schema.keys().cloned().collect()
    } else {
        columns
    };
    let (rows, cols) = shape.unwrap_or((None, None));
    let mut node = Node::new(id, name, data_kind);
    node.is_lazy = is_lazy.unwrap_or(data_kind.is_lazy());
    node.shape = Shape::new(rows, cols.unwrap_or(columns.len() as u64));
    node.columns = columns;
    node.schema = schema;
    node
}

/// Parse the graph endpoint's body.
pub fn snapshot_from_json(workspace: &WorkspaceId, body: serde_json::Value) -> ClientResult<GraphSnapshot> {
    let wire: WireGraph = serde_json::from_value(body)?;

    let nodes = wire
        .nodes
        .into_iter()
        .map(|n| {
            let d = n.data;
            let name = d
                .node_name
                .or(d.label)
                .unwrap_or_else(|| n.id.to_string());
            let kind = d
                .data_type
                .or(d.node_type)
                .map(|t| DataKind::from_tag(&t))
                .unwrap_or(DataKind::DataFrame);
            let types = if d.dtypes.is_empty() { &d.schema } else { &d.dtypes };
            let schema = schema_of(types);
            let mut node = assemble(n.id, name, kind, d.is_lazy, d.shape, d.columns, schema);
            node.document_column = d.document_column;
            node.operation = d.operation;
            node
        })
        .collect();

    let mut edges: Vec<Edge> = wire
        .edges
        .into_iter()
        .map(|e| Edge::new(e.source, e.target))
        .collect();
    edges.sort();
    edges.dedup();

    Ok(GraphSnapshot {
        workspace_id: workspace.clone(),
        nodes,
        edges,
    })
}

/// Parse a node descriptor.
pub fn node_from_json(body: serde_json::Value) -> ClientResult<Node> {
    let info: WireNodeInfo = serde_json::from_value(body)?;
    let kind = info
        .dtype
        .as_deref()
        .map(DataKind::from_tag)
        .unwrap_or(DataKind::DataFrame);
    let schema = schema_of(&info.schema);
    let mut node = assemble(info.id, info.name, kind, info.lazy, info.shape, info.columns, schema);
    node.document_column = info.document_column;
    node.operation = info.operation;
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_graph_payload() {
        let body = json!({
            "nodes": [
                {"id": "a", "data": {
                    "nodeName": "reviews", "dataType": "docframe.DocLazyFrame",
                    "shape": [null, 2], "isLazy": true,
                    "columns": ["text", "stars"],
                    "dtypes": {"text": "String", "stars": "Int64"},
                    "document_column": "text", "operation": "load"
                }},
                {"id": "b", "data": {"label": "top", "nodeType": "polars.DataFrame", "shape": [5, 2]}}
            ],
            "edges": [
                {"id": "a->b", "source": "a", "target": "b"},
                {"id": "a->b", "source": "a", "target": "b"}
            ]
        });
        let snapshot = snapshot_from_json(&"w".into(), body).unwrap();

        let a = snapshot.node(&"a".into()).unwrap();
        assert_eq!(a.name, "reviews");
        assert_eq!(a.data_kind, DataKind::DocLazyFrame);
        assert_eq!(a.shape, Shape::new(None, 2));
        assert_eq!(a.schema["stars"], ColumnType::Number);
        assert_eq!(a.document_column.as_deref(), Some("text"));

        let b = snapshot.node(&"b".into()).unwrap();
        assert_eq!(b.name, "top");
        assert!(!b.is_lazy);
        assert_eq!(b.shape.rows, Some(5));
        assert_eq!(snapshot.edges, vec![Edge::new("a", "b")]);
    }

    #[test]
    fn test_node_info_payload() {
        let body = json!({
            "id": "n", "name": "sales", "dtype": "polars.lazyframe.frame.LazyFrame",
            "lazy": true, "operation": null, "parent_ids": [], "child_ids": [],
            "shape": [1000, 2], "schema": {"amount": "Float64", "day": "Date"}
        });
        let node = node_from_json(body).unwrap();
        assert!(node.is_lazy);
        assert_eq!(node.shape, Shape::new(Some(1000), 2));
        assert_eq!(node.columns, vec!["amount".to_string(), "day".to_string()]);
        assert_eq!(node.schema["day"], ColumnType::Datetime);
    }

    #[test]
    fn test_malformed_graph_is_decode_error() {
        let err = snapshot_from_json(&"w".into(), json!({"nodes": [{"data": {}}]})).unwrap_err();
        assert!(matches!(err, crate::error::ClientError::Decode(_)));
    }
}
