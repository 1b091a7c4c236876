//! Unit tests for lineage-core module

use crate::*;

fn sample_snapshot() -> GraphSnapshot {
    GraphSnapshot {
        workspace_id: WorkspaceId::from("ws-1"),
        nodes: vec![
            Node::new("a", "sales", DataKind::DataFrame)
                .with_column("id", ColumnType::Number)
                .with_column("region", ColumnType::String)
                .with_rows(Some(1000)),
            Node::new("b", "sales_filtered", DataKind::LazyFrame).with_column("id", ColumnType::Number),
            Node::new("c", "sales_sliced", DataKind::DataFrame).with_column("id", ColumnType::Number),
        ],
        edges: vec![Edge::new("a", "b"), Edge::new("a", "c")],
    }
}

#[test]
fn test_fan_out_ranks() {
    let snapshot = sample_snapshot();
    let ranks = compute_ranks(&snapshot.node_ids(), &snapshot.edges);

    insta::assert_json_snapshot!(ranks, @r###"
    {
      "a": 0,
      "b": 1,
      "c": 1
    }
    "###);
}

#[test]
fn test_layout_is_deterministic() {
    let snapshot = sample_snapshot();
    let config = LayoutConfig::default();

    let first = compute_layout(&snapshot.node_ids(), &snapshot.edges, &config);
    let mut reversed = snapshot.node_ids();
    reversed.reverse();
    let second = compute_layout(&reversed, &snapshot.edges, &config);
    assert_eq!(first, second);

    assert_eq!(first[&NodeId::from("a")], Position { x: 0.0, y: 0.0 });
    assert_eq!(first[&NodeId::from("b")], Position { x: 300.0, y: 0.0 });
    assert_eq!(first[&NodeId::from("c")], Position { x: 300.0, y: 150.0 });
}

#[test]
fn test_engine_skips_recompute_for_unchanged_signature() {
    let mut snapshot = sample_snapshot();
    let mut engine = LayoutEngine::new(LayoutConfig::default());

    let first = engine.layout(&snapshot);
    let again = engine.layout(&snapshot);
    assert_eq!(engine.recomputations(), 1);
    assert!(std::sync::Arc::ptr_eq(&first, &again));

    // Row counts resolving is not a display change
    snapshot.nodes[1].shape.rows = Some(42);
    engine.layout(&snapshot);
    assert_eq!(engine.recomputations(), 1);

    snapshot.nodes[1].document_column = Some("text".to_string());
    engine.layout(&snapshot);
    assert_eq!(engine.recomputations(), 2);

    snapshot.edges.push(Edge::new("b", "c"));
    let layout = engine.layout(&snapshot);
    assert_eq!(engine.recomputations(), 3);
    assert_eq!(layout.ranks[&NodeId::from("c")], 2);
}

#[test]
fn test_roles_from_incoming_edges() {
    let snapshot = sample_snapshot();
    assert_eq!(snapshot.role(&"a".into()), Some(NodeRole::Root));
    assert_eq!(snapshot.role(&"b".into()), Some(NodeRole::Derived));

    let graph = LineageGraph::from_snapshot(&snapshot).unwrap();
    assert_eq!(graph.roots(), vec![NodeId::from("a")]);
    assert_eq!(graph.leaves(), vec![NodeId::from("b"), NodeId::from("c")]);
    assert_eq!(graph.ranks(), compute_ranks(&snapshot.node_ids(), &snapshot.edges));
}

#[test]
fn test_wire_shapes_and_tags() {
    let shape: Shape = serde_json::from_str("[null, 5]").unwrap();
    assert_eq!(shape, Shape::new(None, 5));
    assert_eq!(serde_json::to_string(&Shape::new(Some(1000), 5)).unwrap(), "[1000,5]");

    let kind: DataKind = serde_json::from_str("\"docframe.DocLazyFrame\"").unwrap();
    assert!(kind.is_lazy() && kind.is_document());
    assert_eq!(DataKind::from_tag("something.Else"), DataKind::DataFrame);

    assert_eq!(ColumnType::from_dtype("Int64"), ColumnType::Number);
    assert_eq!(ColumnType::from_dtype("Utf8"), ColumnType::String);
    assert_eq!(ColumnType::from_dtype("Boolean"), ColumnType::Boolean);
    assert_eq!(ColumnType::from_dtype("Datetime(time_unit='us')"), ColumnType::Datetime);
    assert_eq!(ColumnType::from_dtype("number"), ColumnType::Number);
    assert_eq!(ColumnType::from_dtype("List(Null)"), ColumnType::String);
}

#[test]
fn test_selection_follows_topology() {
    let mut snapshot = sample_snapshot();
    let mut selection = SelectionManager::new();
    selection.set_all(vec![NodeId::from("c"), NodeId::from("a"), NodeId::from("b")]);

    snapshot.nodes.retain(|n| n.id.as_str() != "a");
    snapshot.edges.retain(|e| e.from.as_str() != "a");
    let removed = selection.retain_known(snapshot.nodes.iter().map(|n| &n.id));

    assert_eq!(removed, vec![NodeId::from("a")]);
    assert_eq!(selection.ids(), &[NodeId::from("c"), NodeId::from("b")]);
}
