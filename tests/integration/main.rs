//! Integration tests for Lineage
//!
//! These tests drive a whole session against the in-memory backend.

use lineage_client::providers::local::{Endpoint, LocalBackend, Table};
use lineage_client::*;
use lineage_core::{DataKind, NodeId};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

fn load_config() -> ClientConfig {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
base_url = "http://localhost:9000/api"
page_size = 2

[freshness]
graph_secs = 600

[retry]
base_delay_ms = 1
max_delay_ms = 2

[layout]
direction = "top_to_bottom"
"#
    )
    .unwrap();
    ClientConfig::load(Some(file.path())).unwrap()
}

fn applied_node(outcome: IntentOutcome) -> NodeId {
    match outcome {
        IntentOutcome::Mutation(MutationOutcome::Applied(receipt)) => receipt.node_id.unwrap(),
        other => panic!("expected an applied mutation, got {:?}", other),
    }
}

/// Load a file, derive a chain of nodes from it, then tear part of it down.
#[tokio::test]
async fn test_full_session_scenario() {
    let config = load_config();
    assert_eq!(config.page_size, 2);

    let sales = Table::new(
        &["id", "region", "amount", "note"],
        vec![
            vec![json!(1), json!("north"), json!("10.5"), json!("first tax refund")],
            vec![json!(2), json!("south"), json!("3"), json!("late")],
            vec![json!(3), json!("north"), json!("7.25"), json!("tax audit pending")],
        ],
    );
    let backend = Arc::new(LocalBackend::with_sample_data().with_file("sales.csv", sales));
    let session = Session::new(backend.clone(), Arc::new(BearerToken::new("secret")), &config);
    let mut events = session.subscribe();
    session.open().await.unwrap();

    let sales = applied_node(
        session
            .dispatch(Intent::RequestCreateFromFile {
                filename: "sales.csv".to_string(),
            })
            .await
            .unwrap(),
    );

    // Cast the text amounts to numbers so they can be filtered.
    session
        .dispatch(Intent::RequestCast {
            node_id: sales.clone(),
            spec: CastSpec::new("amount", CastTarget::Float),
        })
        .await
        .unwrap();

    let north = applied_node(
        session
            .dispatch(Intent::RequestFilter {
                node_id: sales.clone(),
                spec: FilterSpec {
                    conditions: vec![FilterCondition {
                        column: "region".to_string(),
                        operator: FilterOperator::Equals,
                        value: json!("north"),
                    }],
                    logic: FilterLogic::And,
                    new_node_name: Some("north".to_string()),
                },
            })
            .await
            .unwrap(),
    );

    let head = applied_node(
        session
            .dispatch(Intent::RequestSlice {
                node_id: north.clone(),
                spec: SliceSpec {
                    start_row: Some(0),
                    end_row: Some(1),
                    ..SliceSpec::default()
                },
            })
            .await
            .unwrap(),
    );

    session
        .dispatch(Intent::RequestConvert {
            node_id: sales.clone(),
            target: ConvertTarget::DocDataFrame {
                document_column: Some("note".to_string()),
            },
        })
        .await
        .unwrap();

    let matches = applied_node(
        session
            .dispatch(Intent::RequestDetach {
                node_id: sales.clone(),
                spec: DetachSpec::new("note", "tax"),
            })
            .await
            .unwrap(),
    );

    let view = session.view().await.unwrap();
    let rank = |id: &NodeId| view.ranks[id];
    assert_eq!(rank(&sales), 0);
    assert_eq!(rank(&north), 1);
    assert_eq!(rank(&head), 2);
    assert_eq!(rank(&matches), 1);
    // Top-to-bottom layout places deeper ranks lower.
    assert!(view.positions[&head].y > view.positions[&north].y);
    let converted = view.nodes.iter().find(|n| n.id == sales).unwrap();
    assert_eq!(converted.data_kind, DataKind::DocDataFrame);
    assert_eq!(converted.document_column.as_deref(), Some("note"));

    // Paging follows the configured page size.
    let opened = session
        .dispatch(Intent::OpenNode {
            node_id: north.clone(),
            page: 1,
        })
        .await
        .unwrap();
    match opened {
        IntentOutcome::Opened { page: Some(page), .. } => {
            assert_eq!(page.pagination.total_rows, 2);
            assert_eq!(page.data.len(), 2);
            assert!(!page.pagination.has_next);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    // Deleting the middle of the chain leaves the other branches intact.
    session
        .dispatch(Intent::SetSelection {
            node_ids: vec![north.clone(), matches.clone()],
        })
        .await
        .unwrap();
    session
        .dispatch(Intent::RequestDelete {
            node_id: north.clone(),
        })
        .await
        .unwrap();

    let view = session.view().await.unwrap();
    assert!(view.nodes.iter().all(|n| n.id != north));
    assert!(view.edges.iter().all(|e| e.from != north && e.to != north));
    assert_eq!(view.selected_ids, vec![matches.clone()]);
    assert_eq!(view.current_node, None);

    // The view's ids always equal the store's.
    let snapshot = session.store().load(&view.workspace_id).await.unwrap();
    let mut ids: Vec<_> = view.nodes.iter().map(|n| n.id.clone()).collect();
    ids.sort();
    assert_eq!(ids, snapshot.node_ids());
    assert_eq!(backend.snapshot(&view.workspace_id).await.unwrap().node_ids(), ids);

    let mut graph_changes = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::GraphChanged(_)) {
            graph_changes += 1;
        }
        assert!(!matches!(event, SessionEvent::MutationFailed { .. }));
    }
    // Initial load plus one per mutation.
    assert_eq!(graph_changes, 8);
    assert_eq!(backend.calls(Endpoint::Delete), 1);
}

#[tokio::test]
async fn test_backend_factory() {
    let config = ClientConfig::default();
    let session = Session::connect("local", &config, Arc::new(SingleUser)).unwrap();
    let workspace = session.open().await.unwrap();
    assert_eq!(session.view().await.unwrap().workspace_id, workspace);

    assert!(Session::connect("carrier-pigeon", &config, Arc::new(SingleUser)).is_err());
    assert!(Session::connect("http", &config, Arc::new(SingleUser)).is_ok());
}

#[tokio::test]
async fn test_http_backend_reports_unreachable_server() {
    let config = ClientConfig {
        base_url: "http://127.0.0.1:9/api".to_string(),
        request_timeout_secs: 2,
        retry: RetryConfig {
            read_retries: 0,
            ..RetryConfig::default()
        },
        ..ClientConfig::default()
    };
    let session = Session::connect("http", &config, Arc::new(BearerToken::new("t"))).unwrap();
    let err = session.open().await.unwrap_err();
    assert!(err.is_transient());
    assert!(!err.is_fatal(ErrorOrigin::Read));
}
