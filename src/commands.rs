//! CLI command implementations

use lineage_client::{
    AuthProvider, BearerToken, ClientConfig, Intent, IntentOutcome, JoinHow, JoinSpec, MutationOutcome, Session,
    SessionEvent, SingleUser,
};
use lineage_core::{NodeId, NodeRole, WorkspaceId};
use std::sync::Arc;

fn auth_for(config: &ClientConfig) -> Arc<dyn AuthProvider> {
    match &config.api_token {
        Some(token) => Arc::new(BearerToken::new(token.clone())),
        None => Arc::new(SingleUser),
    }
}

async fn open_session(config: &ClientConfig, backend: &str) -> anyhow::Result<Session> {
    let session = Session::connect(backend, config, auth_for(config))?;
    let workspace = session.open().await?;
    tracing::info!("Workspace: {}", workspace);
    Ok(session)
}

fn report(outcome: IntentOutcome) {
    match outcome {
        IntentOutcome::Mutation(MutationOutcome::Applied(receipt)) => {
            let message = receipt.message.unwrap_or_else(|| "Done".to_string());
            match (receipt.node_id, receipt.node_name) {
                (Some(id), Some(name)) => println!("{} ({} {})", message, id, name),
                (Some(id), None) => println!("{} ({})", message, id),
                _ => println!("{}", message),
            }
        }
        IntentOutcome::Mutation(MutationOutcome::Skipped(reason)) | IntentOutcome::Skipped(reason) => {
            println!("Skipped: {}", reason)
        }
        IntentOutcome::Shape { node_id, shape } => println!("{}: {}", node_id, shape),
        IntentOutcome::Selection(ids) => println!("Selected: {}", join_ids(&ids)),
        IntentOutcome::Opened { node_id, page } => match page {
            Some(page) => println!("{}: {} rows", node_id, page.pagination.total_rows),
            None => println!("{}: superseded", node_id),
        },
    }
}

fn join_ids(ids: &[NodeId]) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
}

pub async fn workspaces(config: &ClientConfig, backend: &str) -> anyhow::Result<()> {
    let session = Session::connect(backend, config, auth_for(config))?;
    let current = session.store().current_workspace().await?;
    for workspace in session.store().workspaces().await?.iter() {
        let marker = if current.as_ref() == Some(&workspace.workspace_id) { "*" } else { " " };
        println!(
            "{} {:<12} {:<24} {} nodes",
            marker,
            workspace.workspace_id.as_str(),
            workspace.name,
            workspace.node_count
        );
    }
    Ok(())
}

pub async fn graph(config: &ClientConfig, backend: &str, workspace: Option<String>) -> anyhow::Result<()> {
    let session = Session::connect(backend, config, auth_for(config))?;
    match workspace {
        Some(id) => {
            session.attach(WorkspaceId::new(id)).await?;
        }
        None => {
            session.open().await?;
        }
    }
    print_graph(&session).await
}

async fn print_graph(session: &Session) -> anyhow::Result<()> {
    let view = session.view().await?;
    println!("Workspace {} ({} nodes, {} edges)", view.workspace_id, view.nodes.len(), view.edges.len());

    let mut nodes: Vec<_> = view.nodes.iter().collect();
    nodes.sort_by_key(|n| (view.ranks.get(&n.id).copied().unwrap_or(0), n.id.clone()));
    for node in nodes {
        let rank = view.ranks.get(&node.id).copied().unwrap_or(0);
        let role = if view.edges.iter().any(|e| e.to == node.id) {
            NodeRole::Derived
        } else {
            NodeRole::Root
        };
        let position = view
            .positions
            .get(&node.id)
            .map(|p| format!("({:.0}, {:.0})", p.x, p.y))
            .unwrap_or_default();
        println!(
            "  [{}] {:<10} {:<20} {:<13} {:<8} {:<12} {}",
            rank,
            node.id.as_str(),
            node.name,
            node.data_kind.tag(),
            format!("{:?}", role),
            node.shape.to_string(),
            position
        );
    }
    for edge in &view.edges {
        println!("  {} -> {}", edge.from, edge.to);
    }
    Ok(())
}

pub async fn shape(config: &ClientConfig, backend: &str, node: String) -> anyhow::Result<()> {
    let session = open_session(config, backend).await?;
    let outcome = session
        .dispatch(Intent::RequestResolveShape {
            node_id: NodeId::new(node),
        })
        .await?;
    report(outcome);
    Ok(())
}

pub async fn rename(config: &ClientConfig, backend: &str, node: String, name: String) -> anyhow::Result<()> {
    let session = open_session(config, backend).await?;
    let outcome = session
        .dispatch(Intent::RequestRename {
            node_id: NodeId::new(node),
            new_name: name,
        })
        .await?;
    report(outcome);
    Ok(())
}

pub async fn delete(config: &ClientConfig, backend: &str, node: String) -> anyhow::Result<()> {
    let session = open_session(config, backend).await?;
    let outcome = session
        .dispatch(Intent::RequestDelete {
            node_id: NodeId::new(node),
        })
        .await?;
    report(outcome);
    Ok(())
}

pub async fn join(config: &ClientConfig, backend: &str, spec: JoinSpec) -> anyhow::Result<()> {
    let session = open_session(config, backend).await?;
    let outcome = session.dispatch(Intent::RequestJoin { spec }).await?;
    report(outcome);
    print_graph(&session).await
}

/// Scripted walk through selection, join, shape resolution and delete.
pub async fn demo(config: &ClientConfig) -> anyhow::Result<()> {
    let session = open_session(config, "local").await?;
    let mut events = session.subscribe();
    print_graph(&session).await?;

    let view = session.view().await?;
    let by_name = |name: &str| {
        view.nodes
            .iter()
            .find(|n| n.name == name)
            .map(|n| n.id.clone())
            .ok_or_else(|| anyhow::anyhow!("Sample node '{}' is missing", name))
    };
    let customers = by_name("customers")?;
    let orders = by_name("orders")?;

    println!("\nSelecting {} and {}", customers, orders);
    session
        .dispatch(Intent::SetSelection {
            node_ids: vec![customers.clone(), orders.clone()],
        })
        .await?;

    println!("Joining on customer_id");
    let outcome = session
        .dispatch(Intent::RequestJoinSelected {
            left_on: "customer_id".to_string(),
            right_on: None,
            how: JoinHow::Inner,
            new_node_name: Some("customer_orders".to_string()),
        })
        .await?;
    let joined = match &outcome {
        IntentOutcome::Mutation(MutationOutcome::Applied(receipt)) => receipt.node_id.clone(),
        _ => None,
    };
    report(outcome);

    if let Some(joined) = joined {
        println!("Resolving the shape of {}", joined);
        report(session.dispatch(Intent::RequestResolveShape { node_id: joined }).await?);
    }

    println!("Deleting {}", orders);
    report(session.dispatch(Intent::RequestDelete { node_id: orders }).await?);

    println!();
    print_graph(&session).await?;

    println!("\nEvents:");
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::GraphChanged(diff) => println!(
                "  graph #{}: +{} -{} nodes, +{} -{} edges",
                diff.sequence,
                diff.added_nodes.len(),
                diff.removed_nodes.len(),
                diff.added_edges.len(),
                diff.removed_edges.len()
            ),
            SessionEvent::SelectionChanged(ids) => println!("  selection: [{}]", join_ids(&ids)),
            other => println!("  {:?}", other),
        }
    }
    Ok(())
}
