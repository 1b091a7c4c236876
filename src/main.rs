//! Lineage CLI entry point

use clap::{Parser, Subcommand};
use lineage_client::{JoinHow, JoinSpec};
use lineage_core::NodeId;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "lineage")]
#[command(about = "Browse and edit a workspace's data lineage graph", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend API base URL, overriding the config file
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Use an in-memory backend seeded with sample data
    #[arg(long, global = true)]
    offline: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List workspaces
    Workspaces,
    /// Print the graph with ranks and positions
    Graph {
        /// Workspace id (defaults to the current workspace)
        #[arg(short, long)]
        workspace: Option<String>,
    },
    /// Resolve the exact shape of a node
    Shape { node: String },
    /// Rename a node
    Rename { node: String, name: String },
    /// Delete a node
    Delete { node: String },
    /// Join two nodes into a new node
    Join {
        left: String,
        right: String,
        /// Key column on the left node
        #[arg(long)]
        on: String,
        /// Key column on the right node (defaults to --on)
        #[arg(long)]
        right_on: Option<String>,
        /// inner, left, right, full, semi, anti or cross
        #[arg(long, default_value = "inner")]
        how: String,
        /// Name of the joined node
        #[arg(long)]
        name: Option<String>,
    },
    /// Run a scripted session against the in-memory backend
    Demo,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!("lineage={}", log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = lineage_client::ClientConfig::load(cli.config.as_deref())?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
        config.validate()?;
    }

    let backend = if cli.offline { "local" } else { "http" };
    match cli.command {
        Commands::Workspaces => commands::workspaces(&config, backend).await,
        Commands::Graph { workspace } => commands::graph(&config, backend, workspace).await,
        Commands::Shape { node } => commands::shape(&config, backend, node).await,
        Commands::Rename { node, name } => commands::rename(&config, backend, node, name).await,
        Commands::Delete { node } => commands::delete(&config, backend, node).await,
        Commands::Join {
            left,
            right,
            on,
            right_on,
            how,
            name,
        } => {
            let spec = JoinSpec {
                left: NodeId::new(left),
                right: NodeId::new(right),
                right_on: right_on.unwrap_or_else(|| on.clone()),
                left_on: on,
                how: JoinHow::parse(&how),
                new_node_name: name,
            };
            commands::join(&config, backend, spec).await
        }
        Commands::Demo => commands::demo(&config).await,
        Commands::Version => {
            println!("Lineage v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
