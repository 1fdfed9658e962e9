//! notetree CLI tool
//!
//! Command-line interface for indexing and watching a note workspace.
//!
//! ## Commands
//!
//! - `scan <path>`: One-shot index with a summary of the tree
//! - `watch <path>`: Keep the index in sync and print every change
//! - `move <path> <from> <to>`: Move a note and rewrite the links pointing at it

use clap::{Parser, Subcommand};
use notetree::{commands::Op, config::WorkspaceConfig, node::NodeState, workspace::Workspace};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "notetree")]
#[command(author, version, about = "A tool for indexing and watching note workspaces", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a workspace once and display a summary
    Scan {
        /// Path to the workspace root
        path: PathBuf,

        /// List every node
        #[arg(short, long)]
        verbose: bool,
    },

    /// Watch a workspace and print every tree change
    Watch {
        /// Path to the workspace root
        path: PathBuf,
    },

    /// Move a file or folder, rewriting links that point into it
    Move {
        /// Path to the workspace root
        path: PathBuf,

        /// Workspace-relative source path
        from: String,

        /// Workspace-relative destination path
        to: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Scan { path, verbose } => {
                let mut config = WorkspaceConfig::load(&path)?;
                config.watch = false;
                let workspace = Workspace::open_with_config(&path, config).await?;
                let report = workspace.load_report().clone();
                let mirror = workspace.mirror();

                println!("\n=== Scan Results ===");
                println!("Nodes: {}", report.nodes);
                println!("Parsed: {}", report.indexed);
                println!("From cache: {}", report.cached);
                if verbose {
                    for path in mirror.paths() {
                        let Some(node) = mirror.get(&path) else {
                            continue;
                        };
                        let node = node.read();
                        let marker = match (node.is_virtual(), node.state) {
                            (false, _) => "",
                            (true, NodeState::Deleted) => " (deleted)",
                            (true, NodeState::Idle) => " (virtual)",
                        };
                        println!("{}{}", path, marker);
                    }
                }
                let mut messages = report.messages;
                messages.extend(workspace.close().await);
                for message in messages {
                    eprintln!("{message}");
                }
            }

            Commands::Watch { path } => {
                let mut config = WorkspaceConfig::load(&path)?;
                config.watch = true;
                let workspace = Workspace::open_with_config(&path, config).await?;
                let mirror = workspace.mirror();
                println!("Watching {:?}. Press Ctrl+C to stop.", workspace.root());

                loop {
                    tokio::select! {
                        change = mirror.next_change() => match change {
                            Some(change) => println!("[Change] {change}"),
                            None => break,
                        },
                        _ = tokio::signal::ctrl_c() => break,
                    }
                }
                for message in workspace.close().await {
                    eprintln!("{message}");
                }
            }

            Commands::Move { path, from, to } => {
                let mut config = WorkspaceConfig::load(&path)?;
                config.watch = false;
                let workspace = Workspace::open_with_config(&path, config).await?;
                let mirror = workspace.mirror();
                mirror.send(Op::Move { from: from.clone(), to: to.clone() }).await?;
                workspace.backend().watcher_idle().await;
                println!(
                    "Moved {} to {} ({} link(s) rewritten)",
                    from,
                    to,
                    workspace.backend().stats().link_rewrites
                );
                for message in workspace.close().await {
                    eprintln!("{message}");
                }
            }
        }
        Ok::<(), notetree::TreeError>(())
    })?;

    Ok(())
}
