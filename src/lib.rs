//! # notetree
//!
//! A live, hierarchical index of a note workspace: every folder, file, tag and link target
//! becomes a node in one tree, kept in sync with the disk and with any number of views.
//!
//! ## Overview
//!
//! notetree scans a workspace directory into a [`store::NodeStore`], parses notes for links,
//! headers and tags, and derives a bidirectional link graph from them. Link targets that do
//! not exist yet become **virtual** nodes (placeholders) so that they can be browsed, linked
//! to and later promoted into real files.
//!
//! ### Key Features
//!
//! - **Incremental sync**: every mutation is published as a [`delta::TreeChange`] that views
//!   apply to their own replica in order
//! - **Virtual nodes**: placeholders for unresolved link targets and tombstones for deleted
//!   files that are still referenced, garbage-collected once nothing points at them
//! - **Rename propagation**: moving a note rewrites the links that point at it
//! - **Watcher reconciliation**: external edits are debounced per path and folded back into
//!   the tree
//! - **Reactive link handles**: views hold [`handle::LinkHandle`]s that re-resolve only when
//!   a change could have affected them
//!
//! ## Architecture
//!
//! - **[`backend`]**: the authoritative [`backend::Backend`] and its command surface
//! - **[`mirror`]**: a view-side replica fed by the change stream
//! - **[`handle`]**: reactive link resolution on top of a mirror
//! - **[`store`]**: the path-indexed node tree shared by both sides
//! - **[`links`]** / **[`parser`]**: link resolution, rendering and content parsing
//! - **[`content`]**: open file contents with debounced saving
//! - **[`workspace`]**: wiring a disk-backed backend, a watcher and mirrors together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use notetree::{node::LinkForm, workspace::Workspace};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workspace = Workspace::open("./notes").await?;
//!     let mirror = workspace.mirror();
//!
//!     let handle = mirror.link_handle("Daily/Today.md", "Project Plan", LinkForm::Wiki);
//!     println!("[[Project Plan]] -> {}", handle.get());
//!
//!     for message in workspace.close().await {
//!         eprintln!("{message}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **default**: `service`
//! - **service**: filesystem watching (`notify`, `notify-debouncer-full`)
//! - **bin**: the `notetree` command line tool

pub mod backend;
pub mod cache;
pub mod commands;
pub mod config;
pub mod content;
pub mod delta;
pub mod error;
pub mod fs;
pub mod handle;
pub mod links;
pub mod mirror;
pub mod node;
pub mod parser;
pub mod patch;
pub mod paths;
pub mod store;
pub mod tasks;
#[cfg(test)]
mod tests;
#[cfg(feature = "service")]
pub mod watch;
pub mod workspace;

pub use error::*;
