//! Wiring for one open workspace: a disk-backed [`Backend`] serving commands on a background
//! task, an optional filesystem watcher, and any number of [`Mirror`]s connected to it.
//!
//! ```rust,no_run
//! use notetree::{commands::Op, workspace::Workspace};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), notetree::TreeError> {
//!     let workspace = Workspace::open("/path/to/notes").await?;
//!     let mirror = workspace.mirror();
//!     mirror
//!         .send(Op::Move {
//!             from: "Inbox/Idea.md".to_string(),
//!             to: "Projects/Idea.md".to_string(),
//!         })
//!         .await?;
//!     for message in workspace.close().await {
//!         eprintln!("{message}");
//!     }
//!     Ok(())
//! }
//! ```
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedSender},
    task::JoinHandle,
};

use crate::{
    backend::{Backend, LoadReport},
    cache::IndexCache,
    commands::CommandEnvelope,
    config::WorkspaceConfig,
    error::TreeError,
    fs::DiskFs,
    handle::ExternalDescriber,
    mirror::Mirror,
};

#[cfg(feature = "service")]
use crate::watch::WorkspaceWatcher;

pub struct Workspace {
    root: PathBuf,
    backend: Backend,
    commands: UnboundedSender<CommandEnvelope>,
    server: JoinHandle<()>,
    report: LoadReport,
    #[cfg(feature = "service")]
    watcher: Option<WorkspaceWatcher>,
}

impl Workspace {
    /// Open the workspace at `root` with the configuration stored inside it.
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Workspace, TreeError> {
        let config = WorkspaceConfig::load(root.as_ref())?;
        Workspace::open_with_config(root, config).await
    }

    #[tracing::instrument(skip_all)]
    pub async fn open_with_config<P: AsRef<Path>>(
        root: P,
        config: WorkspaceConfig,
    ) -> Result<Workspace, TreeError> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(TreeError::NotFound(format!(
                "Workspace root {root:?} is not a directory"
            )));
        }
        let fs = Arc::new(DiskFs::new(&root));
        let cache = match IndexCache::read(fs.as_ref(), &config.cache_file).await {
            Ok(cache) => cache,
            Err(e) => {
                tracing::warn!("[Workspace] ignoring unreadable index cache: {}", e);
                None
            }
        };
        let watch = config.watch;
        let backend = Backend::new(fs, config);
        let report = backend.load(cache).await;
        for message in report.messages.iter() {
            tracing::warn!("[Workspace] {}", message);
        }

        let (commands, rx) = unbounded_channel();
        let server = tokio::spawn(backend.clone().serve(rx));

        #[cfg(feature = "service")]
        let watcher = if watch {
            Some(WorkspaceWatcher::new(&root, backend.clone())?)
        } else {
            None
        };
        #[cfg(not(feature = "service"))]
        if watch {
            tracing::info!("[Workspace] built without the watcher, ignoring `watch = true`");
        }

        tracing::info!(
            "[Workspace] opened {:?}: {} nodes, {} parsed, {} from cache",
            root,
            report.nodes,
            report.indexed,
            report.cached
        );
        Ok(Workspace {
            root,
            backend,
            commands,
            server,
            report,
            #[cfg(feature = "service")]
            watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn load_report(&self) -> &LoadReport {
        &self.report
    }

    pub fn is_watching(&self) -> bool {
        #[cfg(feature = "service")]
        {
            self.watcher.is_some()
        }
        #[cfg(not(feature = "service"))]
        {
            false
        }
    }

    /// A new mirror, primed with the current tree.
    pub fn mirror(&self) -> Mirror {
        self.mirror_with_describer(None)
    }

    pub fn mirror_with_describer(&self, describer: Option<Arc<dyn ExternalDescriber>>) -> Mirror {
        let mirror = Mirror::with_describer(
            self.backend.subscribe(),
            self.commands.clone(),
            self.backend.config().clone(),
            describer,
        );
        mirror.sync_pending();
        mirror
    }

    /// Stop watching, flush pending saves and persist the index cache. Returns the problems
    /// worth reporting to a user.
    pub async fn close(self) -> Vec<String> {
        #[cfg(feature = "service")]
        drop(self.watcher);
        let messages = self.backend.close().await;
        self.server.abort();
        messages
    }
}
