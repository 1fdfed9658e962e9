//! Filesystem watcher feeding the backend's reconciliation loop.
//!
//! notify delivers events on its own thread. The debouncer in front of it only coalesces the
//! raw event storm (a save is often several events); the per-path debounce that decides when
//! to reconcile lives in [`Backend::notify_path_changed`].
use notify_debouncer_full::{
    new_debouncer,
    notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, Debouncer, FileIdMap,
};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::runtime::Handle;

use crate::{backend::Backend, error::TreeError, fs::is_scannable, paths::os_path_to_string};

type NoteWatcher = Debouncer<RecommendedWatcher, FileIdMap>;

/// Raw-event coalescing window, well below the reconciliation debounce.
const EVENT_WINDOW: Duration = Duration::from_millis(50);

/// Workspace-relative path for an absolute event path, or None when it lies outside the
/// workspace or inside something the scanner skips.
fn workspace_path(root: &Path, path: &Path, backend: &Backend) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let relative = os_path_to_string(relative);
    let skipped = relative
        .split('/')
        .filter(|segment| !segment.is_empty())
        .any(|segment| !is_scannable(segment, backend.config()));
    (!skipped).then_some(relative)
}

/// Watches a workspace root for as long as it is alive.
pub struct WorkspaceWatcher {
    root: PathBuf,
    debouncer: NoteWatcher,
}

impl WorkspaceWatcher {
    /// Start watching `root`. Must be called from within a tokio runtime.
    pub fn new(root: &Path, backend: Backend) -> Result<WorkspaceWatcher, TreeError> {
        let root = root.canonicalize()?;
        let runtime = Handle::try_current().map_err(|e| {
            TreeError::Custom(format!("The watcher needs a tokio runtime: {e}"))
        })?;
        let event_root = root.clone();
        let mut debouncer = new_debouncer(EVENT_WINDOW, None, move |result: DebounceEventResult| {
            let events = match result {
                Ok(events) => events,
                Err(errors) => {
                    for error in errors {
                        tracing::error!("[WorkspaceWatcher] {}", TreeError::from(error));
                    }
                    return;
                }
            };
            let mut paths = BTreeSet::new();
            for event in events.iter() {
                if !matches!(
                    event.event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    continue;
                }
                for path in event.paths.iter() {
                    if let Some(path) = workspace_path(&event_root, path, &backend) {
                        paths.insert(path);
                    }
                }
            }
            if paths.is_empty() {
                return;
            }
            tracing::debug!("[WorkspaceWatcher] {} path(s) changed", paths.len());
            let _guard = runtime.enter();
            for path in paths {
                backend.notify_path_changed(&path);
            }
        })?;
        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;
        tracing::info!("[WorkspaceWatcher] watching {:?}", root);
        Ok(WorkspaceWatcher { root, debouncer })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for WorkspaceWatcher {
    fn drop(&mut self) {
        if let Err(e) = self.debouncer.watcher().unwatch(&self.root) {
            tracing::debug!("[WorkspaceWatcher] unwatch {:?}: {}", self.root, e);
        }
    }
}
