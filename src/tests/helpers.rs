//! Shared test utilities for backend and store testing

use crate::{
    backend::Backend,
    config::WorkspaceConfig,
    fs::DiskFs,
    node::{Node, NodeKind},
    paths::parent,
    store::NodeStore,
};
use std::{path::Path, sync::Arc};
use tempfile::TempDir;

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Configuration with short debounces and no watcher, so tests drive reconciliation
/// explicitly.
pub fn test_config() -> WorkspaceConfig {
    WorkspaceConfig {
        watch: false,
        watch_debounce_ms: 20,
        write_debounce_ms: 10,
        parse_retry_delay_ms: 5,
        ..Default::default()
    }
}

/// Write `files` below `root`, creating parent directories.
pub fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (path, text) in files {
        let full = root.join(path);
        if let Some(dir) = full.parent() {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(full, text).unwrap();
    }
}

/// A temp workspace holding `files`, loaded into a fresh backend.
pub async fn loaded_backend(files: &[(&str, &str)]) -> (TempDir, Backend) {
    init_logging();
    let dir = TempDir::new().unwrap();
    write_files(dir.path(), files);
    let backend = Backend::new(Arc::new(DiskFs::new(dir.path())), test_config());
    let report = backend.load(None).await;
    assert!(report.messages.is_empty(), "load failed: {:?}", report.messages);
    (dir, backend)
}

pub fn read(dir: &TempDir, path: &str) -> String {
    std::fs::read_to_string(dir.path().join(path)).unwrap()
}

/// A store holding real files at `paths`, with folders created along the way.
pub fn store_with(paths: &[&str]) -> NodeStore {
    let mut store = NodeStore::new(true);
    for path in paths {
        store
            .ensure_folder_exists(parent(path), |_, name| Node::folder(name), false)
            .unwrap();
        store.add(Node::new(path, NodeKind::for_path(path))).unwrap();
    }
    store
}
