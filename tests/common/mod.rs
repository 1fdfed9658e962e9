//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use notetree::config::WorkspaceConfig;
use std::path::Path;
use tempfile::TempDir;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times, subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Fast debounces so tests settle quickly. Watching stays off unless a test turns it on.
#[allow(dead_code)]
pub fn quick_config() -> WorkspaceConfig {
    WorkspaceConfig {
        watch: false,
        watch_debounce_ms: 20,
        write_debounce_ms: 10,
        parse_retry_delay_ms: 5,
        ..WorkspaceConfig::default()
    }
}

/// Create a small workspace: two linked notes in a folder, a tagged note at the root and a
/// data file.
#[allow(dead_code)]
pub fn create_test_workspace(temp_dir: &TempDir) -> &Path {
    let files = [
        ("Projects/Plan.md", "# Plan\n\nSee [[Idea]] and [[Someday]].\n"),
        ("Projects/Idea.md", "# Idea\n\n#project\n"),
        ("Journal.md", "Worked on [[Plan]] today. #project/alpha\n"),
        ("Data/settings.json", "{\"theme\": \"dark\"}"),
    ];
    write_files(temp_dir.path(), &files);
    temp_dir.path()
}

#[allow(dead_code)]
pub fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (path, contents) in files {
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, contents).unwrap();
    }
}
