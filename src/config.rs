use crate::{error::TreeError, links::LinkStyleKind};
use serde::{Deserialize, Serialize};
use std::{
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
    time::Duration,
};

/// Directory (relative to the workspace root) holding config and the index cache.
pub const STATE_DIR: &str = ".notetree";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Path comparison mode for the whole workspace.
    pub case_sensitive: bool,
    /// Extension given to link targets written without one.
    pub note_extension: String,
    /// Extensions recognized when deciding whether an href already names a file type.
    pub known_extensions: Vec<String>,
    pub watch: bool,
    pub watch_debounce_ms: u64,
    pub write_debounce_ms: u64,
    pub parse_retry_limit: u32,
    pub parse_retry_delay_ms: u64,
    pub link_style: LinkStyleKind,
    /// File or folder names skipped by scanning and watching.
    pub ignore: Vec<String>,
    /// Index cache location relative to the workspace root.
    pub cache_file: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        WorkspaceConfig {
            case_sensitive: cfg!(target_os = "linux"),
            note_extension: "md".to_string(),
            known_extensions: [
                "md", "markdown", "txt", "json", "toml", "png", "jpg", "jpeg", "gif", "svg",
                "webp", "pdf", "mp3", "mp4", "canvas",
            ]
            .iter()
            .map(|ext| ext.to_string())
            .collect(),
            watch: true,
            watch_debounce_ms: 500,
            write_debounce_ms: 250,
            parse_retry_limit: 3,
            parse_retry_delay_ms: 100,
            link_style: LinkStyleKind::default(),
            ignore: vec![".git".to_string(), STATE_DIR.to_string()],
            cache_file: format!("{STATE_DIR}/index.json"),
        }
    }
}

impl WorkspaceConfig {
    /// Reads `<root>/.notetree/config.toml`, falling back to defaults when absent.
    pub fn load(root: &Path) -> Result<WorkspaceConfig, TreeError> {
        let path = Self::config_path(root);
        tracing::debug!("Attempting to read workspace config from: {:?}", &path);
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(WorkspaceConfig::default());
        }
        let content = read_to_string(&path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save(&self, root: &Path) -> Result<(), TreeError> {
        let path = Self::config_path(root);
        tracing::debug!("Attempting to write workspace config to: {:?}", &path);
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        write(&path, toml::to_string(self)?)?;
        Ok(())
    }

    pub fn config_path(root: &Path) -> PathBuf {
        root.join(STATE_DIR).join(CONFIG_FILE)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    pub fn write_debounce(&self) -> Duration {
        Duration::from_millis(self.write_debounce_ms)
    }

    pub fn parse_retry_delay(&self) -> Duration {
        Duration::from_millis(self.parse_retry_delay_ms)
    }

    pub fn is_known_extension(&self, ext: &str) -> bool {
        self.known_extensions
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext))
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignore.iter().any(|ignored| ignored == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trips_through_state_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = WorkspaceConfig {
            case_sensitive: false,
            watch_debounce_ms: 20,
            link_style: LinkStyleKind::Relative,
            ..Default::default()
        };
        config.save(dir.path()).unwrap();
        let loaded = WorkspaceConfig::load(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(STATE_DIR)).unwrap();
        std::fs::write(
            WorkspaceConfig::config_path(dir.path()),
            "note_extension = \"markdown\"\n",
        )
        .unwrap();
        let loaded = WorkspaceConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.note_extension, "markdown");
        assert_eq!(loaded.watch_debounce_ms, 500);
        assert!(loaded.is_ignored(".git"));
    }
}
