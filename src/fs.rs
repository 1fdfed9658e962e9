//! Raw filesystem access, addressed with workspace-relative `/`-separated paths.
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

use crate::{
    config::WorkspaceConfig,
    error::TreeError,
    node::{to_millis, Node, NodeKind, Timestamp, TAG_PREFIX},
    paths::{file_name, fold, join, os_path_to_string, parent, string_to_os_path},
    store::NodeTree,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub is_dir: bool,
    pub created: Timestamp,
    pub modified: Timestamp,
}

impl Stat {
    fn from_metadata(metadata: &std::fs::Metadata) -> Stat {
        let modified = metadata.modified().map(to_millis).unwrap_or_default();
        Stat {
            is_dir: metadata.is_dir(),
            created: metadata.created().map(to_millis).unwrap_or(modified),
            modified,
        }
    }
}

/// Names the scanner never descends into: ignored names, hidden files, and anything that
/// would shadow the tag namespace.
pub fn is_scannable(name: &str, config: &WorkspaceConfig) -> bool {
    !(name.starts_with('.') || name.starts_with(TAG_PREFIX) || config.is_ignored(name))
}

fn scanned_node(path: &str, stat: &Stat) -> Node {
    let kind = if stat.is_dir {
        NodeKind::Folder
    } else {
        NodeKind::for_file(file_name(path))
    };
    let mut node = Node::new(path, kind);
    node.created = stat.created;
    node.modified = stat.modified;
    node
}

/// Build a [`NodeTree`] rooted at `root` from a flat path -> stat listing.
pub fn tree_from_listing(root: &str, listing: &BTreeMap<String, Stat>) -> Option<NodeTree> {
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for path in listing.keys().filter(|path| path.as_str() != root) {
        children.entry(parent(path)).or_default().push(path);
    }
    build_tree(root, listing, &children)
}

fn build_tree(
    path: &str,
    listing: &BTreeMap<String, Stat>,
    children: &HashMap<&str, Vec<&str>>,
) -> Option<NodeTree> {
    let stat = listing.get(path)?;
    let mut tree = NodeTree::leaf(scanned_node(path, stat));
    if stat.is_dir {
        for child in children.get(path).into_iter().flatten() {
            if let Some(subtree) = build_tree(child, listing, children) {
                tree.children.push(subtree);
            }
        }
    }
    Some(tree)
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// None when nothing exists at `path`.
    async fn stat(&self, path: &str) -> Result<Option<Stat>, TreeError>;

    async fn read_file(&self, path: &str) -> Result<String, TreeError>;

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), TreeError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), TreeError>;

    /// Removes files and whole directories.
    async fn remove(&self, path: &str) -> Result<(), TreeError>;

    /// Entry names directly inside `path`.
    async fn read_dir(&self, path: &str) -> Result<Vec<String>, TreeError>;

    async fn create_dir_all(&self, path: &str) -> Result<(), TreeError>;

    /// The on-disk spelling of `path`, matched one segment at a time without regard to case.
    async fn real_path(&self, path: &str) -> Result<Option<String>, TreeError> {
        let mut real = String::new();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            let names = self.read_dir(&real).await?;
            let found = names
                .iter()
                .find(|name| name.as_str() == segment)
                .or_else(|| {
                    names
                        .iter()
                        .find(|name| fold(name, false) == fold(segment, false))
                });
            match found {
                Some(name) => real = join(&real, name),
                None => return Ok(None),
            }
        }
        Ok(Some(real))
    }

    /// The subtree at `path` as detached nodes, or None when it does not exist.
    async fn scan(
        &self,
        path: &str,
        config: &WorkspaceConfig,
    ) -> Result<Option<NodeTree>, TreeError> {
        let Some(stat) = self.stat(path).await? else {
            return Ok(None);
        };
        let mut listing = BTreeMap::new();
        listing.insert(path.to_string(), stat);
        let mut pending = vec![path.to_string()];
        while let Some(dir) = pending.pop() {
            for name in self.read_dir(&dir).await? {
                if !is_scannable(&name, config) {
                    continue;
                }
                let child = join(&dir, &name);
                if let Some(stat) = self.stat(&child).await? {
                    if stat.is_dir {
                        pending.push(child.clone());
                    }
                    listing.insert(child, stat);
                }
            }
        }
        Ok(tree_from_listing(path, &listing))
    }
}

/// [`FileSystem`] rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct DiskFs {
    root: PathBuf,
}

impl DiskFs {
    pub fn new<P: AsRef<Path>>(root: P) -> DiskFs {
        DiskFs {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.root.clone()
        } else {
            self.root.join(string_to_os_path(path))
        }
    }
}

#[async_trait]
impl FileSystem for DiskFs {
    async fn stat(&self, path: &str) -> Result<Option<Stat>, TreeError> {
        match tokio::fs::metadata(self.full_path(path)).await {
            Ok(metadata) => Ok(Some(Stat::from_metadata(&metadata))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_file(&self, path: &str) -> Result<String, TreeError> {
        Ok(tokio::fs::read_to_string(self.full_path(path)).await?)
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), TreeError> {
        let full_path = self.full_path(path);
        if let Some(dir) = full_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(full_path, contents).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TreeError> {
        let target = self.full_path(to);
        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::rename(self.full_path(from), target).await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), TreeError> {
        let full_path = self.full_path(path);
        let metadata = tokio::fs::metadata(&full_path).await?;
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(full_path).await?;
        } else {
            tokio::fs::remove_file(full_path).await?;
        }
        Ok(())
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<String>, TreeError> {
        let mut entries = tokio::fs::read_dir(self.full_path(path)).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), TreeError> {
        tokio::fs::create_dir_all(self.full_path(path)).await?;
        Ok(())
    }

    async fn scan(
        &self,
        path: &str,
        config: &WorkspaceConfig,
    ) -> Result<Option<NodeTree>, TreeError> {
        let start = self.full_path(path);
        let root = self.root.clone();
        let config = config.clone();
        let rel_root = path.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<NodeTree>, TreeError> {
            let mut listing = BTreeMap::new();
            let walker = WalkDir::new(&start)
                .follow_links(false)
                .into_iter()
                .filter_entry(|entry| {
                    entry.depth() == 0
                        || entry
                            .file_name()
                            .to_str()
                            .map(|name| is_scannable(name, &config))
                            .unwrap_or(false)
                });
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) if e.depth() == 0 => {
                        if e.io_error().map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) {
                            return Ok(None);
                        }
                        return Err(TreeError::Io(format!("scan of '{rel_root}' failed: {e}")));
                    }
                    Err(e) => {
                        tracing::warn!("[DiskFs::scan] skipping unreadable entry: {}", e);
                        continue;
                    }
                };
                let metadata = match entry.metadata() {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        tracing::warn!("[DiskFs::scan] no metadata for {:?}: {}", entry.path(), e);
                        continue;
                    }
                };
                let rel = os_path_to_string(entry.path().strip_prefix(&root)?);
                listing.insert(rel, Stat::from_metadata(&metadata));
            }
            Ok(tree_from_listing(&rel_root, &listing))
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disk_scan_skips_hidden_and_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("Folder/Sub")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("Folder/Sub/Note.md"), "x").unwrap();
        std::fs::write(dir.path().join("Top.md"), "y").unwrap();
        std::fs::write(dir.path().join(".hidden.md"), "z").unwrap();
        let fs = DiskFs::new(dir.path());
        let tree = fs
            .scan("", &WorkspaceConfig::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            tree.paths(),
            vec!["", "Folder", "Folder/Sub", "Folder/Sub/Note.md", "Top.md"]
        );
        let sub = fs.scan("Folder/Sub", &WorkspaceConfig::default()).await.unwrap().unwrap();
        assert_eq!(sub.paths(), vec!["Folder/Sub", "Folder/Sub/Note.md"]);
        assert!(fs.scan("Missing", &WorkspaceConfig::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_real_path_recovers_case() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("Folder")).unwrap();
        std::fs::write(dir.path().join("Folder/Note.md"), "x").unwrap();
        let fs = DiskFs::new(dir.path());
        assert_eq!(
            fs.real_path("folder/NOTE.md").await.unwrap().as_deref(),
            Some("Folder/Note.md")
        );
        assert_eq!(fs.real_path("folder/other.md").await.unwrap(), None);
    }
}
