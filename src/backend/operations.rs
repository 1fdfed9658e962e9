//! Command surface of the backend: loading, file and folder creation, copy, delete and
//! content or metadata updates. Moves live in `rename`.
use serde_json::Value;

use super::{Backend, LoadReport};
use crate::{
    cache::IndexCache,
    commands::{ContentUpdate, Op, OpResult},
    content::Content,
    delta::ChangeBuilder,
    error::TreeError,
    node::{node_ref, DataKind, Node, NodeKind, NodeRef, Timestamp, TAG_PREFIX},
    patch::apply_merge_patch,
    paths::{normalize, parent, rebase},
};

impl Backend {
    /// Scan the workspace into the store and index every content file, reusing `cache`
    /// entries whose modification time still matches.
    #[tracing::instrument(skip_all)]
    pub async fn load(&self, cache: Option<IndexCache>) -> LoadReport {
        let mut report = LoadReport::default();
        let tree = match self.inner.fs.scan("", &self.inner.config).await {
            Ok(Some(tree)) => tree,
            Ok(None) => {
                report
                    .messages
                    .push("Workspace root does not exist".to_string());
                return report;
            }
            Err(e) => {
                report.messages.push(format!("Could not scan workspace: {e}"));
                return report;
            }
        };

        let content_files: Vec<(String, Timestamp)> = {
            let mut state = self.inner.state.lock();
            let mut builder = ChangeBuilder::new();
            let integrated = state.store.integrate(tree, |existing, incoming| match (existing, incoming) {
                (Some(existing), Some(incoming)) => {
                    let mut node = existing.write();
                    if !node.is_root() {
                        node.created = incoming.created;
                        node.modified = incoming.modified;
                    }
                    drop(node);
                    Some(existing.clone())
                }
                (None, Some(incoming)) => Some(node_ref(incoming.clone())),
                (Some(existing), None) if existing.read().is_virtual() => Some(existing.clone()),
                _ => None,
            });
            match integrated {
                Ok(integration) => builder.integration(&integration),
                Err(e) => report.messages.push(format!("Could not build the tree: {e}")),
            }
            self.emit(builder);
            state
                .store
                .iter()
                .into_iter()
                .filter_map(|node| {
                    let node = node.read();
                    (!node.is_virtual() && node.kind.has_content())
                        .then(|| (node.path.clone(), node.modified))
                })
                .collect()
        };

        for (path, modified) in content_files {
            if let Some(entry) = cache.as_ref().and_then(|cache| cache.fresh(&path, modified)) {
                self.apply_cached(&path, entry);
                report.cached += 1;
                continue;
            }
            match self.index_file(&path).await {
                Ok(true) => report.indexed += 1,
                Ok(false) => {}
                Err(e) => report.messages.push(format!("Could not index '{path}': {e}")),
            }
        }
        report.nodes = self.inner.state.lock().store.len();
        tracing::info!(
            "[Backend] loaded {} nodes ({} parsed, {} from cache)",
            report.nodes,
            report.indexed,
            report.cached
        );
        report
    }

    pub async fn execute(&self, op: Op) -> Result<OpResult, TreeError> {
        let node = match op {
            Op::CreateFile { path, contents } => self.create_file(&path, contents).await?,
            Op::CreateFolder(path) => self.create_folder(&path).await?,
            Op::Move { from, to } => self.move_node(&from, &to).await?,
            Op::Copy { from, to } => self.copy(&from, &to).await?,
            Op::Delete(path) => match self.delete(&path).await? {
                Some(tombstone) => tombstone,
                None => return Ok(OpResult::Ok),
            },
            Op::UpdateFileContents { path, update } => {
                self.update_file_contents(&path, update).await?
            }
            Op::UpdateMetadata { path, patch } => self.update_metadata(&path, &patch)?,
            Op::EnsureFolderExists { path, is_virtual } => {
                self.ensure_folder_exists(&path, is_virtual).await?
            }
        };
        let snapshot = node.read().snapshot();
        Ok(OpResult::Node(snapshot))
    }

    fn check_creatable(&self, path: &str) -> Result<(), TreeError> {
        if path.is_empty() || path.starts_with(TAG_PREFIX) {
            return Err(TreeError::Command(format!("Cannot create '{path}'")));
        }
        let state = self.inner.state.lock();
        if let Some(existing) = state.store.get(path) {
            if !existing.read().is_virtual() {
                return Err(TreeError::PathCollision(path.to_string()));
            }
        }
        let mut ancestor = parent(path);
        loop {
            if let Some(node) = state.store.get(ancestor) {
                if !node.read().kind.is_container() {
                    return Err(TreeError::InvalidParent(path.to_string()));
                }
                return Ok(());
            }
            ancestor = parent(ancestor);
        }
    }

    /// Create a file on disk and in the tree. A virtual node at `path` is promoted in place,
    /// keeping its identity and in-links.
    #[tracing::instrument(skip(self, contents))]
    pub async fn create_file(&self, path: &str, contents: Option<String>) -> Result<NodeRef, TreeError> {
        let path = normalize(path);
        self.check_creatable(&path)?;
        let kind = NodeKind::for_path(&path);
        let text = match (contents, &kind) {
            (Some(text), _) => text,
            (None, NodeKind::Data { kind: DataKind::Json }) => "{}".to_string(),
            (None, _) => String::new(),
        };
        self.inner.fs.write_file(&path, &text).await?;
        let stat = self
            .inner
            .fs
            .stat(&path)
            .await?
            .ok_or_else(|| TreeError::NotFound(path.clone()))?;

        let node = {
            let mut state = self.inner.state.lock();
            let mut builder = ChangeBuilder::new();
            let (_, created) =
                state
                    .store
                    .ensure_folder_exists(parent(&path), |_, name| Node::folder(name), false)?;
            for folder in created {
                builder.add(folder);
            }
            self.promote_ancestors(&mut state, &path, &mut builder);
            let node = match state.store.get(&path) {
                Some(existing) if existing.read().is_virtual() => {
                    existing.write().promote(stat.created, stat.modified);
                    builder.change(existing.clone());
                    existing
                }
                Some(_) => return Err(TreeError::PathCollision(path)),
                None => {
                    let mut node = Node::new(&path, kind);
                    node.created = stat.created;
                    node.modified = stat.modified;
                    let node = state.store.add(node)?;
                    builder.add(node.clone());
                    node
                }
            };
            self.inner.content.mark_restored(&path);
            self.emit(builder);
            node
        };
        self.index_file(&path).await?;
        Ok(node)
    }

    pub async fn create_folder(&self, path: &str) -> Result<NodeRef, TreeError> {
        let path = normalize(path);
        self.check_creatable(&path)?;
        self.ensure_folder_exists(&path, false).await
    }

    /// Make sure a folder chain exists. Real folders are created on disk and promote any
    /// virtual folders along the way; virtual folders only exist in the tree.
    pub async fn ensure_folder_exists(&self, path: &str, is_virtual: bool) -> Result<NodeRef, TreeError> {
        let path = normalize(path);
        if !is_virtual {
            self.inner.fs.create_dir_all(&path).await?;
        }
        let mut state = self.inner.state.lock();
        let mut builder = ChangeBuilder::new();
        let (folder, created) = state.store.ensure_folder_exists(
            &path,
            |_, name| {
                if name.starts_with(TAG_PREFIX) {
                    Node::placeholder(name, NodeKind::Tag)
                } else {
                    Node::folder(name)
                }
            },
            is_virtual,
        )?;
        for node in created {
            builder.add(node);
        }
        if !is_virtual {
            self.promote_folders(&mut state, &path, &mut builder);
        }
        self.emit(builder);
        Ok(folder)
    }

    /// Copy a file or folder on disk and pick the copy up through reconciliation.
    #[tracing::instrument(skip(self))]
    pub async fn copy(&self, from: &str, to: &str) -> Result<NodeRef, TreeError> {
        let (from, to) = (normalize(from), normalize(to));
        {
            let state = self.inner.state.lock();
            let source = state
                .store
                .get(&from)
                .ok_or_else(|| TreeError::NotFound(from.clone()))?;
            if source.read().is_virtual() {
                return Err(TreeError::Command(format!(
                    "Cannot copy virtual node '{from}'"
                )));
            }
        }
        self.check_creatable(&to)?;
        let tree = self
            .inner
            .fs
            .scan(&from, &self.inner.config)
            .await?
            .ok_or_else(|| TreeError::NotFound(from.clone()))?;
        let mut pending = vec![tree];
        while let Some(tree) = pending.pop() {
            let Some(target) = rebase(&tree.node.path, &from, &to) else {
                continue;
            };
            if tree.node.kind.is_folder() {
                self.inner.fs.create_dir_all(&target).await?;
            } else {
                let text = self.inner.fs.read_file(&tree.node.path).await?;
                self.inner.fs.write_file(&target, &text).await?;
            }
            pending.extend(tree.children);
        }
        self.reconcile(&to).await?;
        self.get(&to).ok_or_else(|| TreeError::NotFound(to))
    }

    /// Delete from disk. Returns the tombstone when something still refers into the deleted
    /// subtree, None when it was removed outright.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, path: &str) -> Result<Option<NodeRef>, TreeError> {
        let path = normalize(path);
        let node = self
            .get(&path)
            .ok_or_else(|| TreeError::NotFound(path.clone()))?;
        {
            let node = node.read();
            if node.is_root() {
                return Err(TreeError::Command("Cannot delete the workspace root".to_string()));
            }
            if node.is_virtual() {
                return Err(TreeError::Command(format!(
                    "Cannot delete virtual node '{path}'"
                )));
            }
        }
        let _locks = self.inner.content.lock_subtree(&path).await;
        match self.inner.fs.remove(&path).await {
            Ok(()) | Err(TreeError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let mut state = self.inner.state.lock();
        let mut builder = ChangeBuilder::new();
        let kept = self.retire_subtree(&mut state, &path, false, &mut builder);
        self.emit(builder);
        Ok(kept)
    }

    /// Replace text or merge-patch structured content. The write is debounced; once it lands
    /// the node is promoted (if virtual) and re-indexed.
    pub async fn update_file_contents(
        &self,
        path: &str,
        update: ContentUpdate,
    ) -> Result<NodeRef, TreeError> {
        let path = normalize(path);
        let node = self
            .get(&path)
            .ok_or_else(|| TreeError::NotFound(path.clone()))?;
        let (is_virtual, kind) = {
            let node = node.read();
            (node.is_virtual(), node.kind.clone())
        };
        let data_kind = match kind {
            NodeKind::Data { kind } => Some(kind),
            NodeKind::File { .. } => None,
            _ => {
                return Err(TreeError::Command(format!(
                    "'{path}' has no file content"
                )))
            }
        };
        let handle = if is_virtual {
            self.inner.content.mark_restored(&path);
            self.inner.content.create(&path, None)
        } else {
            self.inner.content.open(&path).await?
        };
        match update {
            ContentUpdate::Text(text) => handle.set(Content::parse(data_kind, &text)?)?,
            ContentUpdate::Patch(patch) => handle.apply_patch(&patch)?,
        }
        Ok(node)
    }

    /// Merge `patch` into the node's opaque metadata.
    pub fn update_metadata(&self, path: &str, patch: &Value) -> Result<NodeRef, TreeError> {
        let mut state = self.inner.state.lock();
        let node = state
            .store
            .get(path)
            .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
        let mut extra = Value::Object(node.read().meta.extra.clone());
        apply_merge_patch(&mut extra, patch);
        let Value::Object(extra) = extra else {
            return Err(TreeError::Command(
                "Metadata patch must produce an object".to_string(),
            ));
        };
        let changed = {
            let mut node = node.write();
            if node.meta.extra != extra {
                node.meta.extra = extra;
                true
            } else {
                false
            }
        };
        let mut builder = ChangeBuilder::new();
        if changed {
            builder.change(node.clone());
        }
        self.emit(builder);
        drop(state);
        Ok(node)
    }
}
