//! Watcher reconciliation.
//!
//! Each path moves `quiet -> dirty -> reconciling -> quiet`. An event (re)starts the path's
//! debounce timer; only the timer whose generation is still current performs the pass, so a
//! burst of writes collapses into one reconciliation.
use std::collections::HashSet;
use tokio::sync::watch;

use super::{Backend, DirtyEntry};
use crate::{
    delta::ChangeBuilder,
    error::TreeError,
    node::{node_ref, NodeRef},
    paths::{contains, join, normalize, parent},
};

impl Backend {
    /// Record a filesystem event at `path`. The returned receiver flips to `true` once the
    /// debounced reconciliation pass covering this event has finished.
    pub fn notify_path_changed(&self, path: &str) -> watch::Receiver<bool> {
        let path = normalize(path);
        let (key, generation, settled) = {
            let mut state = self.inner.state.lock();
            let key = state.store.key(&path);
            let entry = state.dirty.entry(key.clone()).or_insert_with(|| DirtyEntry {
                generation: 0,
                settled: watch::channel(false).0,
            });
            entry.generation += 1;
            (key, entry.generation, entry.settled.subscribe())
        };
        tracing::trace!("[Backend] {} dirty (generation {})", path, generation);

        let backend = self.clone();
        let delay = self.inner.config.watch_debounce();
        self.inner.tasks.spawn(format!("reconcile {path}"), async move {
            tokio::time::sleep(delay).await;
            let current = {
                let mut state = backend.inner.state.lock();
                match state.dirty.get(&key) {
                    Some(entry) if entry.generation == generation => {
                        state.dirty.remove(&key).map(|entry| entry.settled)
                    }
                    _ => None,
                }
            };
            // A later event restarted the timer
            let Some(settled) = current else {
                return Ok(());
            };
            let result = backend.reconcile(&path).await;
            settled.send_replace(true);
            result
        });
        settled
    }

    /// Bring the subtree at `path` in line with what is on disk right now.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self, path: &str) -> Result<(), TreeError> {
        let path = normalize(path);
        let stat = match self.inner.fs.stat(&path).await {
            Ok(stat) => stat,
            Err(e) => {
                tracing::warn!("[Backend] cannot stat {}, treating it as gone: {}", path, e);
                None
            }
        };
        let result = match stat {
            None => {
                self.reconcile_missing(&path);
                Ok(())
            }
            Some(_) => self.reconcile_present(path).await,
        };
        self.inner.state.lock().stats.reconcile_passes += 1;
        result
    }

    fn reconcile_missing(&self, path: &str) {
        let mut state = self.inner.state.lock();
        let Some(node) = state.store.get(path) else {
            return;
        };
        if node.read().is_virtual() {
            return;
        }
        let mut builder = ChangeBuilder::new();
        self.retire_subtree(&mut state, path, false, &mut builder);
        self.emit(builder);
    }

    /// Move nodes whose cached spelling differs from the on-disk one. Only meaningful on a
    /// case-insensitive workspace.
    fn recase(&self, real: &str) {
        let mut state = self.inner.state.lock();
        let mut builder = ChangeBuilder::new();
        let mut prefix = String::new();
        for segment in real.split('/').filter(|segment| !segment.is_empty()) {
            prefix = join(&prefix, segment);
            let Some(node) = state.store.get(&prefix) else {
                break;
            };
            let (current, is_virtual) = {
                let node = node.read();
                (node.path.clone(), node.is_virtual())
            };
            if current == prefix {
                continue;
            }
            match self.relocate(&mut state, &current, &prefix, !is_virtual, &mut builder) {
                Ok(_) => {
                    tracing::info!("[Backend] re-cased {} to {}", current, prefix);
                    self.inner.content.rename(&current, &prefix);
                }
                Err(e) => tracing::warn!("[Backend] cannot re-case {}: {}", current, e),
            }
        }
        self.emit(builder);
    }

    async fn reconcile_present(&self, mut path: String) -> Result<(), TreeError> {
        if !self.inner.config.case_sensitive {
            if let Some(real) = self.inner.fs.real_path(&path).await? {
                self.recase(&real);
                path = real;
            }
        }

        // Integrate from the outermost path the store does not know yet
        let scan_root = {
            let state = self.inner.state.lock();
            let mut candidate = path.clone();
            while !candidate.is_empty() && !state.store.contains(parent(&candidate)) {
                candidate = parent(&candidate).to_string();
            }
            candidate
        };
        let Some(tree) = self.inner.fs.scan(&scan_root, &self.inner.config).await? else {
            self.reconcile_missing(&scan_root);
            return Ok(());
        };

        let mut reindex: Vec<String> = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let mut builder = ChangeBuilder::new();
            self.promote_ancestors(&mut state, &scan_root, &mut builder);

            let mut changed: Vec<NodeRef> = Vec::new();
            let mut replaced: Vec<NodeRef> = Vec::new();
            let mut missing: Vec<String> = Vec::new();
            let content = &self.inner.content;
            let integration = state.store.integrate(tree, |existing, incoming| {
                match (existing, incoming) {
                    (Some(existing), Some(_)) if existing.read().is_root() => Some(existing.clone()),
                    (Some(existing), Some(incoming)) => {
                        let mut node = existing.write();
                        let same_kind = node.kind == incoming.kind
                            || (node.kind.is_container() && incoming.kind.is_container());
                        if !same_kind {
                            drop(node);
                            replaced.push(existing.clone());
                            if incoming.kind.has_content() {
                                reindex.push(incoming.path.clone());
                            }
                            return Some(node_ref(incoming.clone()));
                        }
                        let touched = if node.is_virtual() {
                            node.promote(incoming.created, incoming.modified);
                            content.mark_restored(&node.path);
                            true
                        } else if node.modified != incoming.modified {
                            node.modified = incoming.modified;
                            true
                        } else {
                            false
                        };
                        if touched {
                            if node.kind.has_content() {
                                reindex.push(node.path.clone());
                            }
                            drop(node);
                            changed.push(existing.clone());
                        }
                        Some(existing.clone())
                    }
                    (None, Some(incoming)) => {
                        if incoming.kind.has_content() {
                            reindex.push(incoming.path.clone());
                        }
                        Some(node_ref(incoming.clone()))
                    }
                    (Some(existing), None) => {
                        let node = existing.read();
                        if !node.is_virtual()
                            && !missing.iter().any(|root| contains(root, &node.path))
                        {
                            missing.push(node.path.clone());
                        }
                        Some(existing.clone())
                    }
                    (None, None) => None,
                }
            });
            match integration {
                Ok(integration) => builder.integration(&integration),
                Err(e) => tracing::warn!("[Backend] cannot integrate {}: {}", scan_root, e),
            }
            for node in changed {
                builder.change(node);
            }
            let mut gc = Vec::new();
            for node in replaced {
                self.clear_outgoing(&mut state, &node, &mut builder, &mut gc);
            }
            for target in gc {
                self.gc_virtual(&mut state, &target, &mut builder);
            }
            for root in missing {
                self.retire_subtree(&mut state, &root, false, &mut builder);
            }
            self.emit(builder);
        }

        let mut seen = HashSet::new();
        for file in reindex.into_iter().filter(|file| seen.insert(file.clone())) {
            if self.inner.content.is_open(&file) {
                match self.inner.fs.read_file(&file).await {
                    Ok(text) => {
                        self.inner.content.refresh_from_disk(&file, &text);
                    }
                    Err(e) => tracing::debug!("[Backend] cannot refresh {}: {}", file, e),
                }
            }
            if let Err(e) = self.index_file(&file).await {
                tracing::warn!("[Backend] cannot index {}: {}", file, e);
            }
        }
        Ok(())
    }
}
