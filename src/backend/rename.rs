//! Moves and renames.
//!
//! A move has three phases: the filesystem rename, the in-memory relocation (which also
//! rewrites the paths stored in link records so the link graph stays consistent
//! immediately), and the asynchronous propagation that rewrites the literal link text inside
//! every referencing file.
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use super::{Backend, State};
use crate::{
    delta::ChangeBuilder,
    error::TreeError,
    links::{resolve, Resolution},
    node::{Link, LinkForm, Node, NodeMeta, NodeRef, Span},
    paths::{decode_spaces, file_stem, normalize, parent, HrefPath},
    store::Lookup,
};

/// One pending replacement inside a file: `expected` is the target text the link was indexed
/// with, `rendered` what it should say now.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LinkEdit {
    href_span: Span,
    expected: String,
    rendered: String,
}

/// Rewrite `from`/`to` of every link record in `meta` through `remap`.
fn remap_meta<F>(meta: &mut NodeMeta, remap: &F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let mut changed = false;
    let meta = &mut *meta;
    for link in meta.structure.iter_mut().chain(meta.in_links.iter_mut()) {
        if let Some(from) = remap(&link.from) {
            link.from = from;
            changed = true;
        }
        if let Some(to) = link.to.as_deref().and_then(remap) {
            link.to = Some(to);
            changed = true;
        }
    }
    changed
}

/// Apply `edits` back to front so earlier spans stay valid. A span whose text no longer
/// matches what was indexed is left alone. Returns the number of replacements.
fn apply_edits(text: &mut String, edits: &mut [LinkEdit]) -> usize {
    edits.sort_by(|a, b| b.href_span.start.cmp(&a.href_span.start));
    let mut applied = 0;
    for edit in edits.iter() {
        let range = edit.href_span.range();
        if range.end > text.len()
            || !text.is_char_boundary(range.start)
            || !text.is_char_boundary(range.end)
        {
            continue;
        }
        let current = &text[range.clone()];
        if current == edit.rendered {
            continue;
        }
        if current != edit.expected && decode_spaces(current) != edit.expected {
            tracing::debug!(
                "[Backend] link text '{}' changed since indexing, not rewriting",
                current
            );
            continue;
        }
        text.replace_range(range, &edit.rendered);
        applied += 1;
    }
    applied
}

/// Whether `occupant` keeps `moving` from taking its path. Real nodes always do; a virtual
/// node gives way unless it holds placeholders a non-container could not adopt.
fn blocks_move(occupant: &NodeRef, moving: &NodeRef) -> bool {
    let occupant = occupant.read();
    !occupant.is_virtual() || (!occupant.children.is_empty() && !moving.read().kind.is_container())
}

impl Backend {
    /// Move `from` (and its subtree) to `to`, on disk and in the tree. Links into the moved
    /// subtree are rewritten in the background; `watcher_idle` waits for that to finish.
    #[tracing::instrument(skip(self))]
    pub async fn move_node(&self, from: &str, to: &str) -> Result<NodeRef, TreeError> {
        let (from, to) = (normalize(from), normalize(to));
        let (node, is_virtual) = {
            let state = self.inner.state.lock();
            let node = state
                .store
                .get(&from)
                .ok_or_else(|| TreeError::NotFound(from.clone()))?;
            if from.is_empty() || to.is_empty() {
                return Err(TreeError::Command("Cannot move the workspace root".to_string()));
            }
            if let Some(occupant) = state.store.get(&to) {
                if !Arc::ptr_eq(&occupant, &node) && blocks_move(&occupant, &node) {
                    return Err(TreeError::MoveOntoOccupant { from, to });
                }
            }
            let is_virtual = node.read().is_virtual();
            (node, is_virtual)
        };
        if from == to {
            return Ok(node);
        }

        let _locks = self.inner.content.lock_subtree(&from).await;
        if !is_virtual {
            self.inner.fs.rename(&from, &to).await?;
        }
        let pairs = {
            let mut state = self.inner.state.lock();
            let mut builder = ChangeBuilder::new();
            let pairs = self.relocate(&mut state, &from, &to, !is_virtual, &mut builder)?;
            self.inner.content.rename(&from, &to);
            self.emit(builder);
            pairs
        };
        if !pairs.is_empty() {
            let backend = self.clone();
            self.inner.tasks.spawn(
                format!("propagate rename {from} -> {to}"),
                async move { backend.propagate_rename(pairs).await },
            );
        }
        Ok(node)
    }

    /// In-memory half of a move. Returns `(old_path, new_path)` for every relocated node.
    pub(super) fn relocate(
        &self,
        state: &mut State,
        from: &str,
        to: &str,
        real: bool,
        builder: &mut ChangeBuilder,
    ) -> Result<Vec<(String, String)>, TreeError> {
        if state.store.key(from) != state.store.key(to) {
            if let (Some(occupant), Some(moving)) = (state.store.get(to), state.store.get(from)) {
                if blocks_move(&occupant, &moving) {
                    return Err(TreeError::MoveOntoOccupant {
                        from: from.to_string(),
                        to: to.to_string(),
                    });
                }
            }
        }
        let (_, created) =
            state
                .store
                .ensure_folder_exists(parent(to), |_, name| Node::folder(name), !real)?;
        for folder in created {
            builder.add(folder);
        }
        if real {
            self.promote_ancestors(state, to, builder);
        }

        // A virtual node at the destination gives way, handing over its in-links and
        // whatever placeholders lived below it.
        let mut absorbed: Vec<Link> = Vec::new();
        let mut orphans: Vec<NodeRef> = Vec::new();
        if state.store.key(from) != state.store.key(to) {
            if let Some(occupant) = state.store.get(to) {
                absorbed = occupant.read().meta.in_links.clone();
                orphans = state.store.subtree(to).into_iter().skip(1).collect();
                state.store.remove(to);
                builder.remove(to);
                tracing::debug!("[Backend] {} replaces virtual node {}", from, to);
            }
        }

        let moved = state.store.move_node(from, to)?;
        let mut pairs = Vec::with_capacity(moved.len());
        for (old_path, node) in moved.iter() {
            pairs.push((old_path.clone(), node.read().path.clone()));
            builder.moved(old_path, node.clone());
        }
        if let Some((_, root)) = moved.first() {
            if !absorbed.is_empty() {
                let mut root_node = root.write();
                let root_path = root_node.path.clone();
                for mut link in absorbed {
                    link.to = Some(root_path.clone());
                    root_node.meta.add_in_link(link);
                }
                drop(root_node);
                builder.change(root.clone());
            }
        }
        for orphan in orphans {
            let path = {
                let mut orphan = orphan.write();
                orphan.children.clear();
                orphan.path.clone()
            };
            match state.store.attach(orphan.clone()) {
                Ok(node) => builder.add(node),
                Err(e) => {
                    tracing::debug!("[Backend] dropping virtual node {}: {}", path, e);
                    let in_links = std::mem::take(&mut orphan.write().meta.in_links);
                    self.rehome_links(state, &path, in_links, builder);
                }
            }
        }

        self.remap_links(state, &pairs, builder);
        self.gc_virtual(state, parent(from), builder);
        Ok(pairs)
    }

    /// Links into a dropped placeholder either join the real node now holding its path or
    /// become unresolved in their sources.
    fn rehome_links(&self, state: &mut State, path: &str, in_links: Vec<Link>, builder: &mut ChangeBuilder) {
        if in_links.is_empty() {
            return;
        }
        if let Some(holder) = state.store.get(path) {
            {
                let mut holder = holder.write();
                for link in in_links {
                    holder.meta.add_in_link(link);
                }
            }
            builder.change(holder);
            return;
        }
        let key = state.store.key(path);
        let mut sources: Vec<String> = in_links.into_iter().map(|link| link.from).collect();
        sources.sort();
        sources.dedup();
        for source in sources {
            let Some(node) = state.store.get(&source) else {
                continue;
            };
            let mut changed = false;
            for link in node.write().meta.structure.iter_mut() {
                if link.to.as_deref().map(|to| state.store.key(to)) == Some(key.clone()) {
                    link.to = None;
                    changed = true;
                }
            }
            if changed {
                builder.change(node);
            }
        }
    }

    /// Rewrite the paths stored in link records after a move: in the moved nodes themselves
    /// and in every peer that links into, or is linked from, the moved subtree.
    fn remap_links(&self, state: &mut State, pairs: &[(String, String)], builder: &mut ChangeBuilder) {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(old, new)| (state.store.key(old), new.clone()))
            .collect();
        if map.is_empty() {
            return;
        }
        let store = &state.store;
        let remap = |path: &str| map.get(&store.key(path)).cloned();
        let moved_keys: HashSet<String> = pairs.iter().map(|(_, new)| store.key(new)).collect();

        let mut peers: Vec<String> = Vec::new();
        for (_, new) in pairs.iter() {
            let Some(node) = store.get(new) else {
                continue;
            };
            let changed = remap_meta(&mut node.write().meta, &remap);
            {
                let node = node.read();
                for link in node.meta.structure.iter() {
                    if let Some(to) = link.to.as_ref() {
                        if !moved_keys.contains(&store.key(to)) {
                            peers.push(to.clone());
                        }
                    }
                }
                for link in node.meta.in_links.iter() {
                    if !moved_keys.contains(&store.key(&link.from)) {
                        peers.push(link.from.clone());
                    }
                }
            }
            if changed {
                builder.change(node);
            }
        }
        peers.sort();
        peers.dedup();
        for peer in peers {
            let Some(node) = store.get(&peer) else {
                continue;
            };
            if remap_meta(&mut node.write().meta, &remap) {
                builder.change(node);
            }
        }
    }

    /// Collect the text edits a finished move requires, grouped by source file.
    fn rename_edits(&self, pairs: &[(String, String)]) -> BTreeMap<String, Vec<LinkEdit>> {
        let state = self.inner.state.lock();
        let config = &self.inner.config;
        let mut edits: BTreeMap<String, Vec<LinkEdit>> = BTreeMap::new();
        let mut seen: HashSet<(String, usize)> = HashSet::new();
        let moved_keys: HashSet<String> = pairs.iter().map(|(_, new)| state.store.key(new)).collect();
        // Links from elsewhere into the moved node always take the new representation; the
        // node's own links only change when their text stops resolving.
        let mut candidates: Vec<(Link, bool)> = Vec::new();
        for (_, new) in pairs.iter() {
            let Some(node) = state.store.get(new) else {
                continue;
            };
            let node = node.read();
            candidates.extend(node.meta.in_links.iter().cloned().map(|link| (link, true)));
            candidates.extend(node.meta.structure.iter().cloned().map(|link| (link, false)));
        }
        // A new name can capture short links that used to reach a namesake elsewhere.
        for (_, new) in pairs.iter() {
            let namesakes = match state.store.get_fuzzy(file_stem(new)) {
                Lookup::Exact(node) => vec![node],
                Lookup::Ambiguous(nodes) => nodes,
                Lookup::Missing => Vec::new(),
            };
            for namesake in namesakes {
                let namesake = namesake.read();
                if moved_keys.contains(&state.store.key(&namesake.path)) {
                    continue;
                }
                candidates.extend(namesake.meta.in_links.iter().cloned().map(|link| (link, false)));
            }
        }
        for (link, always) in candidates.iter() {
            if matches!(link.form, LinkForm::Tag | LinkForm::Url) || link.href_span.is_empty() {
                continue;
            }
            let Some(target) = link.to.as_deref() else {
                continue;
            };
            if !seen.insert((state.store.key(&link.from), link.href_span.start)) {
                continue;
            }
            if !always {
                let still_resolves = match resolve(&state.store, &link.from, &link.href, link.form, config) {
                    Resolution::Node(found) => state.store.key(&found.read().path) == state.store.key(target),
                    _ => false,
                };
                if still_resolves {
                    continue;
                }
            }
            let rendered = self
                .inner
                .link_style
                .render(&state.store, &link.from, target, link.form, config);
            let expected = decode_spaces(HrefPath::new(&link.href).path).into_owned();
            edits.entry(link.from.clone()).or_default().push(LinkEdit {
                href_span: link.href_span,
                expected,
                rendered,
            });
        }
        edits
    }

    /// Rewrite link text in every file referring into a moved subtree. The saves re-index the
    /// sources; re-indexing never moves anything, so this cannot loop.
    pub(super) async fn propagate_rename(&self, pairs: Vec<(String, String)>) -> Result<(), TreeError> {
        let edits = self.rename_edits(&pairs);
        for (source, mut file_edits) in edits {
            let writable = self
                .get(&source)
                .map(|node| {
                    let node = node.read();
                    !node.is_virtual() && node.kind.has_content()
                })
                .unwrap_or(false);
            if !writable {
                continue;
            }
            let handle = match self.inner.content.open(&source).await {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::warn!("[Backend] cannot rewrite links in {}: {}", source, e);
                    continue;
                }
            };
            let mut applied = 0;
            handle.update_text(|text| {
                applied = apply_edits(text, &mut file_edits);
                applied > 0
            })?;
            if applied == 0 {
                continue;
            }
            tracing::info!("[Backend] rewrote {} link(s) in {}", applied, source);
            self.inner.state.lock().stats.link_rewrites += applied as u64;
            handle.save().await?;
        }
        Ok(())
    }
}
