//! Indexing: turning parsed content into link records, and the lifecycle of the virtual
//! nodes those links create.
use std::collections::BTreeSet;

use super::{Backend, State};
use crate::{
    cache::{content_hash, CachedIndex},
    delta::ChangeBuilder,
    error::TreeError,
    links::{is_external, resolve, Resolution},
    node::{Link, LinkForm, Node, NodeKind, NodeRef, NodeState, Span, TAG_PREFIX},
    parser::{ParseOutcome, ParseState, ParseStep, ParsedContent, ParsedLink},
    paths::{extension, parent},
};

impl Backend {
    /// Resolve `href` from `from`, creating a placeholder (and virtual ancestors) when nothing
    /// matches. Returns None for external links and hrefs without a usable target.
    pub fn get_node_or_placeholder(&self, from: &str, href: &str, form: LinkForm) -> Option<NodeRef> {
        let mut state = self.inner.state.lock();
        let mut builder = ChangeBuilder::new();
        let node = self.resolve_or_placeholder(&mut state, from, href, form, &mut builder);
        self.emit(builder);
        node
    }

    pub(super) fn resolve_or_placeholder(
        &self,
        state: &mut State,
        from: &str,
        href: &str,
        form: LinkForm,
        builder: &mut ChangeBuilder,
    ) -> Option<NodeRef> {
        match resolve(&state.store, from, href, form, &self.inner.config) {
            Resolution::Node(node) => Some(node),
            Resolution::Ambiguous(candidates) => {
                tracing::debug!(
                    "[Backend] '{}' from {} is ambiguous between {} nodes, taking the first",
                    href,
                    from,
                    candidates.len()
                );
                candidates.into_iter().next()
            }
            Resolution::External(_) => None,
            Resolution::Missing(candidate) if candidate.is_empty() => None,
            Resolution::Missing(candidate) => self.ensure_placeholder(state, &candidate, builder),
        }
    }

    /// The node at `path`, created virtual if absent.
    pub(super) fn ensure_placeholder(
        &self,
        state: &mut State,
        path: &str,
        builder: &mut ChangeBuilder,
    ) -> Option<NodeRef> {
        if let Some(existing) = state.store.get(path) {
            return Some(existing);
        }
        let is_tag = path.starts_with(TAG_PREFIX);
        let created = state.store.ensure_folder_exists(
            parent(path),
            |_, name| {
                if is_tag {
                    Node::placeholder(name, NodeKind::Tag)
                } else {
                    Node::folder(name)
                }
            },
            true,
        );
        let created = match created {
            Ok((_, created)) => created,
            Err(e) => {
                tracing::warn!("[Backend] no placeholder for '{}': {}", path, e);
                return None;
            }
        };
        for folder in created {
            builder.add(folder);
        }
        match state.store.add(Node::placeholder(path, NodeKind::for_path(path))) {
            Ok(node) => {
                tracing::debug!("[Backend] created placeholder {}", path);
                builder.add(node.clone());
                Some(node)
            }
            Err(e) => {
                tracing::warn!("[Backend] no placeholder for '{}': {}", path, e);
                None
            }
        }
    }

    /// Remove virtual nodes that nothing retains any more, starting at `path` and walking
    /// up through emptied virtual ancestors. A virtual container goes together with its
    /// descendants once none of them is real, linked or open.
    pub(super) fn gc_virtual(&self, state: &mut State, path: &str, builder: &mut ChangeBuilder) {
        let mut current = path.to_string();
        while !current.is_empty() {
            let subtree = state.store.subtree(&current);
            if subtree.is_empty() {
                break;
            }
            let removable = subtree.iter().all(|node| {
                let node = node.read();
                node.is_virtual() && node.meta.in_links.is_empty() && !self.inner.content.is_open(&node.path)
            });
            if !removable {
                break;
            }
            tracing::debug!("[Backend] collecting unreferenced virtual node {}", current);
            for node in subtree.iter() {
                state.parsed.remove(&node.read().id);
            }
            state.store.remove(&current);
            builder.remove(&current);
            current = parent(&current).to_string();
        }
    }

    /// Drop the outgoing links of `node` from their targets. Targets that lost links are
    /// pushed to `gc` for collection once the caller is done mutating.
    pub(super) fn clear_outgoing(
        &self,
        state: &mut State,
        node: &NodeRef,
        builder: &mut ChangeBuilder,
        gc: &mut Vec<String>,
    ) {
        let (from, structure) = {
            let mut node = node.write();
            (node.path.clone(), std::mem::take(&mut node.meta.structure))
        };
        if structure.is_empty() {
            return;
        }
        builder.change(node.clone());
        let targets: BTreeSet<String> = structure.into_iter().filter_map(|link| link.to).collect();
        for target in targets {
            let Some(target_ref) = state.store.get(&target) else {
                continue;
            };
            if target_ref.write().meta.remove_in_links_from(&from) > 0 {
                builder.change(target_ref);
                gc.push(target);
            }
        }
    }

    /// Delete rule shared by the delete command and the watcher: the subtree at `path` is
    /// kept as tombstones when anything links into it (or `retain` holds), otherwise it is
    /// removed. Returns the tombstoned root, if any.
    pub(super) fn retire_subtree(
        &self,
        state: &mut State,
        path: &str,
        retain: bool,
        builder: &mut ChangeBuilder,
    ) -> Option<NodeRef> {
        let subtree = state.store.subtree(path);
        let root = subtree.first().cloned()?;
        let mut gc = Vec::new();
        for node in subtree.iter() {
            if node.read().kind.has_content() {
                self.clear_outgoing(state, node, builder, &mut gc);
            }
        }
        let retained = retain
            || subtree.iter().any(|node| {
                let node = node.read();
                !node.meta.in_links.is_empty() || self.inner.content.is_open(&node.path)
            });
        let root_path = root.read().path.clone();
        if retained {
            for node in subtree.iter() {
                let mut tombstone = node.write();
                if tombstone.is_virtual() {
                    continue;
                }
                let keeps_idle = !tombstone.meta.in_links.is_empty()
                    || tombstone.kind.is_container()
                    || self.inner.content.is_open(&tombstone.path);
                tombstone.meta.is_virtual = true;
                tombstone.meta.hash = None;
                tombstone.meta.headers.clear();
                tombstone.meta.tags.clear();
                tombstone.state = if keeps_idle {
                    NodeState::Idle
                } else {
                    NodeState::Deleted
                };
                state.parsed.remove(&tombstone.id);
                drop(tombstone);
                builder.change(node.clone());
            }
            tracing::debug!("[Backend] tombstoned {}", root_path);
        } else {
            for node in subtree.iter() {
                state.parsed.remove(&node.read().id);
            }
            state.store.remove(&root_path);
            builder.remove(&root_path);
            tracing::debug!("[Backend] removed {}", root_path);
        }
        self.inner.content.mark_deleted(&root_path);
        for target in gc {
            self.gc_virtual(state, &target, builder);
        }
        self.gc_virtual(state, parent(&root_path), builder);
        retained.then_some(root).filter(|root| state.store.contains(&root.read().path))
    }

    /// Turn every virtual folder on the way to `path` into a real one.
    pub(super) fn promote_ancestors(&self, state: &mut State, path: &str, builder: &mut ChangeBuilder) {
        self.promote_folders(state, parent(path), builder);
    }

    /// Promote the virtual folder at `path` and every virtual folder above it.
    pub(super) fn promote_folders(&self, state: &mut State, path: &str, builder: &mut ChangeBuilder) {
        let mut current = path;
        while !current.is_empty() {
            if let Some(folder) = state.store.get(current) {
                let promoted = {
                    let mut folder = folder.write();
                    if folder.is_virtual() && folder.kind.is_folder() {
                        let (created, modified) = (folder.created, folder.modified);
                        folder.promote(created, modified);
                        true
                    } else {
                        false
                    }
                };
                if promoted {
                    builder.change(folder);
                }
            }
            current = parent(current);
        }
    }

    /// Fold parsed content into `path`'s outgoing structure and its targets' in-links.
    pub(super) fn apply_structure(
        &self,
        state: &mut State,
        path: &str,
        parsed: &ParsedContent,
        hash: Option<String>,
        builder: &mut ChangeBuilder,
    ) {
        let Some(node) = state.store.get(path) else {
            return;
        };
        let from = node.read().path.clone();
        let mut structure = Vec::with_capacity(parsed.links.len());
        for parsed_link in parsed.links.iter() {
            if let Some(link) = self.link_record(state, &from, parsed_link, builder) {
                structure.push(link);
            }
        }
        // Front-matter tags have no span in the body
        for tag in parsed.tags.iter() {
            let href = format!("{TAG_PREFIX}{tag}");
            if structure
                .iter()
                .any(|link| link.form == LinkForm::Tag && link.href == href)
            {
                continue;
            }
            let parsed_link = ParsedLink {
                href,
                form: LinkForm::Tag,
                span: Span::default(),
                href_span: Span::default(),
                anchor: None,
                content_id: None,
                context: String::new(),
            };
            if let Some(link) = self.link_record(state, &from, &parsed_link, builder) {
                structure.push(link);
            }
        }

        let old_targets: BTreeSet<String> = node
            .read()
            .meta
            .structure
            .iter()
            .filter_map(|link| link.to.clone())
            .collect();
        let new_targets: BTreeSet<String> =
            structure.iter().filter_map(|link| link.to.clone()).collect();
        let mut gc = Vec::new();
        for target in old_targets.union(&new_targets) {
            let Some(target_ref) = state.store.get(target) else {
                continue;
            };
            let target_path = target_ref.read().path.clone();
            let mut in_links: Vec<Link> = target_ref
                .read()
                .meta
                .in_links
                .iter()
                .filter(|link| link.from != from)
                .cloned()
                .collect();
            for link in structure.iter() {
                if link.to.as_deref().map(|to| state.store.key(to)) == Some(state.store.key(&target_path))
                    && !in_links.contains(link)
                {
                    in_links.push(link.clone());
                }
            }
            let lost = {
                let mut target_node = target_ref.write();
                if target_node.meta.in_links == in_links {
                    continue;
                }
                let lost = in_links.len() < target_node.meta.in_links.len();
                target_node.meta.in_links = in_links;
                lost
            };
            builder.change(target_ref);
            if lost {
                gc.push(target_path);
            }
        }

        let mut meta = node.read().meta.clone();
        meta.structure = structure;
        meta.tags = parsed.tags.clone();
        meta.headers = parsed.headers.clone();
        meta.hash = hash;
        if node.write().meta.merge(meta) {
            builder.change(node);
        }
        for target in gc {
            self.gc_virtual(state, &target, builder);
        }
    }

    fn link_record(
        &self,
        state: &mut State,
        from: &str,
        parsed: &ParsedLink,
        builder: &mut ChangeBuilder,
    ) -> Option<Link> {
        let target = self.resolve_or_placeholder(state, from, &parsed.href, parsed.form, builder);
        let to = target.map(|node| node.read().path.clone());
        if to.is_none() && parsed.form != LinkForm::Url && !is_external(&parsed.href) {
            return None;
        }
        Some(Link {
            from: from.to_string(),
            to,
            href: parsed.href.clone(),
            form: parsed.form,
            anchor: parsed.anchor.clone(),
            content_id: parsed.content_id.clone(),
            span: parsed.span,
            href_span: parsed.href_span,
            context: parsed.context.clone(),
        })
    }

    /// Text to index: live content when the file is open, the disk otherwise.
    async fn read_for_index(&self, path: &str) -> Result<String, TreeError> {
        match self.inner.content.text(path) {
            Some(text) => Ok(text),
            None => self.inner.fs.read_file(path).await,
        }
    }

    async fn parse_with_retry(&self, path: &str, mut text: String) -> (ParsedContent, String) {
        let Some(parser) = extension(path).and_then(|ext| self.inner.parsers.get(ext)) else {
            let hash = content_hash(&text);
            return (ParsedContent::default(), hash);
        };
        let limit = self.inner.config.parse_retry_limit;
        let mut parse_state = ParseState::Parsing;
        loop {
            let result = parser.parse(path, &text);
            parse_state = parse_state.advance(ParseStep::of(&result), limit);
            match (parse_state, result) {
                (ParseState::Parsed, Ok(ParseOutcome::Parsed(content))) => {
                    return (content, content_hash(&text));
                }
                (ParseState::WaitingOnDependency { attempt }, _) => {
                    tracing::debug!("[Backend] {} is waiting on a dependency (attempt {})", path, attempt);
                    tokio::time::sleep(self.inner.config.parse_retry_delay()).await;
                    if let Ok(fresh) = self.read_for_index(path).await {
                        text = fresh;
                    }
                }
                (_, Err(e)) => {
                    tracing::warn!("[Backend] could not parse {}: {}", path, e);
                    return (ParsedContent::default(), content_hash(&text));
                }
                _ => {
                    tracing::warn!(
                        "[Backend] {} still waiting after {} attempts, indexing without structure",
                        path,
                        limit
                    );
                    return (ParsedContent::default(), content_hash(&text));
                }
            }
        }
    }

    /// Re-parse one file and update its links. Returns whether a parse actually ran: files
    /// whose content hash is unchanged (our own writes echoing back) are skipped.
    #[tracing::instrument(skip(self))]
    pub async fn index_file(&self, path: &str) -> Result<bool, TreeError> {
        let node_path = {
            let state = self.inner.state.lock();
            match state.store.get(path) {
                Some(node) => {
                    let node = node.read();
                    if node.is_virtual() || !node.kind.has_content() {
                        return Ok(false);
                    }
                    node.path.clone()
                }
                None => return Ok(false),
            }
        };
        let text = match self.read_for_index(&node_path).await {
            Ok(text) => text,
            Err(TreeError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let hash = content_hash(&text);
        {
            let mut state = self.inner.state.lock();
            let Some(node) = state.store.get(&node_path) else {
                return Ok(false);
            };
            let (id, modified, unchanged) = {
                let node = node.read();
                (node.id, node.modified, node.meta.hash.as_deref() == Some(hash.as_str()))
            };
            if unchanged {
                if let Some(entry) = state.parsed.get_mut(&id) {
                    entry.modified = modified;
                }
                tracing::trace!("[Backend] {} unchanged, skipping parse", node_path);
                return Ok(false);
            }
        }

        let (parsed, hash) = self.parse_with_retry(&node_path, text).await;

        let mut state = self.inner.state.lock();
        let Some(node) = state.store.get(&node_path) else {
            return Ok(false);
        };
        if node.read().is_virtual() {
            return Ok(false);
        }
        state.stats.index_passes += 1;
        let mut builder = ChangeBuilder::new();
        self.apply_structure(&mut state, &node_path, &parsed, Some(hash.clone()), &mut builder);
        let (id, modified) = {
            let node = node.read();
            (node.id, node.modified)
        };
        state.parsed.insert(
            id,
            CachedIndex {
                modified,
                hash,
                parsed,
            },
        );
        self.emit(builder);
        Ok(true)
    }

    /// Index a file from a cached parse instead of running the parser.
    pub(super) fn apply_cached(&self, path: &str, entry: &CachedIndex) {
        let mut state = self.inner.state.lock();
        let Some(node) = state.store.get(path) else {
            return;
        };
        let mut builder = ChangeBuilder::new();
        self.apply_structure(&mut state, path, &entry.parsed, Some(entry.hash.clone()), &mut builder);
        let id = node.read().id;
        state.parsed.insert(id, entry.clone());
        state.stats.cache_hits += 1;
        self.emit(builder);
    }

    /// A save landed on disk: a virtual node there is real now, and its content needs
    /// indexing.
    pub(super) async fn after_save(&self, path: &str) -> Result<(), TreeError> {
        let stat = self.inner.fs.stat(path).await?;
        {
            let mut state = self.inner.state.lock();
            let Some(node) = state.store.get(path) else {
                return Ok(());
            };
            let mut builder = ChangeBuilder::new();
            if let Some(stat) = stat {
                let changed = {
                    let mut node = node.write();
                    if node.is_virtual() {
                        node.promote(stat.created, stat.modified);
                        true
                    } else if node.modified != stat.modified {
                        node.modified = stat.modified;
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    builder.change(node);
                }
                self.promote_ancestors(&mut state, path, &mut builder);
            }
            self.emit(builder);
        }
        self.index_file(path).await.map(|_| ())
    }
}
