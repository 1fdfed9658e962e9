//! Reactive link handles.
//!
//! A [`LinkHandle`] wraps one link (or a direct node reference) and publishes its current
//! resolution on a watch channel. The mirror offers every incoming [`TreeChange`] to every
//! live handle through [`LinkHandle::check_tree_change`], a cheap test against the paths and
//! names the last resolution depended on. Only a hit marks the handle dirty; the handle then
//! re-resolves right away when someone is watching it, and lazily on the next
//! [`LinkHandle::get`] otherwise.
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::watch;

use crate::{
    delta::TreeChange,
    links::{is_external, resolve, with_note_extension, Resolution},
    mirror::MirrorInner,
    node::{LinkForm, NodeRef},
    paths::{decode_spaces, file_stem, fold, join, normalize, overlaps, parent, HrefPath},
};

/// Rich description of an external link target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExternalMeta {
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Fetches [`ExternalMeta`] for external targets, e.g. by retrieving the page.
#[async_trait]
pub trait ExternalDescriber: Send + Sync {
    async fn describe(&self, target: &str) -> Option<ExternalMeta>;
}

#[derive(Debug, Clone, Default)]
pub enum Resolved {
    #[default]
    Empty,
    Node(NodeRef),
    Ambiguous(Vec<NodeRef>),
    /// Not in the tree: an external target awaiting description, or a link the backend has
    /// not created a placeholder for yet.
    Untracked(String),
    External(ExternalMeta),
}

impl Resolved {
    pub fn node(&self) -> Option<&NodeRef> {
        match self {
            Resolved::Node(node) => Some(node),
            _ => None,
        }
    }

    /// Paths of the resolved nodes, for display and comparison.
    pub fn paths(&self) -> Vec<String> {
        match self {
            Resolved::Node(node) => vec![node.read().path.clone()],
            Resolved::Ambiguous(nodes) => nodes.iter().map(|node| node.read().path.clone()).collect(),
            _ => Vec::new(),
        }
    }
}

impl Display for Resolved {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Resolved::Empty => write!(f, "Empty"),
            Resolved::Node(node) => write!(f, "Node({})", node.read().path),
            Resolved::Ambiguous(nodes) => write!(f, "Ambiguous({} nodes)", nodes.len()),
            Resolved::Untracked(target) => write!(f, "Untracked({target})"),
            Resolved::External(meta) => write!(f, "External({})", meta.url),
        }
    }
}

/// Something a resolution depended on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// Any change at, above or below this path may alter the result.
    Path(String),
    /// A resolved node. In-place updates reach the handle directly, so only structural
    /// changes around it count.
    Held(String),
    /// A node with this file stem appearing or disappearing anywhere may alter the result.
    Name(String),
}

impl Dependency {
    fn hit(&self, change: &TreeChange, case_sensitive: bool) -> bool {
        match self {
            Dependency::Path(path) => {
                let path = fold(path, case_sensitive);
                change
                    .paths()
                    .any(|changed| overlaps(&path, &fold(changed, case_sensitive)))
            }
            Dependency::Held(path) => {
                let path = fold(path, case_sensitive);
                change
                    .structural_paths()
                    .any(|changed| overlaps(&path, &fold(changed, case_sensitive)))
            }
            Dependency::Name(name) => change
                .structural_paths()
                .any(|changed| fold(file_stem(changed), false) == *name),
        }
    }
}

#[derive(Debug, Clone)]
pub enum HandleTarget {
    Node(NodeRef),
    Link {
        from: String,
        href: String,
        form: LinkForm,
    },
}

#[derive(Default)]
struct HandleState {
    dirty: bool,
    deps: Vec<Dependency>,
    /// Latest describe request; responses for older ones are dropped.
    request_seq: u64,
    held: Option<NodeRef>,
}

pub(crate) struct HandleShared {
    mirror: Weak<MirrorInner>,
    target: HandleTarget,
    state: Mutex<HandleState>,
    value: watch::Sender<Resolved>,
    resolve_count: AtomicU64,
}

impl HandleShared {
    pub(crate) fn new(mirror: Weak<MirrorInner>, target: HandleTarget) -> Arc<HandleShared> {
        let shared = Arc::new(HandleShared {
            mirror,
            target,
            state: Mutex::new(HandleState {
                dirty: true,
                ..Default::default()
            }),
            value: watch::channel(Resolved::Empty).0,
            resolve_count: AtomicU64::new(0),
        });
        shared.resolve();
        shared
    }

    /// Whether `node` is the node this handle currently resolves to.
    pub(crate) fn holds(&self, node: &NodeRef) -> bool {
        self.state
            .lock()
            .held
            .as_ref()
            .map(|held| Arc::ptr_eq(held, node))
            .unwrap_or(false)
    }

    /// The held node changed in place: push the value again without re-resolving.
    pub(crate) fn node_updated(&self) {
        self.value.send_modify(|_| {});
    }

    pub(crate) fn check_tree_change(self: &Arc<Self>, change: &TreeChange, case_sensitive: bool) -> bool {
        let hit = {
            let mut state = self.state.lock();
            if state.dirty {
                return true;
            }
            let hit = state.deps.iter().any(|dep| dep.hit(change, case_sensitive));
            state.dirty = hit;
            hit
        };
        if hit && self.value.receiver_count() > 0 {
            self.resolve();
        }
        hit
    }

    fn dependencies(&self, resolved: &Resolved) -> Vec<Dependency> {
        let mut deps: Vec<Dependency> = resolved.paths().into_iter().map(Dependency::Held).collect();
        if let HandleTarget::Link { from, href, form } = &self.target {
            if *form == LinkForm::Tag {
                deps.push(Dependency::Path(normalize(href)));
                return deps;
            }
            let split = HrefPath::new(href);
            let target = normalize(&decode_spaces(split.path));
            if !target.is_empty() {
                deps.push(Dependency::Name(fold(file_stem(&target), false)));
                deps.push(Dependency::Path(normalize(&join(parent(from), &target))));
                deps.push(Dependency::Path(target));
            } else {
                deps.push(Dependency::Path(from.clone()));
            }
        }
        let held = resolved.paths();
        deps.retain(|dep| !matches!(dep, Dependency::Path(path) if held.contains(path)));
        deps
    }

    pub(crate) fn resolve(self: &Arc<Self>) -> Resolved {
        let Some(mirror) = self.mirror.upgrade() else {
            return Resolved::Empty;
        };
        self.resolve_count.fetch_add(1, Ordering::SeqCst);
        let resolved = {
            let state = mirror.state.lock();
            let resolved = match &self.target {
                HandleTarget::Node(node) => {
                    let path = node.read().path.clone();
                    match state.store.get(&path) {
                        Some(current) if Arc::ptr_eq(&current, node) => Resolved::Node(current),
                        _ => Resolved::Empty,
                    }
                }
                HandleTarget::Link { from, href, form } => {
                    match resolve(&state.store, from, href, *form, &mirror.config) {
                        Resolution::Node(node) => Resolved::Node(node),
                        Resolution::Ambiguous(nodes) => Resolved::Ambiguous(nodes),
                        Resolution::External(target) => Resolved::Untracked(target),
                        Resolution::Missing(candidate) if candidate.is_empty() => Resolved::Empty,
                        Resolution::Missing(candidate) => {
                            Resolved::Untracked(with_note_extension(&candidate, &mirror.config))
                        }
                    }
                }
            };
            resolved
        };
        let deps = self.dependencies(&resolved);
        let seq = {
            let mut state = self.state.lock();
            state.dirty = false;
            state.deps = deps;
            state.held = resolved.node().cloned();
            state.request_seq += 1;
            state.request_seq
        };
        self.value.send_replace(resolved.clone());

        if let (Resolved::Untracked(target), Some(describer)) = (&resolved, mirror.describer.clone()) {
            if is_external(target) && tokio::runtime::Handle::try_current().is_ok() {
                let weak = Arc::downgrade(self);
                let target = target.clone();
                tokio::spawn(async move {
                    let meta = describer.describe(&target).await;
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    let current = shared.state.lock().request_seq == seq;
                    match meta {
                        Some(meta) if current => {
                            shared.value.send_replace(Resolved::External(meta));
                        }
                        Some(_) => tracing::debug!(
                            "[LinkHandle] dropping stale description of {}",
                            target
                        ),
                        None => {}
                    }
                });
            }
        }
        resolved
    }
}

/// A live view of one link's target. Dropping it unregisters it from its mirror.
pub struct LinkHandle {
    pub(crate) shared: Arc<HandleShared>,
}

impl LinkHandle {
    /// Current value, re-resolving first if a change marked the handle dirty.
    pub fn get(&self) -> Resolved {
        if self.shared.state.lock().dirty {
            return self.shared.resolve();
        }
        self.shared.value.borrow().clone()
    }

    pub fn resolve(&self) -> Resolved {
        self.shared.resolve()
    }

    /// Receiver notified whenever the value is republished. Holding one makes the handle
    /// re-resolve eagerly.
    pub fn subscribe(&self) -> watch::Receiver<Resolved> {
        self.shared.value.subscribe()
    }

    pub fn is_dirty(&self) -> bool {
        self.shared.state.lock().dirty
    }

    pub fn check_tree_change(&self, change: &TreeChange) -> bool {
        let case_sensitive = self
            .shared
            .mirror
            .upgrade()
            .map(|mirror| mirror.config.case_sensitive)
            .unwrap_or(true);
        self.shared.check_tree_change(change, case_sensitive)
    }

    pub fn dependencies(&self) -> Vec<Dependency> {
        self.shared.state.lock().deps.clone()
    }

    /// How many times this handle ran a resolution.
    pub fn resolve_count(&self) -> u64 {
        self.shared.resolve_count.load(Ordering::SeqCst)
    }

    pub fn target(&self) -> &HandleTarget {
        &self.shared.target
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        if let Some(mirror) = self.shared.mirror.upgrade() {
            let shared = Arc::downgrade(&self.shared);
            mirror
                .state
                .lock()
                .handles
                .retain(|handle| handle.strong_count() > 0 && !Weak::ptr_eq(handle, &shared));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeKind};

    fn change_adding(path: &str) -> TreeChange {
        TreeChange {
            added: vec![Node::new(path, NodeKind::for_path(path))],
            ..Default::default()
        }
    }

    #[test]
    fn test_path_dependency_uses_prefix_overlap() {
        let dep = Dependency::Path("Folder/Note.md".to_string());
        assert!(dep.hit(&change_adding("Folder"), true));
        assert!(dep.hit(&change_adding("Folder/Note.md"), true));
        assert!(!dep.hit(&change_adding("Other/Note.md"), true));
        let removed = TreeChange {
            removed: vec!["folder".to_string()],
            ..Default::default()
        };
        assert!(!dep.hit(&removed, true));
        assert!(dep.hit(&removed, false));
    }

    #[test]
    fn test_name_dependency_ignores_content_changes() {
        let dep = Dependency::Name("note".to_string());
        assert!(dep.hit(&change_adding("Elsewhere/Note.md"), true));
        let changed = TreeChange {
            changed: vec![Node::new("Elsewhere/Note.md", NodeKind::for_path("x.md"))],
            ..Default::default()
        };
        assert!(!dep.hit(&changed, true));
    }
}
