//! In-memory hierarchical map from path to node.
//!
//! The store knows nothing about files or links. It enforces three invariants at every
//! mutating call:
//!
//! 1. no two nodes share a path (under the configured case mode),
//! 2. every non-root node's parent lists it among its children,
//! 3. a node's depth equals its parent's depth plus one.
//!
//! Nodes are held as [`NodeRef`]s; the store mutates them in place and never replaces an
//! object that is still live at the same path unless explicitly asked to (see
//! [`NodeStore::integrate`]).
use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use crate::{
    error::TreeError,
    node::{node_ref, Node, NodeRef},
    paths::{contains, file_name, file_stem, fold, join, normalize, parent, rebase, strip_extension},
};

/// Result of a fuzzy lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    Exact(NodeRef),
    Ambiguous(Vec<NodeRef>),
    Missing,
}

impl Lookup {
    pub fn exact(&self) -> Option<&NodeRef> {
        match self {
            Lookup::Exact(node) => Some(node),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Lookup::Missing)
    }
}

/// A detached subtree, e.g. a directory listing discovered on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTree {
    pub node: Node,
    pub children: Vec<NodeTree>,
}

impl NodeTree {
    pub fn leaf(node: Node) -> NodeTree {
        NodeTree {
            node,
            children: Vec::new(),
        }
    }

    /// Preorder list of every path in the tree.
    pub fn paths(&self) -> Vec<String> {
        let mut out = vec![self.node.path.clone()];
        for child in self.children.iter() {
            out.extend(child.paths());
        }
        out
    }
}

/// What [`NodeStore::integrate`] did to the store.
#[derive(Debug, Default)]
pub struct Integration {
    pub root: Option<NodeRef>,
    /// Newly attached nodes in preorder.
    pub added: Vec<NodeRef>,
    /// Paths of removed subtree roots.
    pub removed: Vec<String>,
}

pub struct NodeStore {
    case_sensitive: bool,
    nodes: HashMap<String, NodeRef>,
    /// Case-folded file stem or name -> node keys, for fuzzy lookup.
    names: HashMap<String, BTreeSet<String>>,
    root: NodeRef,
}

impl Default for NodeStore {
    fn default() -> Self {
        NodeStore::new(true)
    }
}

fn child_order(a: &str, b: &str) -> Ordering {
    fold(a, false).cmp(&fold(b, false)).then_with(|| a.cmp(b))
}

impl NodeStore {
    pub fn new(case_sensitive: bool) -> NodeStore {
        let root = node_ref(Node::root());
        let mut nodes = HashMap::new();
        nodes.insert(String::new(), root.clone());
        NodeStore {
            case_sensitive,
            nodes,
            names: HashMap::new(),
            root,
        }
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn key(&self, path: &str) -> String {
        fold(path, self.case_sensitive)
    }

    pub fn root(&self) -> NodeRef {
        self.root.clone()
    }

    /// Number of nodes, root excluded.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, path: &str) -> Option<NodeRef> {
        self.nodes.get(&self.key(path)).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(&self.key(path))
    }

    /// Best-effort lookup used by link resolution. An exact hit wins; otherwise the query is
    /// matched case-insensitively against whole trailing path segments, with or without the
    /// candidate's extension.
    pub fn get_fuzzy(&self, query: &str) -> Lookup {
        let query = normalize(query);
        if query.is_empty() {
            return Lookup::Missing;
        }
        if let Some(node) = self.get(&query) {
            return Lookup::Exact(node);
        }
        let folded = fold(&query, false);
        let suffix = format!("/{folded}");
        let mut keys: BTreeSet<&String> = BTreeSet::new();
        for name in [file_stem(&query), file_name(&query)] {
            if let Some(set) = self.names.get(&fold(name, false)) {
                keys.extend(set.iter());
            }
        }
        let mut candidates: Vec<NodeRef> = keys
            .into_iter()
            .filter_map(|key| self.nodes.get(key))
            .filter(|node| {
                let node = node.read();
                let full = fold(&node.path, false);
                let bare = fold(strip_extension(&node.path), false);
                full == folded || full.ends_with(&suffix) || bare == folded || bare.ends_with(&suffix)
            })
            .cloned()
            .collect();
        if candidates.iter().any(|node| !node.read().kind.is_container()) {
            candidates.retain(|node| !node.read().kind.is_container());
        }
        candidates.sort_by(|a, b| a.read().path.cmp(&b.read().path));
        match candidates.len() {
            0 => Lookup::Missing,
            1 => Lookup::Exact(candidates.remove(0)),
            _ => Lookup::Ambiguous(candidates),
        }
    }

    /// Add a new node. Fails when the path holds a non-virtual node or the parent does not
    /// exist. A virtual occupant is replaced, handing its children to the new node.
    pub fn add(&mut self, node: Node) -> Result<NodeRef, TreeError> {
        self.attach(node_ref(node))
    }

    /// Like [`NodeStore::add`] but keeps the identity of an existing object.
    pub fn attach(&mut self, node: NodeRef) -> Result<NodeRef, TreeError> {
        let path = node.read().path.clone();
        if path.is_empty() {
            return Err(TreeError::PathCollision(path));
        }
        let parent_ref = self
            .get(parent(&path))
            .filter(|parent| parent.read().kind.is_container())
            .ok_or_else(|| TreeError::InvalidParent(path.clone()))?;

        let key = self.key(&path);
        if let Some(occupant) = self.nodes.get(&key).cloned() {
            if Arc::ptr_eq(&occupant, &node) {
                return Ok(node);
            }
            let (is_virtual, children) = {
                let occupant = occupant.read();
                (occupant.is_virtual(), occupant.children.clone())
            };
            if !is_virtual || (!children.is_empty() && !node.read().kind.is_container()) {
                return Err(TreeError::PathCollision(path));
            }
            tracing::debug!("[NodeStore] replacing virtual node at {}", path);
            self.unindex(&key, &occupant.read().path);
            self.unlink_child(&parent_ref, &occupant.read().name);
            let mut incoming = node.write();
            for child in children {
                if !incoming.children.contains(&child) {
                    incoming.children.push(child);
                }
            }
            incoming.children.sort_by(|a, b| child_order(a, b));
        }

        {
            let parent_depth = parent_ref.read().depth;
            let mut node = node.write();
            node.relocate(&path);
            debug_assert_eq!(node.depth, parent_depth + 1);
        }
        self.index(&key, &path, node.clone());
        let name = node.read().name.clone();
        self.link_child(&parent_ref, &name);
        Ok(node)
    }

    /// Remove a node and its entire subtree. Returns the removed root, or None when the path
    /// is not present (or is the root).
    pub fn remove(&mut self, path: &str) -> Option<NodeRef> {
        if path.is_empty() {
            return None;
        }
        let node = self.get(path)?;
        for descendant in self.subtree(path) {
            let descendant_path = descendant.read().path.clone();
            let key = self.key(&descendant_path);
            self.unindex(&key, &descendant_path);
        }
        if let Some(parent_ref) = self.get(parent(path)) {
            let name = node.read().name.clone();
            self.unlink_child(&parent_ref, &name);
        }
        Some(node)
    }

    /// Preorder list of `path` and all of its descendants.
    pub fn subtree(&self, path: &str) -> Vec<NodeRef> {
        let mut out = Vec::new();
        if let Some(node) = self.get(path) {
            self.collect_subtree(node, &mut out);
        }
        out
    }

    fn collect_subtree(&self, node: NodeRef, out: &mut Vec<NodeRef>) {
        let (path, children) = {
            let node = node.read();
            (node.path.clone(), node.children.clone())
        };
        out.push(node);
        for child in children {
            match self.get(&join(&path, &child)) {
                Some(child_ref) => self.collect_subtree(child_ref, out),
                None => tracing::error!(
                    "[NodeStore] child '{}' of '{}' missing from the path map",
                    child,
                    path
                ),
            }
        }
    }

    pub fn children(&self, path: &str) -> Vec<NodeRef> {
        self.get(path)
            .map(|node| {
                let node = node.read();
                node.children
                    .iter()
                    .filter_map(|child| self.get(&join(&node.path, child)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Move `old` (and its subtree) to `new`. Returns one `(old_path, node)` pair for every
    /// node whose path changed, root first. Case-only renames are allowed in place.
    pub fn move_node(
        &mut self,
        old: &str,
        new: &str,
    ) -> Result<Vec<(String, NodeRef)>, TreeError> {
        if old.is_empty() || new.is_empty() {
            return Err(TreeError::Command("Cannot move the workspace root".to_string()));
        }
        if old == new {
            return Ok(Vec::new());
        }
        let node = self
            .get(old)
            .ok_or_else(|| TreeError::NotFound(old.to_string()))?;
        let same_key = self.key(old) == self.key(new);
        if !same_key && contains(&self.key(old), &self.key(new)) {
            return Err(TreeError::Command(format!(
                "Cannot move '{old}' into its own subtree '{new}'"
            )));
        }
        if !same_key && self.contains(new) {
            return Err(TreeError::MoveOntoOccupant {
                from: old.to_string(),
                to: new.to_string(),
            });
        }
        let new_parent = self
            .get(parent(new))
            .filter(|parent| parent.read().kind.is_container())
            .ok_or_else(|| TreeError::InvalidParent(new.to_string()))?;

        let old_root_path = node.read().path.clone();
        let subtree = self.subtree(old);
        let mut moved = Vec::with_capacity(subtree.len());
        for descendant in subtree.iter() {
            let path = descendant.read().path.clone();
            let key = self.key(&path);
            self.unindex(&key, &path);
        }
        if let Some(old_parent) = self.get(parent(&old_root_path)) {
            let name = node.read().name.clone();
            self.unlink_child(&old_parent, &name);
        }
        for descendant in subtree.into_iter() {
            let old_path = descendant.read().path.clone();
            let new_path = rebase(&old_path, &old_root_path, new).unwrap_or_else(|| {
                tracing::error!("[NodeStore] '{}' is not under '{}'", old_path, old_root_path);
                old_path.clone()
            });
            descendant.write().relocate(&new_path);
            let key = self.key(&new_path);
            self.index(&key, &new_path, descendant.clone());
            moved.push((old_path, descendant));
        }
        let name = node.read().name.clone();
        self.link_child(&new_parent, &name);
        Ok(moved)
    }

    /// Make sure every folder along `path` exists, creating missing ones with `create`.
    /// Returns the folder at `path` plus the nodes that had to be created, outermost first.
    pub fn ensure_folder_exists<F>(
        &mut self,
        path: &str,
        mut create: F,
        is_virtual: bool,
    ) -> Result<(NodeRef, Vec<NodeRef>), TreeError>
    where
        F: FnMut(&Node, &str) -> Node,
    {
        let path = normalize(path);
        let mut current = self.root();
        let mut created = Vec::new();
        let mut current_path = String::new();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            current_path = join(&current_path, segment);
            current = match self.get(&current_path) {
                Some(existing) => {
                    if !existing.read().kind.is_container() {
                        return Err(TreeError::InvalidParent(current_path));
                    }
                    existing
                }
                None => {
                    let mut folder = create(&current.read(), segment);
                    folder.relocate(&current_path);
                    folder.meta.is_virtual = is_virtual;
                    let folder = self.add(folder)?;
                    created.push(folder.clone());
                    folder
                }
            };
        }
        Ok((current, created))
    }

    /// Fold `tree` into the store. `resolver(existing, incoming)` runs once per node pair
    /// (either side may be absent) and returns the node that should live at that path:
    /// returning the existing object keeps its identity, a different object replaces the
    /// existing subtree, and None removes it. Children are only visited below containers.
    pub fn integrate<F>(&mut self, tree: NodeTree, mut resolver: F) -> Result<Integration, TreeError>
    where
        F: FnMut(Option<&NodeRef>, Option<&Node>) -> Option<NodeRef>,
    {
        let path = tree.node.path.clone();
        if !path.is_empty() && !self.contains(parent(&path)) {
            return Err(TreeError::InvalidParent(path));
        }
        let mut out = Integration::default();
        let existing = self.get(&path);
        out.root = self.integrate_node(existing, Some(tree), &mut resolver, &mut out)?;
        Ok(out)
    }

    fn integrate_node<F>(
        &mut self,
        existing: Option<NodeRef>,
        incoming: Option<NodeTree>,
        resolver: &mut F,
        out: &mut Integration,
    ) -> Result<Option<NodeRef>, TreeError>
    where
        F: FnMut(Option<&NodeRef>, Option<&Node>) -> Option<NodeRef>,
    {
        let (incoming_node, incoming_children) = match incoming {
            Some(tree) => (Some(tree.node), tree.children),
            None => (None, Vec::new()),
        };
        let resolved = resolver(existing.as_ref(), incoming_node.as_ref());
        let kept = match (existing, resolved) {
            (Some(existing), Some(resolved)) if Arc::ptr_eq(&existing, &resolved) => {
                Some(existing)
            }
            (Some(existing), Some(resolved)) => {
                let existing_path = existing.read().path.clone();
                self.remove(&existing_path);
                out.removed.push(existing_path);
                resolved.write().children.clear();
                let attached = self.attach(resolved)?;
                out.added.push(attached.clone());
                Some(attached)
            }
            (None, Some(resolved)) => {
                resolved.write().children.clear();
                let attached = self.attach(resolved)?;
                out.added.push(attached.clone());
                Some(attached)
            }
            (Some(existing), None) => {
                let existing_path = existing.read().path.clone();
                self.remove(&existing_path);
                out.removed.push(existing_path);
                None
            }
            (None, None) => None,
        };

        let Some(node) = kept else {
            return Ok(None);
        };
        if !node.read().kind.is_container() {
            return Ok(Some(node));
        }

        let node_path = node.read().path.clone();
        let mut incoming_by_key: HashMap<String, NodeTree> = incoming_children
            .into_iter()
            .map(|child| (self.key(file_name(&child.node.path)), child))
            .collect();
        let mut names: Vec<String> = node.read().children.clone();
        for child in incoming_by_key.values() {
            let name = file_name(&child.node.path).to_string();
            if !names.iter().any(|known| self.key(known) == self.key(&name)) {
                names.push(name);
            }
        }
        for name in names {
            let existing_child = self.get(&join(&node_path, &name));
            let incoming_child = incoming_by_key.remove(&self.key(&name));
            self.integrate_node(existing_child, incoming_child, resolver, out)?;
        }
        Ok(Some(node))
    }

    /// Every node except the root, in preorder.
    pub fn iter(&self) -> Vec<NodeRef> {
        let mut out = self.subtree("");
        out.remove(0);
        out
    }

    pub fn paths(&self) -> Vec<String> {
        self.iter().iter().map(|node| node.read().path.clone()).collect()
    }

    /// Consistency self-check. Returns a description of every violated invariant.
    pub fn check_invariants(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (key, node) in self.nodes.iter() {
            let node = node.read();
            if self.key(&node.path) != *key {
                errors.push(format!("node '{}' is stored under key '{}'", node.path, key));
            }
            if node.is_root() {
                continue;
            }
            match self.get(parent(&node.path)) {
                Some(parent_ref) => {
                    let parent_node = parent_ref.read();
                    if !parent_node.kind.is_container() {
                        errors.push(format!("parent of '{}' cannot hold children", node.path));
                    }
                    if !parent_node.children.iter().any(|child| *child == node.name) {
                        errors.push(format!(
                            "'{}' is missing from the children of '{}'",
                            node.name, parent_node.path
                        ));
                    }
                    if node.depth != parent_node.depth + 1 {
                        errors.push(format!(
                            "depth of '{}' is {} but its parent has depth {}",
                            node.path, node.depth, parent_node.depth
                        ));
                    }
                }
                None => errors.push(format!("parent of '{}' does not exist", node.path)),
            }
            if !node.kind.is_container() && !node.children.is_empty() {
                errors.push(format!("non-container '{}' has children", node.path));
            }
            let mut seen = BTreeSet::new();
            for child in node.children.iter() {
                if !seen.insert(self.key(child)) {
                    errors.push(format!("'{}' lists child '{}' twice", node.path, child));
                }
                if !self.contains(&join(&node.path, child)) {
                    errors.push(format!("'{}' lists missing child '{}'", node.path, child));
                }
            }
        }
        let reachable = self.subtree("").len();
        if reachable != self.nodes.len() {
            errors.push(format!(
                "{} nodes stored but {} reachable from the root",
                self.nodes.len(),
                reachable
            ));
        }
        errors
    }

    fn index(&mut self, key: &str, path: &str, node: NodeRef) {
        self.nodes.insert(key.to_string(), node);
        for name in Self::name_keys(path) {
            self.names.entry(name).or_default().insert(key.to_string());
        }
    }

    fn unindex(&mut self, key: &str, path: &str) {
        self.nodes.remove(key);
        for name in Self::name_keys(path) {
            if let Some(set) = self.names.get_mut(&name) {
                set.remove(key);
                if set.is_empty() {
                    self.names.remove(&name);
                }
            }
        }
    }

    fn name_keys(path: &str) -> Vec<String> {
        let stem = fold(file_stem(path), false);
        let name = fold(file_name(path), false);
        if stem == name {
            vec![stem]
        } else {
            vec![stem, name]
        }
    }

    fn link_child(&self, parent_ref: &NodeRef, name: &str) {
        let mut parent_node = parent_ref.write();
        let case_sensitive = self.case_sensitive;
        if parent_node
            .children
            .iter()
            .any(|child| fold(child, case_sensitive) == fold(name, case_sensitive))
        {
            return;
        }
        let idx = parent_node
            .children
            .binary_search_by(|child| child_order(child, name))
            .unwrap_or_else(|idx| idx);
        parent_node.children.insert(idx, name.to_string());
    }

    fn unlink_child(&self, parent_ref: &NodeRef, name: &str) {
        let case_sensitive = self.case_sensitive;
        parent_ref
            .write()
            .children
            .retain(|child| fold(child, case_sensitive) != fold(name, case_sensitive));
    }
}
