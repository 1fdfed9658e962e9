use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt::{Display, Formatter},
    sync::Arc,
};

use crate::{
    node::{Node, NodeRef},
    paths::contains,
    store::Integration,
};

/// A node whose path changed. `node` already carries the new path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Moved {
    pub old_path: String,
    pub node: Node,
}

/// One atomic step of authoritative state. Receivers apply the lists in field order:
/// removed, moved, added, changed. That lets a single change vacate a path and re-occupy it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeChange {
    pub removed: Vec<String>,
    pub moved: Vec<Moved>,
    pub added: Vec<Node>,
    pub changed: Vec<Node>,
}

impl TreeChange {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.moved.is_empty()
            && self.added.is_empty()
            && self.changed.is_empty()
    }

    /// Paths touched by removals, moves (both ends) and additions.
    pub fn structural_paths(&self) -> impl Iterator<Item = &str> {
        self.removed
            .iter()
            .map(String::as_str)
            .chain(
                self.moved
                    .iter()
                    .flat_map(|moved| [moved.old_path.as_str(), moved.node.path.as_str()]),
            )
            .chain(self.added.iter().map(|node| node.path.as_str()))
    }

    /// Every path this change mentions.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.structural_paths()
            .chain(self.changed.iter().map(|node| node.path.as_str()))
    }
}

impl Display for TreeChange {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(
            f,
            "TreeChange(removed: {}, moved: {}, added: {}, changed: {})",
            self.removed.len(),
            self.moved.len(),
            self.added.len(),
            self.changed.len()
        )
    }
}

/// Collects live node references during one backend operation and snapshots them when the
/// operation finishes, so every entry reflects the final state of its node.
#[derive(Default)]
pub struct ChangeBuilder {
    removed: Vec<String>,
    moved: Vec<(String, NodeRef)>,
    added: Vec<NodeRef>,
    changed: Vec<NodeRef>,
}

fn ptr_key(node: &NodeRef) -> usize {
    Arc::as_ptr(node) as *const () as usize
}

impl ChangeBuilder {
    pub fn new() -> ChangeBuilder {
        ChangeBuilder::default()
    }

    /// Record a removed subtree. Nodes added earlier in the same operation under `path` are
    /// dropped instead, since receivers never saw them.
    pub fn remove(&mut self, path: &str) {
        let was_added = self.added.iter().any(|node| node.read().path == path);
        self.added.retain(|node| !contains(path, &node.read().path));
        let mut vacated = Vec::new();
        self.moved.retain(|(old_path, node)| {
            if contains(path, &node.read().path) {
                vacated.push(old_path.clone());
                false
            } else {
                true
            }
        });
        for old_path in vacated {
            self.push_removed(&old_path);
        }
        if !was_added {
            self.push_removed(path);
        }
    }

    fn push_removed(&mut self, path: &str) {
        if !self.removed.iter().any(|removed| contains(removed, path)) {
            self.removed.retain(|removed| !contains(path, removed));
            self.removed.push(path.to_string());
        }
    }

    pub fn moved(&mut self, old_path: &str, node: NodeRef) {
        self.moved.push((old_path.to_string(), node));
    }

    pub fn add(&mut self, node: NodeRef) {
        self.added.push(node);
    }

    pub fn change(&mut self, node: NodeRef) {
        self.changed.push(node);
    }

    pub fn integration(&mut self, integration: &Integration) {
        for path in integration.removed.iter() {
            self.remove(path);
        }
        for node in integration.added.iter() {
            self.add(node.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.moved.is_empty()
            && self.added.is_empty()
            && self.changed.is_empty()
    }

    pub fn finish(self) -> TreeChange {
        let mut seen: HashSet<usize> = HashSet::new();
        let added: Vec<Node> = self
            .added
            .iter()
            .filter(|node| seen.insert(ptr_key(node)))
            .map(|node| node.read().snapshot())
            .collect();
        let moved: Vec<Moved> = self
            .moved
            .iter()
            .filter(|(_, node)| seen.insert(ptr_key(node)))
            .map(|(old_path, node)| Moved {
                old_path: old_path.clone(),
                node: node.read().snapshot(),
            })
            .collect();
        let changed: Vec<Node> = self
            .changed
            .iter()
            .filter(|node| seen.insert(ptr_key(node)))
            .map(|node| node.read().snapshot())
            .filter(|node| {
                !self
                    .removed
                    .iter()
                    .any(|removed| contains(removed, &node.path))
            })
            .collect();
        TreeChange {
            removed: self.removed,
            moved,
            added,
            changed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{node_ref, NodeKind};

    #[test]
    fn test_builder_snapshots_final_state_once() {
        let note = node_ref(Node::new("a.md", NodeKind::for_file("a.md")));
        let other = node_ref(Node::new("b.md", NodeKind::for_file("b.md")));
        let gone = node_ref(Node::new("c.md", NodeKind::for_file("c.md")));
        let mut builder = ChangeBuilder::new();
        builder.add(note.clone());
        builder.change(note.clone());
        builder.change(other.clone());
        builder.change(other.clone());
        builder.change(gone.clone());
        builder.remove("c.md");
        note.write().meta.tags.push("late".to_string());
        let change = builder.finish();
        assert_eq!(change.added.len(), 1);
        assert_eq!(change.added[0].meta.tags, vec!["late".to_string()]);
        assert_eq!(change.changed.len(), 1);
        assert_eq!(change.changed[0].path, "b.md");
        assert_eq!(change.removed, vec!["c.md".to_string()]);
        assert_eq!(
            change.to_string(),
            "TreeChange(removed: 1, moved: 0, added: 1, changed: 1)"
        );
    }

    #[test]
    fn test_add_then_remove_cancels_out() {
        let folder = node_ref(Node::folder("Tmp"));
        let child = node_ref(Node::new("Tmp/a.md", NodeKind::for_file("a.md")));
        let mut builder = ChangeBuilder::new();
        builder.add(folder);
        builder.add(child);
        builder.remove("Tmp");
        builder.remove("Old/x.md");
        builder.remove("Old");
        let change = builder.finish();
        assert!(change.added.is_empty());
        assert_eq!(change.removed, vec!["Old".to_string()]);
    }

    #[test]
    fn test_paths_cover_both_ends_of_moves() {
        let node = Node::new("new/a.md", NodeKind::for_file("a.md"));
        let change = TreeChange {
            moved: vec![Moved {
                old_path: "old/a.md".to_string(),
                node,
            }],
            ..Default::default()
        };
        let paths: Vec<&str> = change.paths().collect();
        assert_eq!(paths, vec!["old/a.md", "new/a.md"]);
    }
}
