//! NodeStore invariants: unique paths, parent/child consistency, identity across moves

use super::helpers::*;
use crate::{
    error::TreeError,
    node::{Node, NodeKind},
    store::{Lookup, NodeStore, NodeTree},
};
use std::sync::Arc;
use test_log::test;

#[test]
fn test_add_requires_container_parent() {
    let mut store = store_with(&["Note.md"]);
    assert!(matches!(
        store.add(Node::new("Missing/Child.md", NodeKind::for_path("Child.md"))),
        Err(TreeError::InvalidParent(_))
    ));
    assert!(matches!(
        store.add(Node::new("Note.md/Child.md", NodeKind::for_path("Child.md"))),
        Err(TreeError::InvalidParent(_))
    ));
    assert!(store.check_invariants().is_empty());
}

#[test]
fn test_add_rejects_real_occupant_but_replaces_virtual() {
    let mut store = store_with(&["Note.md"]);
    assert!(matches!(
        store.add(Node::new("Note.md", NodeKind::for_path("Note.md"))),
        Err(TreeError::PathCollision(_))
    ));

    let placeholder = store
        .add(Node::placeholder("Ghost.md", NodeKind::for_path("Ghost.md")))
        .unwrap();
    let real = store.add(Node::new("Ghost.md", NodeKind::for_path("Ghost.md"))).unwrap();
    assert!(!Arc::ptr_eq(&placeholder, &real));
    assert!(Arc::ptr_eq(&store.get("Ghost.md").unwrap(), &real));
    assert_eq!(store.len(), 2);
    assert!(store.check_invariants().is_empty());
}

#[test]
fn test_case_insensitive_keys() {
    let mut store = NodeStore::new(false);
    store.add(Node::new("Note.md", NodeKind::for_path("Note.md"))).unwrap();
    assert!(store.get("note.MD").is_some());
    assert!(matches!(
        store.add(Node::new("NOTE.md", NodeKind::for_path("NOTE.md"))),
        Err(TreeError::PathCollision(_))
    ));

    let sensitive = store_with(&["Note.md"]);
    assert!(sensitive.get("note.md").is_none());
}

#[test]
fn test_move_relocates_subtree_and_keeps_identity() {
    let mut store = store_with(&["A/B/Note.md", "A/Other.md", "C/Keep.md"]);
    let folder = store.get("A/B").unwrap();
    let note = store.get("A/B/Note.md").unwrap();

    let moved = store.move_node("A/B", "C/B").unwrap();
    let old_paths: Vec<&str> = moved.iter().map(|(old, _)| old.as_str()).collect();
    assert_eq!(old_paths, vec!["A/B", "A/B/Note.md"]);

    assert!(Arc::ptr_eq(&store.get("C/B").unwrap(), &folder));
    assert!(Arc::ptr_eq(&store.get("C/B/Note.md").unwrap(), &note));
    assert!(store.get("A/B").is_none());
    assert_eq!(note.read().depth, 3);
    assert_eq!(store.get("C").unwrap().read().children, vec!["B", "Keep.md"]);
    assert_eq!(store.get("A").unwrap().read().children, vec!["Other.md"]);
    assert!(store.check_invariants().is_empty());
}

#[test]
fn test_move_rejects_occupied_and_nested_destinations() {
    let mut store = store_with(&["A/Note.md", "B/Note.md"]);
    assert!(matches!(
        store.move_node("A/Note.md", "B/Note.md"),
        Err(TreeError::MoveOntoOccupant { .. })
    ));
    assert!(matches!(
        store.move_node("A", "A/Inner"),
        Err(TreeError::Command(_))
    ));
    assert!(matches!(
        store.move_node("A/Note.md", "Nowhere/Note.md"),
        Err(TreeError::InvalidParent(_))
    ));
    assert!(store.check_invariants().is_empty());
}

#[test]
fn test_case_only_rename_in_place() {
    let mut store = NodeStore::new(false);
    let node = store.add(Node::new("note.md", NodeKind::for_path("note.md"))).unwrap();
    store.move_node("note.md", "Note.md").unwrap();
    assert_eq!(node.read().path, "Note.md");
    assert_eq!(store.root().read().children, vec!["Note.md"]);
    assert!(store.check_invariants().is_empty());
}

#[test]
fn test_fuzzy_lookup() {
    let store = store_with(&["Projects/Plan.md", "Archive/Plan.md", "Inbox/Idea.md"]);
    match store.get_fuzzy("idea") {
        Lookup::Exact(node) => assert_eq!(node.read().path, "Inbox/Idea.md"),
        other => panic!("expected a single match, got {other:?}"),
    }
    match store.get_fuzzy("Plan") {
        Lookup::Ambiguous(nodes) => {
            let paths: Vec<String> = nodes.iter().map(|node| node.read().path.clone()).collect();
            assert_eq!(paths, vec!["Archive/Plan.md", "Projects/Plan.md"]);
        }
        other => panic!("expected an ambiguous match, got {other:?}"),
    }
    assert!(store.get_fuzzy("projects/plan").exact().is_some());
    assert!(store.get_fuzzy("Missing").is_missing());
}

#[test]
fn test_ensure_folder_exists_reports_created_folders() {
    let mut store = store_with(&["A/Note.md"]);
    let (folder, created) = store
        .ensure_folder_exists("A/B/C", |_, name| Node::folder(name), true)
        .unwrap();
    assert_eq!(folder.read().path, "A/B/C");
    let created: Vec<String> = created.iter().map(|node| node.read().path.clone()).collect();
    assert_eq!(created, vec!["A/B", "A/B/C"]);
    assert!(folder.read().is_virtual());
    assert!(!store.get("A").unwrap().read().is_virtual());

    assert!(matches!(
        store.ensure_folder_exists("A/Note.md/Inner", |_, name| Node::folder(name), false),
        Err(TreeError::InvalidParent(_))
    ));
}

#[test]
fn test_integrate_keeps_identity_and_removes_vanished() {
    let mut store = store_with(&["Folder/Keep.md", "Folder/Gone.md"]);
    let keep = store.get("Folder/Keep.md").unwrap();

    let tree = NodeTree {
        node: Node::folder("Folder"),
        children: vec![
            NodeTree::leaf(Node::new("Folder/Keep.md", NodeKind::for_path("Keep.md"))),
            NodeTree::leaf(Node::new("Folder/New.md", NodeKind::for_path("New.md"))),
        ],
    };
    let integration = store
        .integrate(tree, |existing, incoming| match (existing, incoming) {
            (Some(existing), Some(_)) => Some(existing.clone()),
            (None, Some(incoming)) => Some(crate::node::node_ref(incoming.clone())),
            _ => None,
        })
        .unwrap();

    assert_eq!(integration.removed, vec!["Folder/Gone.md".to_string()]);
    let added: Vec<String> = integration
        .added
        .iter()
        .map(|node| node.read().path.clone())
        .collect();
    assert_eq!(added, vec!["Folder/New.md"]);
    assert!(Arc::ptr_eq(&store.get("Folder/Keep.md").unwrap(), &keep));
    assert_eq!(store.paths(), vec!["Folder", "Folder/Keep.md", "Folder/New.md"]);
    assert!(store.check_invariants().is_empty());
}

#[test]
fn test_remove_drops_whole_subtree() {
    let mut store = store_with(&["A/B/Note.md", "A/Other.md"]);
    let removed = store.remove("A/B").unwrap();
    assert_eq!(removed.read().path, "A/B");
    assert!(store.get("A/B/Note.md").is_none());
    assert_eq!(store.paths(), vec!["A", "A/Other.md"]);
    assert!(store.remove("").is_none());
    assert!(store.check_invariants().is_empty());
}
