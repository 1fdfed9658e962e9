//! Resolving hrefs against a [`NodeStore`] and rendering the href a node should use to refer
//! to another one.
//!
//! Resolution order for a non-external href:
//!
//! 1. anchor-only hrefs (`#Heading`) resolve to the source node itself,
//! 2. explicit paths (`./x`, `../x`, `/x`) resolve only at that exact location,
//! 3. otherwise the source's directory, then the workspace root, are tried as exact paths
//!    (with the note extension appended when the href names no known file type),
//! 4. finally a fuzzy, case-insensitive suffix match over the whole store.
//!
//! When nothing matches, [`Resolution::Missing`] carries the path a placeholder should be
//! created at.
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;

use crate::{
    config::WorkspaceConfig,
    node::{LinkForm, NodeRef},
    paths::{
        decode_spaces, encode_spaces, extension, file_name, join, normalize, parent, relative,
        strip_extension, HrefPath,
    },
    store::{Lookup, NodeStore},
};

#[derive(Debug, Clone)]
pub enum Resolution {
    Node(NodeRef),
    Ambiguous(Vec<NodeRef>),
    External(String),
    /// No node matched; holds the candidate placeholder path (empty when the href has no
    /// usable target).
    Missing(String),
}

/// URL-like hrefs never get placeholders. A single-letter scheme is a drive letter.
pub fn is_external(href: &str) -> bool {
    let href = href.trim();
    let url_like = href.contains("://")
        || ["mailto:", "tel:", "data:"]
            .iter()
            .any(|scheme| href.to_ascii_lowercase().starts_with(scheme));
    url_like
        && Url::parse(href)
            .map(|url| url.scheme().len() > 1)
            .unwrap_or(false)
}

/// `path` with the note extension appended unless it already names a known file type.
pub fn with_note_extension(path: &str, config: &WorkspaceConfig) -> String {
    match extension(path) {
        Some(ext) if config.is_known_extension(ext) => path.to_string(),
        _ => format!("{}.{}", path, config.note_extension),
    }
}

fn lookup_exact(store: &NodeStore, path: &str, config: &WorkspaceConfig) -> Option<NodeRef> {
    if path.is_empty() {
        return None;
    }
    store
        .get(path)
        .filter(|node| !node.read().kind.is_container() || extension(path).is_none())
        .or_else(|| store.get(&with_note_extension(path, config)))
}

/// Exact lookup relative to the source directory, then the root. No fuzzy matching.
fn lookup_direct(
    store: &NodeStore,
    from: &str,
    target: &str,
    config: &WorkspaceConfig,
) -> Option<NodeRef> {
    lookup_exact(store, &normalize(&join(parent(from), target)), config)
        .or_else(|| lookup_exact(store, target, config))
}

pub fn resolve(
    store: &NodeStore,
    from: &str,
    href: &str,
    form: LinkForm,
    config: &WorkspaceConfig,
) -> Resolution {
    let href = href.trim();
    if form == LinkForm::Url || is_external(href) {
        return Resolution::External(href.to_string());
    }
    if form == LinkForm::Tag {
        let tag_path = normalize(href);
        return match store.get(&tag_path) {
            Some(node) => Resolution::Node(node),
            None => Resolution::Missing(tag_path),
        };
    }

    let split = HrefPath::new(href);
    if split.is_anchor() {
        return match store.get(from) {
            Some(node) => Resolution::Node(node),
            None => Resolution::Missing(String::new()),
        };
    }
    let raw = decode_spaces(split.path);
    let target = normalize(&raw);
    if target.is_empty() {
        return Resolution::Missing(String::new());
    }

    if raw.starts_with("./") || raw.starts_with("../") || raw.starts_with('/') {
        let explicit = if raw.starts_with('/') {
            target
        } else {
            normalize(&join(parent(from), &raw))
        };
        return match lookup_exact(store, &explicit, config) {
            Some(node) => Resolution::Node(node),
            None => Resolution::Missing(with_note_extension(&explicit, config)),
        };
    }

    if let Some(node) = lookup_direct(store, from, &target, config) {
        return Resolution::Node(node);
    }
    let mut lookup = store.get_fuzzy(&target);
    if lookup.is_missing() && extension(&target).is_none() {
        lookup = store.get_fuzzy(&with_note_extension(&target, config));
    }
    match lookup {
        Lookup::Exact(node) => Resolution::Node(node),
        Lookup::Ambiguous(nodes) => Resolution::Ambiguous(nodes),
        Lookup::Missing => {
            let base = match form {
                LinkForm::Markdown => normalize(&join(parent(from), &target)),
                _ => target,
            };
            Resolution::Missing(with_note_extension(&base, config))
        }
    }
}

/// Strategy deciding the literal target text a link from `from` to `target` should carry.
/// Only the path portion is rendered; anchors and aliases are left to the caller.
pub trait LinkStyle: Send + Sync {
    fn render(
        &self,
        store: &NodeStore,
        from: &str,
        target: &str,
        form: LinkForm,
        config: &WorkspaceConfig,
    ) -> String;
}

/// Wiki links conventionally omit the note extension.
fn display_path<'a>(target: &'a str, config: &WorkspaceConfig) -> &'a str {
    match extension(target) {
        Some(ext) if ext.eq_ignore_ascii_case(&config.note_extension) => strip_extension(target),
        _ => target,
    }
}

fn markdown_href(from: &str, target: &str) -> String {
    encode_spaces(&relative(parent(from), target)).into_owned()
}

fn same_node(node: Option<NodeRef>, target: &str, store: &NodeStore) -> bool {
    node.map(|node| store.key(&node.read().path) == store.key(target))
        .unwrap_or(false)
}

/// Bare name when it resolves directly from the source, full root path otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShortestStyle;

impl LinkStyle for ShortestStyle {
    fn render(
        &self,
        store: &NodeStore,
        from: &str,
        target: &str,
        form: LinkForm,
        config: &WorkspaceConfig,
    ) -> String {
        if form == LinkForm::Markdown {
            return markdown_href(from, target);
        }
        let display = display_path(target, config);
        let bare = file_name(display);
        if bare != display && same_node(lookup_direct(store, from, bare, config), target, store) {
            return bare.to_string();
        }
        display.to_string()
    }
}

/// Always the full path from the workspace root.
#[derive(Debug, Default, Clone, Copy)]
pub struct RootStyle;

impl LinkStyle for RootStyle {
    fn render(
        &self,
        _store: &NodeStore,
        _from: &str,
        target: &str,
        form: LinkForm,
        config: &WorkspaceConfig,
    ) -> String {
        match form {
            LinkForm::Markdown => format!("/{}", encode_spaces(target)),
            _ => display_path(target, config).to_string(),
        }
    }
}

/// Always relative to the source file's folder.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelativeStyle;

impl LinkStyle for RelativeStyle {
    fn render(
        &self,
        _store: &NodeStore,
        from: &str,
        target: &str,
        form: LinkForm,
        config: &WorkspaceConfig,
    ) -> String {
        match form {
            LinkForm::Markdown => markdown_href(from, target),
            _ => {
                let rel = relative(parent(from), display_path(target, config));
                if rel.starts_with("..") {
                    rel
                } else {
                    format!("./{rel}")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStyleKind {
    #[default]
    Shortest,
    Root,
    Relative,
}

impl LinkStyleKind {
    pub fn style(&self) -> Arc<dyn LinkStyle> {
        match self {
            LinkStyleKind::Shortest => Arc::new(ShortestStyle),
            LinkStyleKind::Root => Arc::new(RootStyle),
            LinkStyleKind::Relative => Arc::new(RelativeStyle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Node, NodeKind};

    fn store_with(paths: &[&str]) -> NodeStore {
        let mut store = NodeStore::new(true);
        for path in paths {
            store
                .ensure_folder_exists(parent(path), |_, name| Node::folder(name), false)
                .unwrap();
            store.add(Node::new(path, NodeKind::for_path(path))).unwrap();
        }
        store
    }

    fn resolved_path(resolution: Resolution) -> String {
        match resolution {
            Resolution::Node(node) => node.read().path.clone(),
            other => panic!("expected a node, got {other:?}"),
        }
    }

    #[test]
    fn test_external_detection() {
        assert!(is_external("https://example.com/a"));
        assert!(is_external("mailto:someone@example.com"));
        assert!(!is_external("Meeting: notes"));
        assert!(!is_external("C://drive"));
        assert!(!is_external("Folder/Note"));
    }

    #[test]
    fn test_resolution_order() {
        let config = WorkspaceConfig::default();
        let store = store_with(&["Note.md", "Folder/Note.md", "Folder/Other.md", "Deep/x/Unique.md"]);
        let from_folder = "Folder/Other.md";
        assert_eq!(
            resolved_path(resolve(&store, from_folder, "Note", LinkForm::Wiki, &config)),
            "Folder/Note.md"
        );
        assert_eq!(
            resolved_path(resolve(&store, "Top.md", "Note", LinkForm::Wiki, &config)),
            "Note.md"
        );
        assert_eq!(
            resolved_path(resolve(&store, "Top.md", "unique", LinkForm::Wiki, &config)),
            "Deep/x/Unique.md"
        );
        assert_eq!(
            resolved_path(resolve(&store, from_folder, "../Note.md", LinkForm::Markdown, &config)),
            "Note.md"
        );
        assert_eq!(
            resolved_path(resolve(&store, from_folder, "#Heading", LinkForm::Wiki, &config)),
            "Folder/Other.md"
        );
    }

    #[test]
    fn test_missing_and_ambiguous() {
        let config = WorkspaceConfig::default();
        let store = store_with(&["a/Dup.md", "b/Dup.md"]);
        assert!(matches!(
            resolve(&store, "x.md", "Dup", LinkForm::Wiki, &config),
            Resolution::Ambiguous(nodes) if nodes.len() == 2
        ));
        match resolve(&store, "a/Dup.md", "New Note", LinkForm::Wiki, &config) {
            Resolution::Missing(path) => assert_eq!(path, "New Note.md"),
            other => panic!("expected missing, got {other:?}"),
        }
        match resolve(&store, "a/Dup.md", "Sub/Page", LinkForm::Markdown, &config) {
            Resolution::Missing(path) => assert_eq!(path, "a/Sub/Page.md"),
            other => panic!("expected missing, got {other:?}"),
        }
        match resolve(&store, "a/Dup.md", "image.png", LinkForm::Embed, &config) {
            Resolution::Missing(path) => assert_eq!(path, "image.png"),
            other => panic!("expected missing, got {other:?}"),
        }
        assert!(matches!(
            resolve(&store, "a/Dup.md", "https://x.org", LinkForm::Markdown, &config),
            Resolution::External(_)
        ));
    }

    #[test]
    fn test_shortest_style_disambiguates() {
        let config = WorkspaceConfig::default();
        let store = store_with(&["B.md", "Folder/Rename Target.md", "Folder/Sibling.md"]);
        let style = LinkStyleKind::Shortest.style();
        assert_eq!(
            style.render(&store, "B.md", "Folder/Rename Target.md", LinkForm::Wiki, &config),
            "Folder/Rename Target"
        );
        assert_eq!(
            style.render(&store, "Folder/Sibling.md", "Folder/Rename Target.md", LinkForm::Wiki, &config),
            "Rename Target"
        );
        assert_eq!(
            style.render(&store, "B.md", "Folder/Rename Target.md", LinkForm::Markdown, &config),
            "Folder/Rename%20Target.md"
        );
    }

    #[test]
    fn test_root_and_relative_styles() {
        let config = WorkspaceConfig::default();
        let store = store_with(&["a/b/Source.md", "a/Target.md"]);
        assert_eq!(
            LinkStyleKind::Root
                .style()
                .render(&store, "a/b/Source.md", "a/Target.md", LinkForm::Wiki, &config),
            "a/Target"
        );
        assert_eq!(
            LinkStyleKind::Relative
                .style()
                .render(&store, "a/b/Source.md", "a/Target.md", LinkForm::Wiki, &config),
            "../Target"
        );
        assert_eq!(
            LinkStyleKind::Relative
                .style()
                .render(&store, "a/Source.md", "a/Target.md", LinkForm::Wiki, &config),
            "./Target"
        );
    }
}
