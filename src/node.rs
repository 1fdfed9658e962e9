//! The atomic unit of the tree and the link records derived from node content.
//!
//! A [`Node`] is shared as a [`NodeRef`] (`Arc<RwLock<Node>>`). Object identity matters:
//! subscribers hold `NodeRef`s directly, so the store mutates nodes in place wherever it can
//! instead of replacing them.
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fmt::{Display, Formatter},
    ops::Range,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

use crate::paths::{depth, extension, file_name};

pub type NodeRef = Arc<RwLock<Node>>;

pub fn node_ref(node: Node) -> NodeRef {
    Arc::new(RwLock::new(node))
}

/// Milliseconds since the unix epoch.
pub type Timestamp = u64;

pub fn now_millis() -> Timestamp {
    to_millis(SystemTime::now())
}

pub fn to_millis(time: SystemTime) -> Timestamp {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as Timestamp)
        .unwrap_or_default()
}

/// Stable node identity. Mirrors receive the same id through deltas, so a node keeps its id
/// across process boundaries and across virtual/real transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> NodeId {
        NodeId(Uuid::new_v4())
    }

    pub fn nil() -> NodeId {
        NodeId(Uuid::nil())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId::new()
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Json,
    Toml,
}

/// Node variants. Only the few sites that need per-kind behavior match on this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Folder,
    File { extension: String },
    /// Tag namespace entry, addressed as `#name/sub`. Always virtual.
    Tag,
    Data { kind: DataKind },
}

/// Prefix reserving the tag namespace at the root of every store.
pub const TAG_PREFIX: char = '#';

impl NodeKind {
    /// Kind of a file node from its name.
    pub fn for_file(name: &str) -> NodeKind {
        match extension(name).map(|ext| ext.to_ascii_lowercase()) {
            Some(ext) if ext == "json" => NodeKind::Data {
                kind: DataKind::Json,
            },
            Some(ext) if ext == "toml" => NodeKind::Data {
                kind: DataKind::Toml,
            },
            Some(ext) => NodeKind::File { extension: ext },
            None => NodeKind::File {
                extension: String::new(),
            },
        }
    }

    /// Kind for any path, tags included.
    pub fn for_path(path: &str) -> NodeKind {
        if path.starts_with(TAG_PREFIX) {
            NodeKind::Tag
        } else {
            NodeKind::for_file(file_name(path))
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, NodeKind::Folder | NodeKind::Tag)
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, NodeKind::Folder)
    }

    /// Kinds whose content lives in a file on disk.
    pub fn has_content(&self) -> bool {
        matches!(self, NodeKind::File { .. } | NodeKind::Data { .. })
    }

    /// The `fileType` discriminator: `folder`, `#tag`, or the extension.
    pub fn file_type(&self) -> &str {
        match self {
            NodeKind::Folder => "folder",
            NodeKind::Tag => "#tag",
            NodeKind::File { extension } => extension,
            NodeKind::Data {
                kind: DataKind::Json,
            } => "json",
            NodeKind::Data {
                kind: DataKind::Toml,
            } => "toml",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Idle,
    /// Tombstone with nothing left retaining it.
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Span {
        Span { start, end }
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl From<Range<usize>> for Span {
    fn from(range: Range<usize>) -> Self {
        Span::new(range.start, range.end)
    }
}

/// How a link was written in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkForm {
    /// `[[Target]]`
    Wiki,
    /// `![[Target]]`
    Embed,
    /// `[text](target.md)`
    Markdown,
    /// `<https://...>` or a raw URL
    Url,
    /// `#tag`
    Tag,
}

impl LinkForm {
    pub fn is_wiki(&self) -> bool {
        matches!(self, LinkForm::Wiki | LinkForm::Embed)
    }
}

/// A directed edge derived from a node's content. The same record is stored as outgoing
/// structure on the source and as an incoming link on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub from: String,
    /// Resolved target path, None for external targets.
    pub to: Option<String>,
    /// Target exactly as written, anchor included.
    pub href: String,
    pub form: LinkForm,
    pub anchor: Option<String>,
    pub content_id: Option<String>,
    /// Whole link construct in the source text.
    pub span: Span,
    /// Target path portion inside `span`, the only part rename propagation rewrites.
    pub href_span: Span,
    pub context: String,
}

impl Link {
    pub fn is_external(&self) -> bool {
        self.to.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub level: u8,
    pub text: String,
    pub anchor: String,
    pub span: Span,
}

/// The structured-index payload of a node. Owned by the indexer, merged field by field so
/// that holders of the node observe incremental changes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMeta {
    #[serde(rename = "virtual")]
    pub is_virtual: bool,
    /// Outgoing links.
    pub structure: Vec<Link>,
    #[serde(rename = "inLinks")]
    pub in_links: Vec<Link>,
    pub tags: Vec<String>,
    pub headers: Vec<Header>,
    /// SHA-256 of the indexed content.
    pub hash: Option<String>,
    /// Opaque payload merged through JSON merge patches.
    pub extra: Map<String, Value>,
}

impl NodeMeta {
    /// Replace only the fields of `self` that differ from `other`. Returns whether anything
    /// changed.
    pub fn merge(&mut self, other: NodeMeta) -> bool {
        let mut changed = false;
        macro_rules! merge_field {
            ($field:ident) => {
                if self.$field != other.$field {
                    self.$field = other.$field;
                    changed = true;
                }
            };
        }
        merge_field!(is_virtual);
        merge_field!(structure);
        merge_field!(in_links);
        merge_field!(tags);
        merge_field!(headers);
        merge_field!(hash);
        merge_field!(extra);
        changed
    }

    pub fn add_in_link(&mut self, link: Link) {
        if !self.in_links.contains(&link) {
            self.in_links.push(link);
        }
    }

    /// Drops every incoming link from `source`, returning how many were removed.
    pub fn remove_in_links_from(&mut self, source: &str) -> usize {
        let before = self.in_links.len();
        self.in_links.retain(|link| link.from != source);
        before - self.in_links.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub path: String,
    pub name: String,
    pub kind: NodeKind,
    pub depth: usize,
    pub created: Timestamp,
    pub modified: Timestamp,
    pub state: NodeState,
    pub meta: NodeMeta,
    /// Child names, kept sorted by the store. Deltas carry shallow copies, so children are
    /// rebuilt by whoever applies them.
    #[serde(skip)]
    pub children: Vec<String>,
}

impl Node {
    pub fn new(path: &str, kind: NodeKind) -> Node {
        let now = now_millis();
        Node {
            id: NodeId::new(),
            path: path.to_string(),
            name: file_name(path).to_string(),
            kind,
            depth: depth(path),
            created: now,
            modified: now,
            state: NodeState::Idle,
            meta: NodeMeta::default(),
            children: Vec::new(),
        }
    }

    pub fn root() -> Node {
        Node {
            id: NodeId::nil(),
            ..Node::new("", NodeKind::Folder)
        }
    }

    pub fn folder(path: &str) -> Node {
        Node::new(path, NodeKind::Folder)
    }

    /// A placeholder node with synthesized timestamps and no on-disk presence.
    pub fn placeholder(path: &str, kind: NodeKind) -> Node {
        let mut node = Node::new(path, kind);
        node.meta.is_virtual = true;
        node
    }

    pub fn is_virtual(&self) -> bool {
        self.meta.is_virtual
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    pub fn file_type(&self) -> &str {
        self.kind.file_type()
    }

    /// Rewrite path, name and depth for a new location.
    pub fn relocate(&mut self, path: &str) {
        self.path = path.to_string();
        self.name = file_name(path).to_string();
        self.depth = depth(path);
    }

    /// Shallow copy suitable for a delta entry.
    pub fn snapshot(&self) -> Node {
        Node {
            children: Vec::new(),
            ..self.clone()
        }
    }

    /// Overwrite everything but the child list with `snapshot`, preserving identity of the
    /// in-memory object.
    pub fn apply_snapshot(&mut self, snapshot: &Node) {
        let children = std::mem::take(&mut self.children);
        *self = Node {
            children,
            ..snapshot.clone()
        };
    }

    /// Turn a tombstone or placeholder back into a real node.
    pub fn promote(&mut self, created: Timestamp, modified: Timestamp) {
        self.meta.is_virtual = false;
        self.state = NodeState::Idle;
        self.created = created;
        self.modified = modified;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(from: &str, to: &str) -> Link {
        Link {
            from: from.to_string(),
            to: Some(to.to_string()),
            href: to.to_string(),
            form: LinkForm::Wiki,
            anchor: None,
            content_id: None,
            span: Span::new(0, 4),
            href_span: Span::new(2, 2),
            context: String::new(),
        }
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(
            NodeKind::for_file("Note.md"),
            NodeKind::File {
                extension: "md".to_string()
            }
        );
        assert_eq!(
            NodeKind::for_file("data.JSON"),
            NodeKind::Data {
                kind: DataKind::Json
            }
        );
        assert_eq!(NodeKind::for_path("#project/alpha"), NodeKind::Tag);
        assert_eq!(NodeKind::Tag.file_type(), "#tag");
        assert!(NodeKind::Tag.is_container());
    }

    #[test]
    fn test_meta_merge_reports_changes() {
        let mut meta = NodeMeta::default();
        let mut next = meta.clone();
        assert!(!meta.merge(next.clone()));
        next.tags.push("a".to_string());
        assert!(meta.merge(next));
        assert_eq!(meta.tags, vec!["a".to_string()]);
    }

    #[test]
    fn test_in_links_dedup_and_removal() {
        let mut meta = NodeMeta::default();
        meta.add_in_link(link("a.md", "b.md"));
        meta.add_in_link(link("a.md", "b.md"));
        meta.add_in_link(link("c.md", "b.md"));
        assert_eq!(meta.in_links.len(), 2);
        assert_eq!(meta.remove_in_links_from("a.md"), 1);
        assert_eq!(meta.in_links[0].from, "c.md");
    }

    #[test]
    fn test_apply_snapshot_keeps_children() {
        let mut node = Node::folder("a");
        node.children.push("b.md".to_string());
        let mut snapshot = node.snapshot();
        snapshot.meta.is_virtual = true;
        node.apply_snapshot(&snapshot);
        assert!(node.is_virtual());
        assert_eq!(node.children, vec!["b.md".to_string()]);
    }
}
