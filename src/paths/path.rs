use std::{
    borrow::Cow,
    path::{Component, Path, PathBuf, MAIN_SEPARATOR_STR},
};
use unicode_normalization::UnicodeNormalization;

/// Utility function to replace separators and convert to unicode (via to_string_lossy) on os path.
pub fn os_path_to_string<P: AsRef<Path>>(os_path_ref: P) -> String {
    let res = os_path_ref
        .as_ref()
        .components()
        .filter_map(|c| match c {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => None,
            _ => Some(c.as_os_str().to_string_lossy()),
        })
        .collect::<Vec<_>>()
        .join("/");
    tracing::trace!(
        "os_path_to_string: turned {:?} into {}",
        os_path_ref.as_ref().components(),
        res
    );
    res
}

pub fn string_to_os_path(path_string: &str) -> PathBuf {
    PathBuf::from(path_string.replace('/', MAIN_SEPARATOR_STR))
}

/// Turn a title string into a regularized anchor string
pub fn to_anchor(title: &str) -> String {
    title
        .trim()
        .to_lowercase()
        .replace(char::is_whitespace, "-")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .collect()
}

/// Normalize a workspace path: forward slashes, no leading or trailing separator, `.` and
/// `..` segments collapsed. A `..` that would climb above the root is dropped.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }
    segments.join("/")
}

/// Comparison key for a path under the workspace case mode. Unicode is NFC-normalized so
/// that differently composed names address the same node.
pub fn fold(path: &str, case_sensitive: bool) -> String {
    let composed: String = path.nfc().collect();
    if case_sensitive {
        composed
    } else {
        composed.to_lowercase()
    }
}

pub fn parent(path: &str) -> &str {
    path.rfind('/').map(|idx| &path[..idx]).unwrap_or("")
}

pub fn file_name(path: &str) -> &str {
    path.rfind('/').map(|idx| &path[idx + 1..]).unwrap_or(path)
}

/// Extension of the last path segment. Leading dots (hidden files) do not count.
pub fn extension(path: &str) -> Option<&str> {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(&name[idx + 1..]),
    }
}

pub fn file_stem(path: &str) -> &str {
    let name = file_name(path);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(idx) => &name[..idx],
    }
}

/// `path` with its extension removed (directory part kept).
pub fn strip_extension(path: &str) -> &str {
    match extension(path) {
        Some(ext) => &path[..path.len() - ext.len() - 1],
        None => path,
    }
}

pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        dir.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

pub fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.split('/').count()
    }
}

/// Segment-aware prefix test: `a` contains `b` when they are equal or `b` lives under `a`.
/// The empty root path is not treated as containing everything.
pub fn contains(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return a == b;
    }
    b == a || (b.len() > a.len() && b.starts_with(a) && b.as_bytes()[a.len()] == b'/')
}

/// Either path contains the other.
pub fn overlaps(a: &str, b: &str) -> bool {
    contains(a, b) || contains(b, a)
}

/// Replace the `old` prefix of `path` with `new`. Returns None when `old` does not contain
/// `path`.
pub fn rebase(path: &str, old: &str, new: &str) -> Option<String> {
    if path == old {
        Some(new.to_string())
    } else if contains(old, path) {
        Some(join(new, &path[old.len() + 1..]))
    } else {
        None
    }
}

/// Relative path from directory `from_dir` to `to`, using `..` segments.
pub fn relative(from_dir: &str, to: &str) -> String {
    let from: Vec<&str> = from_dir.split('/').filter(|s| !s.is_empty()).collect();
    let target: Vec<&str> = to.split('/').filter(|s| !s.is_empty()).collect();
    let shared = from
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut parts: Vec<&str> = Vec::new();
    for _ in shared..from.len() {
        parts.push("..");
    }
    parts.extend(target[shared..].iter());
    parts.join("/")
}

pub fn encode_spaces(href: &str) -> Cow<'_, str> {
    if href.contains(' ') {
        Cow::Owned(href.replace(' ', "%20"))
    } else {
        Cow::Borrowed(href)
    }
}

pub fn decode_spaces(href: &str) -> Cow<'_, str> {
    if href.contains("%20") {
        Cow::Owned(href.replace("%20", " "))
    } else {
        Cow::Borrowed(href)
    }
}

/// Split an href into its target path and optional `#` anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HrefPath<'a> {
    pub path: &'a str,
    pub anchor: Option<&'a str>,
}

impl<'a> HrefPath<'a> {
    pub fn new(href: &'a str) -> HrefPath<'a> {
        match href.find('#') {
            Some(idx) => HrefPath {
                path: href[..idx].trim(),
                anchor: Some(href[idx + 1..].trim()).filter(|anchor| !anchor.is_empty()),
            },
            None => HrefPath {
                path: href.trim(),
                anchor: None,
            },
        }
    }

    /// `#Header` with no path addresses the linking note itself.
    pub fn is_anchor(&self) -> bool {
        self.path.is_empty() && self.anchor.is_some()
    }

    /// `^block` anchors address a content id rather than a header.
    pub fn content_id(&self) -> Option<&'a str> {
        self.anchor.and_then(|anchor| anchor.strip_prefix('^'))
    }

    pub fn header(&self) -> Option<&'a str> {
        self.anchor.filter(|anchor| !anchor.starts_with('^'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_collapses_segments() {
        assert_eq!(normalize("/a/./b//c/"), "a/b/c");
        assert_eq!(normalize("a/b/../c"), "a/c");
        assert_eq!(normalize("../../a"), "a");
        assert_eq!(normalize("a\\b"), "a/b");
    }

    #[test]
    fn test_name_parts() {
        assert_eq!(parent("Folder/Note.md"), "Folder");
        assert_eq!(parent("Note.md"), "");
        assert_eq!(file_name("Folder/Note.md"), "Note.md");
        assert_eq!(extension("Folder/Note.md"), Some("md"));
        assert_eq!(extension("Folder/.hidden"), None);
        assert_eq!(extension("Folder.d/Note"), None);
        assert_eq!(file_stem("Folder/Note.md"), "Note");
        assert_eq!(strip_extension("Folder/Note.md"), "Folder/Note");
        assert_eq!(depth(""), 0);
        assert_eq!(depth("a/b"), 2);
    }

    #[test]
    fn test_contains_is_segment_aware() {
        assert!(contains("a", "a/b.md"));
        assert!(contains("a/b.md", "a/b.md"));
        assert!(!contains("a", "ab/c.md"));
        assert!(!contains("a/b.md", "a"));
        assert!(!contains("", "a"));
        assert!(overlaps("a/b.md", "a"));
    }

    #[test]
    fn test_rebase_and_relative() {
        assert_eq!(rebase("a/b/c.md", "a/b", "x").as_deref(), Some("x/c.md"));
        assert_eq!(rebase("a/b", "a/b", "x/y").as_deref(), Some("x/y"));
        assert_eq!(rebase("ab/c", "a", "x"), None);
        assert_eq!(relative("a/b", "a/c/d.md"), "../c/d.md");
        assert_eq!(relative("", "a/d.md"), "a/d.md");
        assert_eq!(relative("a", "d.md"), "../d.md");
    }

    #[test]
    fn test_fold_case_modes() {
        assert_eq!(fold("Note.MD", false), "note.md");
        assert_eq!(fold("Note.MD", true), "Note.MD");
        // Decomposed e + combining acute folds to the composed form
        assert_eq!(fold("Cafe\u{301}", true), "Caf\u{e9}");
    }

    #[test]
    fn test_href_path_split() {
        let href = HrefPath::new("Folder/Note#Heading");
        assert_eq!(href.path, "Folder/Note");
        assert_eq!(href.header(), Some("Heading"));
        let block = HrefPath::new("Note#^abc123");
        assert_eq!(block.content_id(), Some("abc123"));
        assert_eq!(block.header(), None);
        assert!(HrefPath::new("#Local").is_anchor());
        assert_eq!(to_anchor("My Heading!"), "my-heading");
    }
}
