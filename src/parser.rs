//! Content parsing: text in, structural links/headers/tags out.
//!
//! ## Key Components
//!
//! - [`ContentParser`] - the parser contract. Pure and synchronous; a parser that cannot yet
//!   produce a complete result returns [`ParseOutcome::Awaiting`] and is retried later.
//! - [`MarkdownParser`] - default parser for notes, built on `pulldown-cmark` with wiki links
//!   enabled.
//! - [`ParserMap`] - registry of parsers keyed by file extension.
//! - [`ParseState`] - the explicit retry state machine driven by the indexer.
//!
//! Every extracted link records two spans: the whole construct, and the portion holding the
//! target path. Rename propagation only ever replaces the second one, so aliases, anchors and
//! surrounding syntax survive a rewrite.
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use pulldown_cmark::{
    Event as MdEvent, LinkType, MetadataBlockKind, Options, Parser as MdParser, Tag as MdTag,
    TagEnd as MdTagEnd,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{ops::Range, sync::Arc};

use crate::{
    error::TreeError,
    node::{Header, LinkForm, Span},
    paths::{decode_spaces, to_anchor, HrefPath},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedLink {
    /// Target as written, anchor included, spaces decoded.
    pub href: String,
    pub form: LinkForm,
    pub span: Span,
    /// Empty when the target is not literally present at the link site (reference links).
    pub href_span: Span,
    pub anchor: Option<String>,
    pub content_id: Option<String>,
    /// Source line holding the link.
    pub context: String,
}

impl ParsedLink {
    fn new(source: &str, href: &str, form: LinkForm, span: Span, href_span: Span) -> ParsedLink {
        let split = HrefPath::new(href);
        ParsedLink {
            href: href.to_string(),
            form,
            span,
            href_span,
            anchor: split.header().map(str::to_string),
            content_id: split.content_id().map(str::to_string),
            context: line_at(source, span.start).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsedContent {
    pub links: Vec<ParsedLink>,
    pub headers: Vec<Header>,
    /// Distinct tag paths without the leading `#`, inline and front-matter tags alike.
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Parsed(ParsedContent),
    /// Parsing depends on something not yet available; retry after a delay.
    Awaiting,
}

pub trait ContentParser: Send + Sync {
    fn parse(&self, path: &str, text: &str) -> Result<ParseOutcome, TreeError>;
}

fn line_at(source: &str, offset: usize) -> &str {
    let offset = offset.min(source.len());
    let start = source[..offset].rfind('\n').map(|idx| idx + 1).unwrap_or(0);
    let end = source[offset..]
        .find('\n')
        .map(|idx| offset + idx)
        .unwrap_or(source.len());
    source[start..end].trim_end_matches('\r')
}

static TAG_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[\s(,;])#([\p{L}\p{N}_\-]+(?:/[\p{L}\p{N}_\-]+)*)")
        .expect("static tag pattern compiles")
});

static URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[a-zA-Z][a-zA-Z0-9+.\-]+://[^\s<>\[\]()]+").expect("static url pattern compiles")
});

fn markdown_options() -> Options {
    let mut md_options = Options::empty();
    md_options.insert(Options::ENABLE_FOOTNOTES);
    md_options.insert(Options::ENABLE_STRIKETHROUGH);
    md_options.insert(Options::ENABLE_TABLES);
    md_options.insert(Options::ENABLE_TASKLISTS);
    md_options.insert(Options::ENABLE_WIKILINKS);
    md_options.insert(Options::ENABLE_YAML_STYLE_METADATA_BLOCKS);
    md_options
}

fn push_tag(tags: &mut Vec<String>, tag: &str) {
    let tag = tag.trim().trim_start_matches('#').trim_matches('/');
    if tag.is_empty() || tag.chars().all(|c| c.is_ascii_digit()) {
        return;
    }
    if !tags.iter().any(|known| known == tag) {
        tags.push(tag.to_string());
    }
}

/// Tags declared in a YAML front-matter block: either a list or a comma/space separated
/// string.
fn front_matter_tags(yaml: &str) -> Result<Vec<String>, TreeError> {
    let value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    let mut tags = Vec::new();
    match value.get("tags").or_else(|| value.get("tag")) {
        Some(serde_yaml::Value::Sequence(seq)) => {
            for item in seq.iter() {
                if let Some(tag) = item.as_str() {
                    push_tag(&mut tags, tag);
                }
            }
        }
        Some(serde_yaml::Value::String(list)) => {
            for tag in list.split([',', ' ']) {
                push_tag(&mut tags, tag);
            }
        }
        _ => {}
    }
    Ok(tags)
}

/// Markdown notes: wiki links, embeds, inline links, autolinks, raw URLs, `#tags`, YAML
/// front matter and headers.
#[derive(Debug, Default, Clone)]
pub struct MarkdownParser;

impl MarkdownParser {
    pub fn new() -> MarkdownParser {
        MarkdownParser
    }

    fn wiki_link(source: &str, range: Range<usize>, embed: bool) -> Option<ParsedLink> {
        let open = if embed { "![[" } else { "[[" };
        let open_at = source.get(..range.end)?.rfind(open)?;
        let close_at = open_at + source[open_at..].find("]]")? + 2;
        let range = open_at..close_at;
        let inner_start = range.start + open.len();
        if inner_start > range.end - 2 {
            return None;
        }
        let inner = &source[inner_start..range.end - 2];
        let target = inner.split('|').next().unwrap_or(inner);
        let path_len = target.find('#').unwrap_or(target.len());
        let path_len = target[..path_len].trim_end().len();
        let form = if embed {
            LinkForm::Embed
        } else {
            LinkForm::Wiki
        };
        Some(ParsedLink::new(
            source,
            target.trim(),
            form,
            range.clone().into(),
            Span::new(inner_start, inner_start + path_len),
        ))
    }

    fn inline_link(source: &str, range: Range<usize>, dest: &str) -> Option<ParsedLink> {
        let raw = source.get(range.clone())?;
        let dest_open = raw.rfind("](")? + 2;
        let mut start = range.start + dest_open;
        let rest = &source[start..range.end];
        let trimmed = rest.trim_start();
        start += rest.len() - trimmed.len();
        let trimmed = match trimmed.strip_prefix('<') {
            Some(inner) => {
                start += 1;
                inner
            }
            None => trimmed,
        };
        let raw_len = trimmed
            .find(|c: char| c.is_whitespace() || c == ')' || c == '>')
            .unwrap_or(trimmed.len());
        let path_len = trimmed[..raw_len].find('#').unwrap_or(raw_len);
        Some(ParsedLink::new(
            source,
            &decode_spaces(dest),
            LinkForm::Markdown,
            range.into(),
            Span::new(start, start + path_len),
        ))
    }

    fn scan_text(source: &str, range: Range<usize>, content: &mut ParsedContent) {
        let Some(text) = source.get(range.clone()) else {
            return;
        };
        for found in URL_REGEX.find_iter(text) {
            let url = found
                .as_str()
                .trim_end_matches(['.', ',', ';', ':', '!', '?', '\'', '"']);
            let start = range.start + found.start();
            let span = Span::new(start, start + url.len());
            content
                .links
                .push(ParsedLink::new(source, url, LinkForm::Url, span, span));
        }
        for captures in TAG_REGEX.captures_iter(text) {
            let Some(tag) = captures.get(1) else {
                continue;
            };
            if tag.as_str().chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let tag_start = range.start + tag.start();
            let href = format!("#{}", tag.as_str());
            content.links.push(ParsedLink {
                href: href.clone(),
                form: LinkForm::Tag,
                span: Span::new(tag_start - 1, range.start + tag.end()),
                href_span: Span::new(tag_start, range.start + tag.end()),
                anchor: None,
                content_id: None,
                context: line_at(source, tag_start).to_string(),
            });
            push_tag(&mut content.tags, tag.as_str());
        }
    }
}

impl ContentParser for MarkdownParser {
    fn parse(&self, path: &str, text: &str) -> Result<ParseOutcome, TreeError> {
        let mut content = ParsedContent::default();
        // Nesting depth of constructs whose text is not scanned for tags/URLs
        let mut opaque = 0usize;
        let mut metadata: Option<String> = None;
        let mut heading: Option<(u8, String, Range<usize>)> = None;

        for (event, range) in MdParser::new_ext(text, markdown_options()).into_offset_iter() {
            match event {
                MdEvent::Start(MdTag::Link {
                    link_type,
                    dest_url,
                    ..
                }) => {
                    opaque += 1;
                    let link = match link_type {
                        LinkType::WikiLink { .. } => Self::wiki_link(text, range, false),
                        LinkType::Inline => Self::inline_link(text, range, &dest_url),
                        LinkType::Autolink | LinkType::Email => {
                            let span = Span::new(range.start + 1, range.end.saturating_sub(1));
                            Some(ParsedLink::new(
                                text,
                                &dest_url,
                                LinkForm::Url,
                                range.into(),
                                span,
                            ))
                        }
                        _ => Some(ParsedLink::new(
                            text,
                            &decode_spaces(&dest_url),
                            LinkForm::Markdown,
                            range.into(),
                            Span::default(),
                        )),
                    };
                    content.links.extend(link);
                }
                MdEvent::Start(MdTag::Image {
                    link_type,
                    dest_url,
                    ..
                }) => {
                    opaque += 1;
                    let link = match link_type {
                        LinkType::WikiLink { .. } => Self::wiki_link(text, range, true),
                        LinkType::Inline => Self::inline_link(text, range, &dest_url),
                        _ => None,
                    };
                    content.links.extend(link);
                }
                MdEvent::End(MdTagEnd::Link) | MdEvent::End(MdTagEnd::Image) => {
                    opaque = opaque.saturating_sub(1);
                }
                MdEvent::Start(MdTag::CodeBlock(_)) | MdEvent::Start(MdTag::HtmlBlock) => {
                    opaque += 1;
                }
                MdEvent::End(MdTagEnd::CodeBlock) | MdEvent::End(MdTagEnd::HtmlBlock) => {
                    opaque = opaque.saturating_sub(1);
                }
                MdEvent::Start(MdTag::MetadataBlock(MetadataBlockKind::YamlStyle)) => {
                    metadata = Some(String::new());
                }
                MdEvent::End(MdTagEnd::MetadataBlock(_)) => {
                    if let Some(yaml) = metadata.take() {
                        match front_matter_tags(&yaml) {
                            Ok(tags) => {
                                for tag in tags {
                                    push_tag(&mut content.tags, &tag);
                                }
                            }
                            Err(e) => {
                                tracing::warn!("[MarkdownParser] {}: bad front matter: {}", path, e)
                            }
                        }
                    }
                }
                MdEvent::Start(MdTag::Heading { level, .. }) => {
                    heading = Some((level as u8, String::new(), range));
                }
                MdEvent::End(MdTagEnd::Heading(_)) => {
                    if let Some((level, title, range)) = heading.take() {
                        let title = title.trim().to_string();
                        content.headers.push(Header {
                            level,
                            anchor: to_anchor(&title),
                            text: title,
                            span: range.into(),
                        });
                    }
                }
                MdEvent::Text(cow_str) => {
                    if let Some(yaml) = metadata.as_mut() {
                        yaml.push_str(&cow_str);
                        continue;
                    }
                    if let Some((_, title, _)) = heading.as_mut() {
                        title.push_str(&cow_str);
                    }
                    if opaque == 0 {
                        Self::scan_text(text, range, &mut content);
                    }
                }
                MdEvent::Code(cow_str) => {
                    if let Some((_, title, _)) = heading.as_mut() {
                        title.push_str(&cow_str);
                    }
                }
                _ => {}
            }
        }
        content.links.sort_by_key(|link| link.span.start);
        Ok(ParseOutcome::Parsed(content))
    }
}

/// Parsers keyed by lowercase file extension.
#[derive(Clone)]
pub struct ParserMap(Arc<RwLock<Vec<(String, Arc<dyn ContentParser>)>>>);

impl Default for ParserMap {
    fn default() -> Self {
        ParserMap::create()
    }
}

impl ParserMap {
    /// Map with the builtin markdown parser registered for `md` and `markdown`.
    pub fn create() -> ParserMap {
        let markdown: Arc<dyn ContentParser> = Arc::new(MarkdownParser::new());
        ParserMap(Arc::new(RwLock::new(vec![
            ("md".to_string(), markdown.clone()),
            ("markdown".to_string(), markdown),
        ])))
    }

    pub fn empty() -> ParserMap {
        ParserMap(Arc::new(RwLock::new(Vec::new())))
    }

    pub fn insert(&self, extension: &str, parser: Arc<dyn ContentParser>) {
        let extension = extension.to_ascii_lowercase();
        let mut writer = self.0.write();
        if let Some(entry) = writer.iter_mut().find(|(ext, _)| *ext == extension) {
            entry.1 = parser;
        } else {
            writer.push((extension, parser));
        }
    }

    pub fn get(&self, extension: &str) -> Option<Arc<dyn ContentParser>> {
        self.0
            .read()
            .iter()
            .find(|(ext, _)| ext.eq_ignore_ascii_case(extension))
            .map(|(_, parser)| parser.clone())
    }

    pub fn extensions(&self) -> Vec<String> {
        self.0.read().iter().map(|(ext, _)| ext.clone()).collect()
    }
}

/// Coarse result of one parse attempt, fed to [`ParseState::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStep {
    Parsed,
    Awaiting,
    Failed,
}

impl ParseStep {
    pub fn of(result: &Result<ParseOutcome, TreeError>) -> ParseStep {
        match result {
            Ok(ParseOutcome::Parsed(_)) => ParseStep::Parsed,
            Ok(ParseOutcome::Awaiting) => ParseStep::Awaiting,
            Err(_) => ParseStep::Failed,
        }
    }
}

/// Per-file indexing state. `WaitingOnDependency` counts retries; once `attempt` would
/// exceed the limit the file degrades to "no structural data".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    Parsing,
    WaitingOnDependency {
        attempt: u32,
    },
    Parsed,
    Degraded,
}

impl ParseState {
    pub fn advance(self, step: ParseStep, retry_limit: u32) -> ParseState {
        match (self, step) {
            (ParseState::Parsed | ParseState::Degraded, _) => self,
            (_, ParseStep::Parsed) => ParseState::Parsed,
            (_, ParseStep::Failed) => ParseState::Degraded,
            (ParseState::Parsing, ParseStep::Awaiting) if retry_limit > 0 => {
                ParseState::WaitingOnDependency { attempt: 1 }
            }
            (ParseState::WaitingOnDependency { attempt }, ParseStep::Awaiting)
                if attempt < retry_limit =>
            {
                ParseState::WaitingOnDependency {
                    attempt: attempt + 1,
                }
            }
            (_, ParseStep::Awaiting) => ParseState::Degraded,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, ParseState::Parsed | ParseState::Degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ParsedContent {
        match MarkdownParser::new().parse("test.md", text).unwrap() {
            ParseOutcome::Parsed(content) => content,
            ParseOutcome::Awaiting => panic!("markdown parser never waits"),
        }
    }

    #[test]
    fn test_wiki_link_spans() {
        let text = "See [[Folder/Target#Intro|the target]] here.";
        let content = parse(text);
        assert_eq!(content.links.len(), 1);
        let link = &content.links[0];
        assert_eq!(link.form, LinkForm::Wiki);
        assert_eq!(link.href, "Folder/Target#Intro");
        assert_eq!(link.anchor.as_deref(), Some("Intro"));
        assert_eq!(&text[link.span.range()], "[[Folder/Target#Intro|the target]]");
        assert_eq!(&text[link.href_span.range()], "Folder/Target");
        assert_eq!(link.context, text);
    }

    #[test]
    fn test_embed_and_block_reference() {
        let text = "![[Diagram.png]]\n\n[[Note#^abc]]";
        let content = parse(text);
        assert_eq!(content.links.len(), 2);
        assert_eq!(content.links[0].form, LinkForm::Embed);
        assert_eq!(&text[content.links[0].href_span.range()], "Diagram.png");
        assert_eq!(content.links[1].content_id.as_deref(), Some("abc"));
        assert_eq!(content.links[1].anchor, None);
    }

    #[test]
    fn test_inline_links_and_urls() {
        let text = "A [link](My%20Note.md#top) and <https://example.com> and https://rust-lang.org.";
        let content = parse(text);
        let forms: Vec<LinkForm> = content.links.iter().map(|link| link.form).collect();
        assert_eq!(forms, vec![LinkForm::Markdown, LinkForm::Url, LinkForm::Url]);
        assert_eq!(content.links[0].href, "My Note.md#top");
        assert_eq!(&text[content.links[0].href_span.range()], "My%20Note.md");
        assert_eq!(content.links[1].href, "https://example.com");
        assert_eq!(content.links[2].href, "https://rust-lang.org");
    }

    #[test]
    fn test_tags_headers_and_front_matter() {
        let text = "---\ntags: [alpha, beta/one]\n---\n# Title #gamma\n\nBody #project/x and #123 but not `#code`.\n\n```\n#fenced\n```\n";
        let content = parse(text);
        assert_eq!(
            content.tags,
            vec!["alpha", "beta/one", "gamma", "project/x"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
        assert_eq!(content.headers.len(), 1);
        assert_eq!(content.headers[0].level, 1);
        assert_eq!(content.headers[0].text, "Title #gamma");
        let tag_links: Vec<&str> = content
            .links
            .iter()
            .filter(|link| link.form == LinkForm::Tag)
            .map(|link| &text[link.href_span.range()])
            .collect();
        assert_eq!(tag_links, vec!["gamma", "project/x"]);
    }

    #[test]
    fn test_parser_map_lookup() {
        let parsers = ParserMap::create();
        assert!(parsers.get("MD").is_some());
        assert!(parsers.get("txt").is_none());
        parsers.insert("txt", Arc::new(MarkdownParser::new()));
        assert!(parsers.get("txt").is_some());
    }

    #[test]
    fn test_parse_state_retry_bound() {
        let mut state = ParseState::Parsing;
        state = state.advance(ParseStep::Awaiting, 2);
        assert_eq!(state, ParseState::WaitingOnDependency { attempt: 1 });
        state = state.advance(ParseStep::Awaiting, 2);
        assert_eq!(state, ParseState::WaitingOnDependency { attempt: 2 });
        state = state.advance(ParseStep::Awaiting, 2);
        assert_eq!(state, ParseState::Degraded);
        assert!(state.is_final());
        assert_eq!(
            ParseState::Parsing.advance(ParseStep::Awaiting, 0),
            ParseState::Degraded
        );
        assert_eq!(
            ParseState::WaitingOnDependency { attempt: 1 }.advance(ParseStep::Parsed, 2),
            ParseState::Parsed
        );
        assert_eq!(
            ParseState::Parsing.advance(ParseStep::Failed, 2),
            ParseState::Degraded
        );
    }
}
