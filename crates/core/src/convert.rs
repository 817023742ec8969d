//! Conversion between the wiki's storage markup and [`Document`].
//!
//! The engine only depends on the [`ContentConverter`] trait. The bundled
//! [`StorageFormatConverter`] understands the XHTML subset the block model
//! can express (`h1`-`h6`, `p`, `ul`/`ol`, simple tables) and turns every
//! other top-level element into an opaque block that is preserved verbatim.
//! Inline markup and entities pass through untouched; escaping is not this
//! module's business.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex_lite::Regex;
use tracing::debug;

use crate::document::{Block, Document, EditableBlock, CELL_BREAK};
use crate::errors::ConvertError;
use crate::fingerprint::fingerprint;

/// Pure, deterministic transform between native markup and [`Document`].
pub trait ContentConverter: Send + Sync {
    fn parse_storage(&self, raw: &str) -> Result<Document, ConvertError>;

    fn render_storage(&self, doc: &Document) -> String;

    /// Native markup to common text form.
    fn to_text(&self, raw: &str) -> Result<String, ConvertError> {
        Ok(self.parse_storage(raw)?.to_text())
    }

    /// Common text form to native markup.
    fn from_text(&self, text: &str) -> String {
        self.render_storage(&Document::from_text(text))
    }
}

/// Converter for the wiki storage format (XHTML with `ac:` macros).
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageFormatConverter;

impl StorageFormatConverter {
    pub fn new() -> Self {
        Self
    }
}

impl ContentConverter for StorageFormatConverter {
    fn parse_storage(&self, raw: &str) -> Result<Document, ConvertError> {
        let nodes = parse_nodes(raw, 0)?;
        let mut doc = Document::default();
        let mut ids = OpaqueIds::default();

        for node in nodes {
            match node {
                Node::Text(text) => {
                    let text = collapse_whitespace(&text);
                    if !text.is_empty() {
                        doc.push(
                            Block::Editable(EditableBlock::Paragraph { text }),
                            None,
                        );
                    }
                }
                Node::Comment(raw) => {
                    let id = ids.assign("comment", &raw);
                    doc.push(Block::Opaque { id, raw }, None);
                }
                Node::Element(el) => match classify_element(&el)?.filter(reparses_identically) {
                    Some(block) => doc.push(Block::Editable(block), Some(el.raw.clone())),
                    None => {
                        let id = ids.assign(&el.opaque_label(), &el.raw);
                        doc.push(Block::Opaque { id, raw: el.raw }, None);
                    }
                },
            }
        }

        debug!(blocks = doc.len(), "parsed storage document");
        Ok(doc)
    }

    fn render_storage(&self, doc: &Document) -> String {
        let mut out = String::new();
        for (index, block) in doc.blocks().iter().enumerate() {
            match block {
                Block::Opaque { raw, .. } => out.push_str(raw),
                Block::Editable(editable) => match doc.source(index) {
                    Some(source) => out.push_str(source),
                    None => render_editable(editable, &mut out),
                },
            }
        }
        out
    }
}

fn render_editable(block: &EditableBlock, out: &mut String) {
    match block {
        EditableBlock::Heading { level, text } => {
            out.push_str(&format!("<h{l}>{t}</h{l}>", l = level, t = text));
        }
        EditableBlock::Paragraph { text } => {
            out.push_str("<p>");
            out.push_str(&text.split('\n').collect::<Vec<_>>().join("<br />"));
            out.push_str("</p>");
        }
        EditableBlock::List { ordered, items } => {
            let tag = if *ordered { "ol" } else { "ul" };
            out.push_str(&format!("<{}>", tag));
            for item in items {
                out.push_str(&format!("<li>{}</li>", item));
            }
            out.push_str(&format!("</{}>", tag));
        }
        EditableBlock::Table { header, rows } => {
            out.push_str("<table><tbody>");
            for (i, row) in rows.iter().enumerate() {
                let cell = if *header && i == 0 { "th" } else { "td" };
                out.push_str("<tr>");
                for value in row {
                    out.push_str(&format!(
                        "<{c}>{v}</{c}>",
                        c = cell,
                        v = value.replace(CELL_BREAK, "<br />")
                    ));
                }
                out.push_str("</tr>");
            }
            out.push_str("</tbody></table>");
        }
    }
}

/// A block is only editable if its text form parses back to itself.
fn reparses_identically(block: &EditableBlock) -> bool {
    let text = block.lines().join("\n");
    let reparsed = Document::from_text(&text);
    matches!(reparsed.blocks(), [Block::Editable(b)] if b == block)
}

// ---------------------------------------------------------------------------
// Element classification
// ---------------------------------------------------------------------------

const BLOCK_TAGS: &[&str] = &[
    "<p", "<ul", "<ol", "<table", "<h1", "<h2", "<h3", "<h4", "<h5", "<h6", "<ac:structured-macro",
    "<ac:layout", "<pre", "<blockquote", "<div",
];

fn contains_block_markup(inner: &str) -> bool {
    BLOCK_TAGS.iter().any(|t| inner.contains(t))
}

/// Map an element to an editable block, or `None` for opaque content.
fn classify_element(el: &Element) -> Result<Option<EditableBlock>, ConvertError> {
    let name = el.name.as_str();
    match name {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            if !el.attrs.trim().is_empty() || contains_block_markup(&el.inner) {
                return Ok(None);
            }
            let level = name[1..].parse::<u8>().unwrap_or(1);
            let text = collapse_whitespace(&br_re().replace_all(&el.inner, " "));
            Ok(Some(EditableBlock::Heading { level, text }))
        }
        "p" => {
            if !el.attrs.trim().is_empty() || contains_block_markup(&el.inner) {
                return Ok(None);
            }
            let text = collapse_whitespace(&el.inner);
            let text = br_re().replace_all(&text, "\n").to_string();
            let text = text
                .split('\n')
                .map(str::trim)
                .collect::<Vec<_>>()
                .join("\n");
            if text.trim().is_empty() || text.split('\n').any(|l| l.is_empty()) {
                return Ok(None);
            }
            Ok(Some(EditableBlock::Paragraph { text }))
        }
        "ul" | "ol" => {
            let mut items = Vec::new();
            for node in parse_nodes(&el.inner, el.inner_offset)? {
                match node {
                    Node::Text(t) if t.trim().is_empty() => {}
                    Node::Element(li)
                        if li.name == "li"
                            && li.attrs.trim().is_empty()
                            && !contains_block_markup(&li.inner)
                            && !li.inner.contains("<br") =>
                    {
                        let item = collapse_whitespace(&li.inner);
                        if item.is_empty() {
                            return Ok(None);
                        }
                        items.push(item);
                    }
                    _ => return Ok(None),
                }
            }
            if items.is_empty() {
                return Ok(None);
            }
            Ok(Some(EditableBlock::List {
                ordered: name == "ol",
                items,
            }))
        }
        "table" => parse_table(el),
        _ => Ok(None),
    }
}

fn parse_table(el: &Element) -> Result<Option<EditableBlock>, ConvertError> {
    let mut tr_elements = Vec::new();
    for node in parse_nodes(&el.inner, el.inner_offset)? {
        match node {
            Node::Text(t) if t.trim().is_empty() => {}
            Node::Element(child) => match child.name.as_str() {
                "tbody" | "thead" => {
                    for row in parse_nodes(&child.inner, child.inner_offset)? {
                        match row {
                            Node::Text(t) if t.trim().is_empty() => {}
                            Node::Element(tr) if tr.name == "tr" => tr_elements.push(tr),
                            _ => return Ok(None),
                        }
                    }
                }
                "tr" => tr_elements.push(child),
                _ => return Ok(None),
            },
            _ => return Ok(None),
        }
    }

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut header = false;
    for (row_index, tr) in tr_elements.iter().enumerate() {
        let mut cells = Vec::new();
        let mut all_th = true;
        let mut any_th = false;
        for node in parse_nodes(&tr.inner, tr.inner_offset)? {
            match node {
                Node::Text(t) if t.trim().is_empty() => {}
                Node::Element(cell) if cell.name == "td" || cell.name == "th" => {
                    if !cell.attrs.trim().is_empty() {
                        return Ok(None);
                    }
                    all_th &= cell.name == "th";
                    any_th |= cell.name == "th";
                    match cell_text(&cell.inner) {
                        Some(text) => cells.push(text),
                        None => return Ok(None),
                    }
                }
                _ => return Ok(None),
            }
        }
        if cells.is_empty() || (any_th && !all_th) {
            return Ok(None);
        }
        if row_index == 0 {
            header = all_th;
        } else if any_th {
            return Ok(None);
        }
        if let Some(first) = rows.first() {
            if first.len() != cells.len() {
                return Ok(None);
            }
        }
        rows.push(cells);
    }

    if rows.is_empty() || rows[0].is_empty() {
        return Ok(None);
    }
    Ok(Some(EditableBlock::Table { header, rows }))
}

/// Single-line text of a table cell; `None` if the cell holds block markup.
fn cell_text(inner: &str) -> Option<String> {
    let trimmed = inner.trim();
    let unwrapped = match (trimmed.strip_prefix("<p>"), trimmed.ends_with("</p>")) {
        (Some(rest), true) => {
            let body = &rest[..rest.len() - "</p>".len()];
            if body.contains("<p") {
                return None;
            }
            body
        }
        _ => trimmed,
    };
    if contains_block_markup(unwrapped) {
        return None;
    }
    let text = collapse_whitespace(unwrapped);
    Some(br_re().replace_all(&text, CELL_BREAK).to_string())
}

fn br_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s*<br\s*/?>\s*").expect("static regex"))
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Content-derived ids for opaque blocks, unique within one document.
#[derive(Default)]
struct OpaqueIds {
    seen: HashMap<String, usize>,
}

impl OpaqueIds {
    fn assign(&mut self, label: &str, raw: &str) -> String {
        let base = format!("{}-{}", sanitize(label), &fingerprint(raw)[..8]);
        let count = self.seen.entry(base.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            base
        } else {
            format!("{}-{}", base, count)
        }
    }
}

fn sanitize(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "block".into()
    } else {
        trimmed.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Node {
    Element(Element),
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone)]
struct Element {
    name: String,
    attrs: String,
    inner: String,
    /// Byte offset of `inner` in the top-level input, for error messages.
    inner_offset: usize,
    raw: String,
}

impl Element {
    fn opaque_label(&self) -> String {
        if self.name == "ac:structured-macro" {
            if let Some(caps) = macro_name_re().captures(&self.attrs) {
                return caps[1].to_string();
            }
        }
        self.name.clone()
    }
}

fn open_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^<([A-Za-z][A-Za-z0-9:._-]*)((?:[^>"']|"[^"]*"|'[^']*')*?)(/?)>"#)
            .expect("static regex")
    })
}

fn macro_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"ac:name="([^"]+)""#).expect("static regex"))
}

/// Split `src` into top-level nodes. `base` is `src`'s offset in the input.
fn parse_nodes(src: &str, base: usize) -> Result<Vec<Node>, ConvertError> {
    let mut nodes = Vec::new();
    let mut pos = 0;

    while pos < src.len() {
        let rest = &src[pos..];
        if rest.starts_with("<!--") {
            let end = rest.find("-->").ok_or(ConvertError::Unclosed {
                tag: "!--".into(),
                offset: base + pos,
            })? + 3;
            nodes.push(Node::Comment(rest[..end].to_string()));
            pos += end;
        } else if rest.starts_with("<![CDATA[") {
            return Err(ConvertError::Malformed {
                offset: base + pos,
                detail: "CDATA outside an element".into(),
            });
        } else if rest.starts_with('<') {
            let caps = open_tag_re()
                .captures(rest)
                .ok_or_else(|| ConvertError::Malformed {
                    offset: base + pos,
                    detail: "expected an element".into(),
                })?;
            let open_len = caps[0].len();
            let name = caps[1].to_string();
            let attrs = caps[2].to_string();
            if !caps[3].is_empty() {
                nodes.push(Node::Element(Element {
                    name,
                    attrs,
                    inner: String::new(),
                    inner_offset: base + pos + open_len,
                    raw: rest[..open_len].to_string(),
                }));
                pos += open_len;
                continue;
            }
            let (inner_end, close_end) = find_close(rest, open_len, &name).ok_or_else(|| {
                ConvertError::Unclosed {
                    tag: name.clone(),
                    offset: base + pos,
                }
            })?;
            nodes.push(Node::Element(Element {
                inner: rest[open_len..inner_end].to_string(),
                inner_offset: base + pos + open_len,
                raw: rest[..close_end].to_string(),
                name,
                attrs,
            }));
            pos += close_end;
        } else {
            let end = rest.find('<').unwrap_or(rest.len());
            nodes.push(Node::Text(rest[..end].to_string()));
            pos += end;
        }
    }
    Ok(nodes)
}

/// Find the close tag matching an element opened at the start of `src`.
///
/// Returns `(start of close tag, end of close tag)`. Nested elements of the
/// same name are counted; CDATA sections and comments are skipped.
fn find_close(src: &str, from: usize, name: &str) -> Option<(usize, usize)> {
    let open = format!("<{}", name);
    let close = format!("</{}", name);
    let mut depth = 1usize;
    let mut pos = from;

    while pos < src.len() {
        let rest = &src[pos..];
        let next = rest.find('<')?;
        pos += next;
        let rest = &src[pos..];

        if rest.starts_with("<![CDATA[") {
            pos += rest.find("]]>")? + 3;
        } else if rest.starts_with("<!--") {
            pos += rest.find("-->")? + 3;
        } else if rest.starts_with(&close) && tag_boundary(rest, close.len()) {
            let end = pos + rest.find('>')? + 1;
            depth -= 1;
            if depth == 0 {
                return Some((pos, end));
            }
            pos = end;
        } else if rest.starts_with(&open) && tag_boundary(rest, open.len()) {
            let tag_end = rest.find('>')?;
            if !rest[..tag_end].ends_with('/') {
                depth += 1;
            }
            pos += tag_end + 1;
        } else {
            pos += 1;
        }
    }
    None
}

fn tag_boundary(s: &str, at: usize) -> bool {
    matches!(
        s.as_bytes().get(at),
        Some(b' ') | Some(b'>') | Some(b'/') | Some(b'\t') | Some(b'\n') | Some(b'\r')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = concat!(
        "<h2>Status</h2>",
        "<p>Hello <strong>world</strong><br/>second line</p>",
        "<ac:structured-macro ac:name=\"toc\" ac:schema-version=\"1\"><ac:parameter ac:name=\"maxLevel\">2</ac:parameter></ac:structured-macro>",
        "<table class=\"wrapped\"><colgroup><col/></colgroup><tbody>",
        "<tr><th>Name</th><th>Value</th></tr>",
        "<tr><td>a</td><td><p>1<br />2</p></td></tr>",
        "</tbody></table>",
        "<ul><li>one</li><li>two</li></ul>",
    );

    #[test]
    fn test_parse_blocks() {
        let doc = StorageFormatConverter.parse_storage(PAGE).unwrap();
        let blocks = doc.blocks();
        assert_eq!(blocks.len(), 5);
        assert_eq!(
            blocks[0],
            Block::Editable(EditableBlock::Heading {
                level: 2,
                text: "Status".into()
            })
        );
        assert_eq!(
            blocks[1],
            Block::Editable(EditableBlock::Paragraph {
                text: "Hello <strong>world</strong>\nsecond line".into()
            })
        );
        match &blocks[2] {
            Block::Opaque { id, raw } => {
                assert!(id.starts_with("toc-"));
                assert!(raw.contains("maxLevel"));
            }
            other => panic!("expected opaque, got {:?}", other),
        }
        // colgroup is not representable, so the table stays opaque
        assert!(matches!(blocks[3], Block::Opaque { .. }));
        assert_eq!(
            blocks[4],
            Block::Editable(EditableBlock::List {
                ordered: false,
                items: vec!["one".into(), "two".into()]
            })
        );
    }

    #[test]
    fn test_simple_table_with_cell_breaks() {
        let raw = "<table><tbody><tr><th>K</th><th>V</th></tr><tr><td>a</td><td><p>1<br />2</p></td></tr></tbody></table>";
        let doc = StorageFormatConverter.parse_storage(raw).unwrap();
        assert_eq!(
            doc.blocks()[0],
            Block::Editable(EditableBlock::Table {
                header: true,
                rows: vec![
                    vec!["K".into(), "V".into()],
                    vec!["a".into(), "1<br>2".into()],
                ]
            })
        );
        assert_eq!(doc.to_text(), "| K | V |\n| --- | --- |\n| a | 1<br>2 |\n");
    }

    #[test]
    fn test_untouched_blocks_render_verbatim() {
        let doc = StorageFormatConverter.parse_storage(PAGE).unwrap();
        assert_eq!(StorageFormatConverter.render_storage(&doc), PAGE);
    }

    #[test]
    fn test_edited_block_is_rerendered() {
        let mut doc = StorageFormatConverter.parse_storage(PAGE).unwrap();
        if let Some(EditableBlock::Heading { text, .. }) = doc.editable_mut(0) {
            *text = "State".into();
        }
        let out = StorageFormatConverter.render_storage(&doc);
        assert!(out.starts_with("<h2>State</h2><p>Hello"));
        assert!(out.contains("ac:name=\"toc\""));
    }

    #[test]
    fn test_text_round_trip_through_storage() {
        let text = "# Title\n\nBody line\n\n| a | b |\n| --- | --- |\n| 1 | 2<br>3 |\n\n1. x\n2. y\n";
        let raw = StorageFormatConverter.from_text(text);
        assert_eq!(StorageFormatConverter.to_text(&raw).unwrap(), text);
    }

    #[test]
    fn test_unclosed_element_is_an_error() {
        let err = StorageFormatConverter.parse_storage("<p>open").unwrap_err();
        assert!(matches!(err, ConvertError::Unclosed { .. }));
    }

    #[test]
    fn test_duplicate_opaque_blocks_get_distinct_ids() {
        let raw = "<hr/><hr/>";
        let doc = StorageFormatConverter.parse_storage(raw).unwrap();
        let ids = doc.opaque_ids();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_paragraph_that_looks_like_a_heading_is_opaque() {
        let doc = StorageFormatConverter.parse_storage("<p># not a heading</p>").unwrap();
        assert!(matches!(doc.blocks()[0], Block::Opaque { .. }));
    }

    #[test]
    fn test_nested_same_name_elements() {
        let raw = "<div><div>inner</div></div><p>after</p>";
        let doc = StorageFormatConverter.parse_storage(raw).unwrap();
        assert_eq!(doc.len(), 2);
        assert!(matches!(doc.blocks()[0], Block::Opaque { .. }));
    }
}
