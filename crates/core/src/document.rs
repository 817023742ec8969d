//! Block model of a wiki page and its common text form.
//!
//! A [`Document`] is a flat sequence of blocks. Blocks the engine understands
//! are [`EditableBlock`]s; everything else (macros, widgets, layouts) is an
//! opaque block carried verbatim and kept out of every diff.
//!
//! Text form, one blank line between blocks:
//!
//! ```text
//! ## Heading
//!
//! A paragraph
//! spanning two lines
//!
//! | Name | Value |
//! | --- | --- |
//! | a | 1<br>2 |
//!
//! - list item
//!
//! <!-- wikisync:opaque toc-1a2b3c4d -->
//! ```

use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Marker that replaces a soft line break inside a table cell.
pub const CELL_BREAK: &str = "<br>";

const ANCHOR_PREFIX: &str = "<!-- wikisync:opaque ";
const ANCHOR_SUFFIX: &str = " -->";

/// A page body as a sequence of blocks.
///
/// Each block may remember the native markup it was parsed from. Untouched
/// blocks are written back from that source byte-for-byte; any mutation
/// through [`Document::editable_mut`] drops it so the block is re-rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    blocks: Vec<Block>,
    sources: Vec<Option<String>>,
}

/// One top-level block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Block {
    Editable(EditableBlock),
    /// Foreign substructure. `raw` is native markup, empty when the block
    /// was only referenced by an anchor in text form.
    Opaque { id: String, raw: String },
}

/// Blocks the patch planner may edit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EditableBlock {
    Heading { level: u8, text: String },
    Paragraph { text: String },
    List { ordered: bool, items: Vec<String> },
    /// `rows[0]` is a header row when `header` is set.
    Table { header: bool, rows: Vec<Vec<String>> },
}

impl EditableBlock {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Heading { .. } => "heading",
            Self::Paragraph { .. } => "paragraph",
            Self::List { .. } => "list",
            Self::Table { .. } => "table",
        }
    }

    /// Lines of this block in text form.
    pub fn lines(&self) -> Vec<String> {
        self.lines_with_parts().into_iter().map(|(l, _)| l).collect()
    }

    fn lines_with_parts(&self) -> Vec<(String, LinePart)> {
        match self {
            Self::Heading { level, text } => {
                vec![(format!("{} {}", "#".repeat(*level as usize), text), LinePart::Heading)]
            }
            Self::Paragraph { text } => text
                .split('\n')
                .enumerate()
                .map(|(i, l)| (l.to_string(), LinePart::Paragraph(i)))
                .collect(),
            Self::List { ordered, items } => items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let bullet = if *ordered {
                        format!("{}.", i + 1)
                    } else {
                        "-".to_string()
                    };
                    (format!("{} {}", bullet, item), LinePart::ListItem(i))
                })
                .collect(),
            Self::Table { header, rows } => {
                let mut out = Vec::with_capacity(rows.len() + 1);
                for (i, row) in rows.iter().enumerate() {
                    out.push((table_row_line(row), LinePart::TableRow(i)));
                    if i == 0 && *header {
                        out.push((separator_line(row.len()), LinePart::TableSeparator));
                    }
                }
                out
            }
        }
    }

    /// Number of columns, for tables.
    pub fn columns(&self) -> Option<usize> {
        match self {
            Self::Table { rows, .. } => rows.first().map(Vec::len),
            _ => None,
        }
    }
}

/// Which part of a block a projected line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinePart {
    Heading,
    Paragraph(usize),
    ListItem(usize),
    TableRow(usize),
    TableSeparator,
}

/// Where a projected line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineOrigin {
    /// Index into [`Document::blocks`].
    pub block: usize,
    pub part: LinePart,
}

/// Editable-only text projection with a back-reference for every line.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    pub lines: Vec<String>,
    /// `None` for the blank separators between blocks.
    pub origins: Vec<Option<LineOrigin>>,
}

impl Projection {
    pub fn text(&self) -> String {
        let mut out = self.lines.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Count of lines that belong to a block.
    pub fn content_lines(&self) -> usize {
        self.origins.iter().filter(|o| o.is_some()).count()
    }
}

impl Document {
    pub fn new(blocks: Vec<Block>) -> Self {
        let sources = vec![None; blocks.len()];
        Self { blocks, sources }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Native markup block `index` was parsed from, if still valid.
    pub fn source(&self, index: usize) -> Option<&str> {
        self.sources.get(index).and_then(|s| s.as_deref())
    }

    pub fn push(&mut self, block: Block, source: Option<String>) {
        self.blocks.push(block);
        self.sources.push(source);
    }

    pub fn insert(&mut self, index: usize, block: Block) {
        self.blocks.insert(index, block);
        self.sources.insert(index, None);
    }

    pub fn remove(&mut self, index: usize) -> Block {
        self.sources.remove(index);
        self.blocks.remove(index)
    }

    /// Mutable access to an editable block; forgets its source markup.
    pub fn editable_mut(&mut self, index: usize) -> Option<&mut EditableBlock> {
        match self.blocks.get_mut(index) {
            Some(Block::Editable(b)) => {
                self.sources[index] = None;
                Some(b)
            }
            _ => None,
        }
    }

    /// Full text form, opaque anchors included.
    pub fn to_text(&self) -> String {
        let rendered: Vec<String> = self
            .blocks
            .iter()
            .map(|block| match block {
                Block::Editable(b) => b.lines().join("\n"),
                Block::Opaque { id, .. } => anchor_line(id),
            })
            .collect();
        let mut out = rendered.join("\n\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Projection of the editable blocks only.
    ///
    /// Opaque blocks contribute nothing, so no diff computed over two
    /// projections can ever touch them.
    pub fn editable_projection(&self) -> Projection {
        let mut projection = Projection::default();
        for (index, block) in self.blocks.iter().enumerate() {
            let Block::Editable(editable) = block else {
                continue;
            };
            if !projection.lines.is_empty() {
                projection.lines.push(String::new());
                projection.origins.push(None);
            }
            for (line, part) in editable.lines_with_parts() {
                projection.lines.push(line);
                projection.origins.push(Some(LineOrigin { block: index, part }));
            }
        }
        projection
    }

    /// Ids of opaque blocks in document order.
    pub fn opaque_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::Opaque { id, .. } => Some(id.as_str()),
                Block::Editable(_) => None,
            })
            .collect()
    }

    pub fn editable(&self, index: usize) -> Option<&EditableBlock> {
        match self.blocks.get(index) {
            Some(Block::Editable(b)) => Some(b),
            _ => None,
        }
    }

    /// Parse the common text form.
    ///
    /// Anchor lines become opaque blocks with empty `raw`.
    pub fn from_text(text: &str) -> Self {
        let mut parser = TextParser::default();
        for line in text.replace("\r\n", "\n").lines() {
            parser.line(line);
        }
        parser.finish()
    }
}

/// Anchor line standing in for an opaque block.
pub fn anchor_line(id: &str) -> String {
    format!("{}{}{}", ANCHOR_PREFIX, id, ANCHOR_SUFFIX)
}

/// Id named by an anchor line, if `line` is one.
pub fn parse_anchor(line: &str) -> Option<&str> {
    let id = line
        .trim()
        .strip_prefix(ANCHOR_PREFIX)?
        .strip_suffix(ANCHOR_SUFFIX)?;
    if id.is_empty() || id.contains(char::is_whitespace) {
        None
    } else {
        Some(id)
    }
}

fn table_row_line(cells: &[String]) -> String {
    let escaped: Vec<String> = cells.iter().map(|c| c.replace('|', "\\|")).collect();
    format!("| {} |", escaped.join(" | "))
}

fn separator_line(columns: usize) -> String {
    let dashes = vec!["---"; columns.max(1)];
    format!("| {} |", dashes.join(" | "))
}

/// Split a `| a | b |` line into unescaped cells.
pub fn split_table_row(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = match inner.strip_suffix('|') {
        Some(rest) if !rest.ends_with('\\') => rest,
        _ => inner,
    };

    let mut cells = Vec::new();
    let mut current = String::new();
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'|') => {
                current.push('|');
                chars.next();
            }
            '|' => {
                cells.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    cells.push(current.trim().to_string());
    cells
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#{1,6})\s+(.*)$").expect("static regex"))
}

fn bullet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(-|\d+\.)\s+(.*)$").expect("static regex"))
}

fn separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^:?-{3,}:?$").expect("static regex"))
}

fn is_separator_row(line: &str) -> bool {
    let cells = split_table_row(line);
    !cells.is_empty() && cells.iter().all(|c| separator_re().is_match(c))
}

#[derive(Default)]
struct TextParser {
    blocks: Vec<Block>,
    paragraph: Vec<String>,
    table: Vec<String>,
    list: Vec<(bool, String)>,
}

impl TextParser {
    fn line(&mut self, line: &str) {
        if line.trim().is_empty() {
            self.flush();
            return;
        }
        if let Some(id) = parse_anchor(line) {
            self.flush();
            self.blocks.push(Block::Opaque {
                id: id.to_string(),
                raw: String::new(),
            });
            return;
        }
        if let Some(caps) = heading_re().captures(line) {
            self.flush();
            self.blocks.push(Block::Editable(EditableBlock::Heading {
                level: caps[1].len() as u8,
                text: caps[2].trim_end().to_string(),
            }));
            return;
        }
        if line.trim_start().starts_with('|') {
            self.flush_paragraph();
            self.flush_list();
            self.table.push(line.to_string());
            return;
        }
        if self.paragraph.is_empty() {
            if let Some(caps) = bullet_re().captures(line) {
                self.flush_table();
                let ordered = caps[1].ends_with('.');
                if self.list.first().is_some_and(|(o, _)| *o != ordered) {
                    self.flush_list();
                }
                self.list.push((ordered, caps[2].to_string()));
                return;
            }
        }
        self.flush_table();
        self.flush_list();
        self.paragraph.push(line.to_string());
    }

    fn flush(&mut self) {
        self.flush_paragraph();
        self.flush_table();
        self.flush_list();
    }

    fn flush_paragraph(&mut self) {
        if self.paragraph.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.paragraph).join("\n");
        self.blocks
            .push(Block::Editable(EditableBlock::Paragraph { text }));
    }

    fn flush_list(&mut self) {
        if self.list.is_empty() {
            return;
        }
        let entries = std::mem::take(&mut self.list);
        let ordered = entries[0].0;
        let items = entries.into_iter().map(|(_, item)| item).collect();
        self.blocks
            .push(Block::Editable(EditableBlock::List { ordered, items }));
    }

    fn flush_table(&mut self) {
        if self.table.is_empty() {
            return;
        }
        let lines = std::mem::take(&mut self.table);
        let header = lines.len() > 1 && is_separator_row(&lines[1]);
        let rows = lines
            .iter()
            .enumerate()
            .filter(|(i, _)| !(header && *i == 1))
            .map(|(_, l)| split_table_row(l))
            .collect();
        self.blocks
            .push(Block::Editable(EditableBlock::Table { header, rows }));
    }

    fn finish(mut self) -> Document {
        self.flush();
        Document::new(self.blocks)
    }
}
