//! Surgical operations and their transactional application.

use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::document::{Block, Document, EditableBlock};
use crate::errors::PatchError;
use crate::fingerprint::fingerprint;

/// Addresses one editable block of the base document: its index plus a
/// fingerprint of its text form, so a locator matches exactly one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub block: usize,
    pub fingerprint: String,
}

impl Locator {
    /// Locator for block `index`; `None` for opaque or missing blocks.
    pub fn of(doc: &Document, index: usize) -> Option<Self> {
        let block = doc.editable(index)?;
        Some(Self {
            block: index,
            fingerprint: block_fingerprint(block),
        })
    }

    /// Check the locator still names the same block in `doc`.
    pub fn verify<'d>(
        &self,
        doc: &'d Document,
        op_index: usize,
    ) -> Result<&'d EditableBlock, PatchError> {
        match doc.blocks().get(self.block) {
            Some(Block::Editable(block)) if block_fingerprint(block) == self.fingerprint => {
                Ok(block)
            }
            Some(Block::Opaque { id, .. }) => Err(PatchError::OpaqueTarget { id: id.clone() }),
            _ => Err(PatchError::LocatorMismatch { index: op_index }),
        }
    }
}

fn block_fingerprint(block: &EditableBlock) -> String {
    fingerprint(&block.lines().join("\n"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPosition {
    Before,
    After,
}

/// A minimal, targeted edit to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SurgicalOperation {
    /// Replace the text of a heading, a paragraph, or a list (one item per
    /// line).
    UpdateText { at: Locator, text: String },
    DeleteBlock { at: Locator },
    ChangeHeadingLevel { at: Locator, level: u8 },
    /// Insert a row before base row `row`; `row == len` appends.
    TableInsertRow {
        at: Locator,
        row: usize,
        cells: Vec<String>,
    },
    TableUpdateCell {
        at: Locator,
        row: usize,
        column: usize,
        text: String,
    },
    TableDeleteRow { at: Locator, row: usize },
    /// Insert new editable blocks next to a located block.
    InsertBlock {
        at: Locator,
        position: InsertPosition,
        blocks: Vec<EditableBlock>,
    },
    /// Rebuild the document from text; opaque blocks are carried over.
    ReplaceWholeDocument { text: String },
}

impl SurgicalOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UpdateText { .. } => "update_text",
            Self::DeleteBlock { .. } => "delete_block",
            Self::ChangeHeadingLevel { .. } => "change_heading_level",
            Self::TableInsertRow { .. } => "table_insert_row",
            Self::TableUpdateCell { .. } => "table_update_cell",
            Self::TableDeleteRow { .. } => "table_delete_row",
            Self::InsertBlock { .. } => "insert_block",
            Self::ReplaceWholeDocument { .. } => "replace_whole_document",
        }
    }

    pub fn locator(&self) -> Option<&Locator> {
        match self {
            Self::UpdateText { at, .. }
            | Self::DeleteBlock { at }
            | Self::ChangeHeadingLevel { at, .. }
            | Self::TableInsertRow { at, .. }
            | Self::TableUpdateCell { at, .. }
            | Self::TableDeleteRow { at, .. }
            | Self::InsertBlock { at, .. } => Some(at),
            Self::ReplaceWholeDocument { .. } => None,
        }
    }

    /// `true` for cell- and row-level table edits.
    pub fn is_table_edit(&self) -> bool {
        matches!(
            self,
            Self::TableInsertRow { .. } | Self::TableUpdateCell { .. } | Self::TableDeleteRow { .. }
        )
    }

    /// Position in base coordinates. Operations are applied in descending
    /// order of `(key, seq)` so an edit never shifts the position of one
    /// still to come; at the same position in-place edits run before inserts.
    fn sort_key(&self) -> (usize, u8, usize, u8) {
        match self {
            Self::InsertBlock { at, position, .. } => {
                let pos = match position {
                    InsertPosition::Before => at.block,
                    InsertPosition::After => at.block + 1,
                };
                (pos, 0, 0, 0)
            }
            Self::TableInsertRow { at, row, .. } => (at.block, 1, *row, 0),
            Self::TableUpdateCell { at, row, .. } | Self::TableDeleteRow { at, row } => {
                (at.block, 1, *row, 1)
            }
            Self::UpdateText { at, .. }
            | Self::DeleteBlock { at }
            | Self::ChangeHeadingLevel { at, .. } => (at.block, 1, 0, 1),
            Self::ReplaceWholeDocument { .. } => (0, 0, 0, 0),
        }
    }
}

/// Apply `ops` to a copy of `base`. Either every operation applies or the
/// base is returned untouched with an error.
pub fn apply_operations(base: &Document, ops: &[SurgicalOperation]) -> Result<Document, PatchError> {
    if let Some(SurgicalOperation::ReplaceWholeDocument { text }) = ops.first() {
        if ops.len() == 1 {
            return Ok(replace_whole(base, text));
        }
    }

    for (i, op) in ops.iter().enumerate() {
        match op.locator() {
            Some(at) => {
                at.verify(base, i)?;
            }
            None => return Err(PatchError::LocatorMismatch { index: i }),
        }
    }

    let mut order: Vec<(usize, &SurgicalOperation)> = ops.iter().enumerate().collect();
    order.sort_by_key(|(seq, op)| Reverse((op.sort_key(), *seq)));

    let mut doc = base.clone();
    for (seq, op) in order {
        apply_one(&mut doc, op, seq)?;
    }
    debug!(operations = ops.len(), "applied surgical operations");
    Ok(doc)
}

fn apply_one(doc: &mut Document, op: &SurgicalOperation, index: usize) -> Result<(), PatchError> {
    match op {
        SurgicalOperation::UpdateText { at, text } => match editable(doc, at, index)? {
            EditableBlock::Heading { text: t, .. } | EditableBlock::Paragraph { text: t } => {
                *t = text.clone();
                Ok(())
            }
            EditableBlock::List { items, .. } => {
                *items = text.split('\n').map(str::to_string).collect();
                Ok(())
            }
            EditableBlock::Table { .. } => Err(PatchError::WrongBlockKind {
                op: "update_text",
                kind: "table",
            }),
        },
        SurgicalOperation::DeleteBlock { at } => {
            doc.remove(at.block);
            Ok(())
        }
        SurgicalOperation::ChangeHeadingLevel { at, level } => match editable(doc, at, index)? {
            EditableBlock::Heading { level: l, .. } => {
                *l = (*level).clamp(1, 6);
                Ok(())
            }
            other => Err(PatchError::WrongBlockKind {
                op: "change_heading_level",
                kind: other.kind(),
            }),
        },
        SurgicalOperation::TableInsertRow { at, row, cells } => {
            let rows = table_rows(doc, at, index, "table_insert_row")?;
            let columns = rows.first().map_or(cells.len(), Vec::len);
            if *row > rows.len() || cells.len() != columns {
                return Err(PatchError::OutOfRange {
                    row: *row,
                    column: None,
                });
            }
            rows.insert(*row, cells.clone());
            Ok(())
        }
        SurgicalOperation::TableUpdateCell {
            at,
            row,
            column,
            text,
        } => {
            let rows = table_rows(doc, at, index, "table_update_cell")?;
            let cell = rows
                .get_mut(*row)
                .and_then(|r| r.get_mut(*column))
                .ok_or(PatchError::OutOfRange {
                    row: *row,
                    column: Some(*column),
                })?;
            *cell = text.clone();
            Ok(())
        }
        SurgicalOperation::TableDeleteRow { at, row } => {
            let rows = table_rows(doc, at, index, "table_delete_row")?;
            if *row >= rows.len() || rows.len() == 1 {
                return Err(PatchError::OutOfRange {
                    row: *row,
                    column: None,
                });
            }
            rows.remove(*row);
            Ok(())
        }
        SurgicalOperation::InsertBlock {
            at,
            position,
            blocks,
        } => {
            let mut pos = match position {
                InsertPosition::Before => at.block,
                InsertPosition::After => at.block + 1,
            };
            pos = pos.min(doc.len());
            for block in blocks {
                doc.insert(pos, Block::Editable(block.clone()));
                pos += 1;
            }
            Ok(())
        }
        SurgicalOperation::ReplaceWholeDocument { .. } => {
            Err(PatchError::LocatorMismatch { index })
        }
    }
}

fn editable<'d>(
    doc: &'d mut Document,
    at: &Locator,
    index: usize,
) -> Result<&'d mut EditableBlock, PatchError> {
    doc.editable_mut(at.block)
        .ok_or(PatchError::LocatorMismatch { index })
}

fn table_rows<'d>(
    doc: &'d mut Document,
    at: &Locator,
    index: usize,
    op: &'static str,
) -> Result<&'d mut Vec<Vec<String>>, PatchError> {
    match editable(doc, at, index)? {
        EditableBlock::Table { rows, .. } => Ok(rows),
        other => Err(PatchError::WrongBlockKind {
            op,
            kind: other.kind(),
        }),
    }
}

/// Build a document from `text`, keeping every opaque block of `base`.
///
/// Anchors in `text` are re-materialised with the base block's markup;
/// anchors unknown to the base are dropped; base opaque blocks the text does
/// not mention are appended in their original order.
pub fn replace_whole(base: &Document, text: &str) -> Document {
    let desired = Document::from_text(text);
    let base_opaque: Vec<(&str, &str)> = base
        .blocks()
        .iter()
        .filter_map(|b| match b {
            Block::Opaque { id, raw } => Some((id.as_str(), raw.as_str())),
            Block::Editable(_) => None,
        })
        .collect();

    let mut out = Document::default();
    let mut used: Vec<&str> = Vec::new();
    for block in desired.blocks() {
        match block {
            Block::Editable(_) => out.push(block.clone(), None),
            Block::Opaque { id, .. } => match base_opaque.iter().find(|(bid, _)| bid == id) {
                Some((bid, raw)) if !used.contains(bid) => {
                    used.push(bid);
                    out.push(
                        Block::Opaque {
                            id: id.clone(),
                            raw: raw.to_string(),
                        },
                        None,
                    );
                }
                _ => warn!(id = %id, "dropping anchor with no matching block"),
            },
        }
    }
    for (id, raw) in base_opaque {
        if !used.contains(&id) {
            out.push(
                Block::Opaque {
                    id: id.to_string(),
                    raw: raw.to_string(),
                },
                None,
            );
        }
    }
    out
}
