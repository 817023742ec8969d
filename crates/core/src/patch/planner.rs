//! Maps a desired text onto the smallest set of surgical operations.
//!
//! Only the editable projection of a document takes part: opaque blocks
//! have no lines in it, so no planned operation can address them.
//!
//! Full replacement rule: with `E` the non-blank editable lines of the base
//! and `C` the sum over line hunks of `max(deleted, inserted)` non-blank
//! lines, the planner replaces the whole document when `E == 0`, when
//! `C / E` exceeds the replace threshold, or when the bounded plan does not
//! reproduce the desired projection exactly.

use similar::{capture_diff_slices, Algorithm, DiffTag};
use tracing::{debug, info};

use super::ops::{apply_operations, InsertPosition, Locator, SurgicalOperation};
use crate::document::{Block, Document, EditableBlock};

/// Default for `[sync].replace_threshold`.
pub const DEFAULT_REPLACE_THRESHOLD: f64 = 0.5;

/// Planned edits for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchPlan {
    pub operations: Vec<SurgicalOperation>,
    /// `C` of the replacement rule.
    pub changed_lines: usize,
    /// `E` of the replacement rule.
    pub editable_lines: usize,
}

impl PatchPlan {
    pub fn is_noop(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn is_full_replace(&self) -> bool {
        matches!(
            self.operations.as_slice(),
            [SurgicalOperation::ReplaceWholeDocument { .. }]
        )
    }

    pub fn coverage(&self) -> f64 {
        if self.editable_lines == 0 {
            1.0
        } else {
            self.changed_lines as f64 / self.editable_lines as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Planner {
    replace_threshold: f64,
}

impl Default for Planner {
    fn default() -> Self {
        Self::new(DEFAULT_REPLACE_THRESHOLD)
    }
}

impl Planner {
    pub fn new(replace_threshold: f64) -> Self {
        Self { replace_threshold }
    }

    /// Plan the edits turning `base` into `desired_text`.
    pub fn plan(&self, base: &Document, desired_text: &str) -> PatchPlan {
        let desired = Document::from_text(desired_text);
        let base_lines = base.editable_projection().lines;
        let desired_lines = desired.editable_projection().lines;

        let editable_lines = non_blank(&base_lines);
        let changed_lines = changed_lines(&base_lines, &desired_lines);

        if base_lines == desired_lines {
            debug!("editable content unchanged, nothing to plan");
            return PatchPlan {
                operations: Vec::new(),
                changed_lines: 0,
                editable_lines,
            };
        }

        let full = |reason: &str| {
            info!(
                reason,
                changed_lines, editable_lines, "planning full document replacement"
            );
            PatchPlan {
                operations: vec![SurgicalOperation::ReplaceWholeDocument {
                    text: desired_text.to_string(),
                }],
                changed_lines,
                editable_lines,
            }
        };

        if editable_lines == 0 {
            return full("base has no editable content");
        }
        if changed_lines as f64 / editable_lines as f64 > self.replace_threshold {
            return full("change coverage above threshold");
        }

        let operations = bounded_operations(base, &desired);
        match apply_operations(base, &operations) {
            Ok(result) if result.editable_projection().lines == desired_lines => {
                debug!(operations = operations.len(), changed_lines, "bounded plan");
                PatchPlan {
                    operations,
                    changed_lines,
                    editable_lines,
                }
            }
            Ok(_) => full("bounded plan does not reproduce the desired text"),
            Err(e) => {
                debug!(error = %e, "bounded plan failed to apply");
                full("bounded plan failed to apply")
            }
        }
    }
}

fn non_blank(lines: &[String]) -> usize {
    lines.iter().filter(|l| !l.trim().is_empty()).count()
}

/// `C`: per hunk, the larger of deleted and inserted non-blank lines.
fn changed_lines(base: &[String], desired: &[String]) -> usize {
    capture_diff_slices(Algorithm::Myers, base, desired)
        .iter()
        .map(|op| {
            let (tag, old, new) = op.as_tag_tuple();
            if tag == DiffTag::Equal {
                0
            } else {
                non_blank(&base[old]).max(non_blank(&desired[new]))
            }
        })
        .sum()
}

/// Block-level alignment of base and desired editable blocks, refined to
/// in-block edits where the block kinds allow it.
fn bounded_operations(base: &Document, desired: &Document) -> Vec<SurgicalOperation> {
    let base_blocks = editable_blocks(base);
    let desired_blocks = editable_blocks(desired);
    let base_values: Vec<&EditableBlock> = base_blocks.iter().map(|(_, b)| *b).collect();
    let desired_values: Vec<&EditableBlock> = desired_blocks.iter().map(|(_, b)| *b).collect();

    let mut ops = Vec::new();
    for op in capture_diff_slices(Algorithm::Myers, &base_values, &desired_values) {
        let (tag, old, new) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            continue;
        }
        let paired = old.len().min(new.len());

        for k in 0..paired {
            let (index, base_block) = base_blocks[old.start + k];
            let desired_block = desired_values[new.start + k];
            let Some(at) = Locator::of(base, index) else {
                continue;
            };
            match block_edits(&at, base_block, desired_block) {
                Some(edits) => ops.extend(edits),
                None => {
                    ops.push(SurgicalOperation::DeleteBlock { at: at.clone() });
                    ops.push(SurgicalOperation::InsertBlock {
                        at,
                        position: InsertPosition::After,
                        blocks: vec![desired_block.clone()],
                    });
                }
            }
        }

        for k in paired..old.len() {
            let (index, _) = base_blocks[old.start + k];
            if let Some(at) = Locator::of(base, index) {
                ops.push(SurgicalOperation::DeleteBlock { at });
            }
        }

        if new.len() > paired {
            let blocks: Vec<EditableBlock> = desired_values[new.start + paired..new.end]
                .iter()
                .map(|b| (*b).clone())
                .collect();
            // After the last base block of this hunk, else after the block
            // preceding it, else before the first editable block.
            let anchor = if old.start + paired > 0 {
                Some((base_blocks[old.start + paired - 1].0, InsertPosition::After))
            } else {
                base_blocks.first().map(|(i, _)| (*i, InsertPosition::Before))
            };
            if let Some((index, position)) = anchor {
                if let Some(at) = Locator::of(base, index) {
                    ops.push(SurgicalOperation::InsertBlock {
                        at,
                        position,
                        blocks,
                    });
                }
            }
        }
    }
    ops
}

fn editable_blocks(doc: &Document) -> Vec<(usize, &EditableBlock)> {
    doc.blocks()
        .iter()
        .enumerate()
        .filter_map(|(i, b)| match b {
            Block::Editable(e) => Some((i, e)),
            Block::Opaque { .. } => None,
        })
        .collect()
}

/// In-place edits turning `from` into `to`; `None` if the block has to be
/// replaced as a whole.
fn block_edits(
    at: &Locator,
    from: &EditableBlock,
    to: &EditableBlock,
) -> Option<Vec<SurgicalOperation>> {
    let mut ops = Vec::new();
    match (from, to) {
        (
            EditableBlock::Heading { level: l1, text: t1 },
            EditableBlock::Heading { level: l2, text: t2 },
        ) => {
            if l1 != l2 {
                ops.push(SurgicalOperation::ChangeHeadingLevel {
                    at: at.clone(),
                    level: *l2,
                });
            }
            if t1 != t2 {
                ops.push(SurgicalOperation::UpdateText {
                    at: at.clone(),
                    text: t2.clone(),
                });
            }
        }
        (EditableBlock::Paragraph { .. }, EditableBlock::Paragraph { text }) => {
            ops.push(SurgicalOperation::UpdateText {
                at: at.clone(),
                text: text.clone(),
            });
        }
        (
            EditableBlock::List { ordered: o1, .. },
            EditableBlock::List {
                ordered: o2,
                items,
            },
        ) if o1 == o2 => {
            ops.push(SurgicalOperation::UpdateText {
                at: at.clone(),
                text: items.join("\n"),
            });
        }
        (
            EditableBlock::Table {
                header: h1,
                rows: r1,
            },
            EditableBlock::Table {
                header: h2,
                rows: r2,
            },
        ) if h1 == h2 && same_columns(r1, r2) => {
            ops.extend(table_edits(at, *h1, r1, r2)?);
        }
        _ => return None,
    }
    Some(ops)
}

fn same_columns(a: &[Vec<String>], b: &[Vec<String>]) -> bool {
    let Some(columns) = a.first().map(Vec::len) else {
        return false;
    };
    a.iter().chain(b.iter()).all(|row| row.len() == columns)
}

/// Cell updates for positionally paired rows, row deletes and inserts for
/// the rest. A header row is never deleted or displaced.
fn table_edits(
    at: &Locator,
    header: bool,
    from: &[Vec<String>],
    to: &[Vec<String>],
) -> Option<Vec<SurgicalOperation>> {
    let mut ops = Vec::new();
    for op in capture_diff_slices(Algorithm::Myers, from, to) {
        let (tag, old, new) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            continue;
        }
        let paired = old.len().min(new.len());

        for k in 0..paired {
            let row = old.start + k;
            for (column, (a, b)) in from[row].iter().zip(&to[new.start + k]).enumerate() {
                if a != b {
                    ops.push(SurgicalOperation::TableUpdateCell {
                        at: at.clone(),
                        row,
                        column,
                        text: b.clone(),
                    });
                }
            }
        }
        for row in old.start + paired..old.end {
            if header && row == 0 {
                return None;
            }
            ops.push(SurgicalOperation::TableDeleteRow {
                at: at.clone(),
                row,
            });
        }
        let insert_at = old.start + paired;
        if new.len() > paired && header && insert_at == 0 {
            return None;
        }
        for cells in &to[new.start + paired..new.end] {
            ops.push(SurgicalOperation::TableInsertRow {
                at: at.clone(),
                row: insert_at,
                cells: cells.clone(),
            });
        }
    }
    Some(ops)
}
