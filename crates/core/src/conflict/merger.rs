//! Line-based three-way merge engine.
//!
//! Both sides are diffed against the baseline with `similar`. Changes whose
//! baseline ranges do not intersect are applied together, even when they
//! touch adjacent lines; intersecting changes that differ produce a conflict
//! region carrying the local, baseline and remote lines verbatim.

use similar::{capture_diff_slices, Algorithm, DiffTag};
use tracing::{debug, info};

pub const MARKER_LOCAL: &str = "<<<<<<< local";
pub const MARKER_BASE: &str = "||||||| baseline";
pub const MARKER_SEP: &str = "=======";
pub const MARKER_REMOTE: &str = ">>>>>>> remote";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    Clean,
    Conflict,
}

/// The result of a three-way merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub status: MergeStatus,
    /// Merged text; carries conflict markers when `status` is `Conflict`.
    pub merged_text: String,
    pub conflicts: Vec<ConflictRegion>,
}

impl MergeResult {
    pub fn is_clean(&self) -> bool {
        self.status == MergeStatus::Clean
    }

    fn clean(text: &str) -> Self {
        Self {
            status: MergeStatus::Clean,
            merged_text: text.to_string(),
            conflicts: Vec::new(),
        }
    }
}

/// One overlapping region. Baseline indices are 0-based, end exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRegion {
    pub base_start: usize,
    pub base_end: usize,
    pub local: Vec<String>,
    pub base: Vec<String>,
    pub remote: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Local,
    Remote,
}

/// A change to baseline lines `start..end`, replaced by `lines`.
#[derive(Debug, Clone)]
struct Hunk<'a> {
    side: Side,
    start: usize,
    end: usize,
    lines: Vec<&'a str>,
}

/// Stateless three-way merge engine.
pub struct Merger;

impl Merger {
    /// Merge `local` and `remote`, both derived from `base`.
    pub fn three_way_merge(base: &str, local: &str, remote: &str) -> MergeResult {
        info!("performing three-way merge");

        if local == base || local == remote {
            debug!("local unchanged or identical to remote, remote wins cleanly");
            return MergeResult::clean(remote);
        }
        if remote == base {
            debug!("remote unchanged, local wins cleanly");
            return MergeResult::clean(local);
        }

        let base_n = normalize(base);
        let local_n = normalize(local);
        let remote_n = normalize(remote);
        let base_lines: Vec<&str> = base_n.lines().collect();
        let local_lines: Vec<&str> = local_n.lines().collect();
        let remote_lines: Vec<&str> = remote_n.lines().collect();

        let mut hunks = hunks_for(Side::Local, &base_lines, &local_lines);
        hunks.extend(hunks_for(Side::Remote, &base_lines, &remote_lines));
        hunks.sort_by_key(|h| (h.start, h.end, h.side == Side::Remote));

        let mut out: Vec<String> = Vec::new();
        let mut conflicts = Vec::new();
        let mut cursor = 0;
        let mut i = 0;

        while i < hunks.len() {
            let mut start = hunks[i].start;
            let mut end = hunks[i].end;
            let mut j = i + 1;
            while j < hunks.len() && overlaps(start, end, hunks[j].start, hunks[j].end) {
                start = start.min(hunks[j].start);
                end = end.max(hunks[j].end);
                j += 1;
            }
            let cluster = &hunks[i..j];

            out.extend(base_lines[cursor..start].iter().map(|l| l.to_string()));

            let has_local = cluster.iter().any(|h| h.side == Side::Local);
            let has_remote = cluster.iter().any(|h| h.side == Side::Remote);
            let local_region = region(&base_lines, start, end, cluster, Side::Local);
            let remote_region = region(&base_lines, start, end, cluster, Side::Remote);

            if !(has_local && has_remote) || local_region == remote_region {
                let chosen = if has_local { local_region } else { remote_region };
                out.extend(chosen);
            } else {
                debug!(base_start = start, base_end = end, "overlapping edits");
                let base_region: Vec<String> =
                    base_lines[start..end].iter().map(|l| l.to_string()).collect();
                out.push(MARKER_LOCAL.to_string());
                out.extend(local_region.iter().cloned());
                out.push(MARKER_BASE.to_string());
                out.extend(base_region.iter().cloned());
                out.push(MARKER_SEP.to_string());
                out.extend(remote_region.iter().cloned());
                out.push(MARKER_REMOTE.to_string());
                conflicts.push(ConflictRegion {
                    base_start: start,
                    base_end: end,
                    local: local_region,
                    base: base_region,
                    remote: remote_region,
                });
            }

            cursor = end;
            i = j;
        }
        out.extend(base_lines[cursor..].iter().map(|l| l.to_string()));

        let mut merged_text = out.join("\n");
        if !merged_text.is_empty() {
            merged_text.push('\n');
        }

        let status = if conflicts.is_empty() {
            MergeStatus::Clean
        } else {
            MergeStatus::Conflict
        };
        info!(
            clean = conflicts.is_empty(),
            regions = conflicts.len(),
            "three-way merge finished"
        );
        MergeResult {
            status,
            merged_text,
            conflicts,
        }
    }

    /// Quick check: would these three versions merge without conflicts?
    pub fn can_auto_merge(base: &str, local: &str, remote: &str) -> bool {
        Self::three_way_merge(base, local, remote).is_clean()
    }
}

/// `true` if `text` still carries unresolved merge markers.
pub fn has_conflict_markers(text: &str) -> bool {
    let mut open = false;
    for line in text.lines() {
        if line.starts_with(MARKER_LOCAL) {
            open = true;
        } else if open && line.starts_with(MARKER_REMOTE) {
            return true;
        }
    }
    false
}

fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n")
}

/// Changed baseline ranges of `other`, adjacent diff ops coalesced.
fn hunks_for<'a>(side: Side, base: &[&str], other: &[&'a str]) -> Vec<Hunk<'a>> {
    let mut out: Vec<Hunk<'a>> = Vec::new();
    let mut last_end: Option<(usize, usize)> = None;

    for op in capture_diff_slices(Algorithm::Myers, base, other) {
        let (tag, old, new) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            last_end = None;
            continue;
        }
        let lines = other[new.clone()].to_vec();
        match (last_end, out.last_mut()) {
            (Some((old_end, new_end)), Some(prev)) if old_end == old.start && new_end == new.start => {
                prev.end = old.end;
                prev.lines.extend(lines);
            }
            _ => out.push(Hunk {
                side,
                start: old.start,
                end: old.end,
                lines,
            }),
        }
        last_end = Some((old.end, new.end));
    }
    out
}

/// Do two baseline ranges touch the same lines?
///
/// Pure insertions conflict with each other only at the same point, and
/// with a change only strictly inside it.
fn overlaps(a_start: usize, a_end: usize, b_start: usize, b_end: usize) -> bool {
    let a_empty = a_start == a_end;
    let b_empty = b_start == b_end;
    match (a_empty, b_empty) {
        (true, true) => a_start == b_start,
        (true, false) => b_start < a_start && a_start < b_end,
        (false, true) => a_start < b_start && b_start < a_end,
        (false, false) => a_start < b_end && b_start < a_end,
    }
}

/// One side's version of baseline lines `start..end`.
fn region(
    base: &[&str],
    start: usize,
    end: usize,
    cluster: &[Hunk<'_>],
    side: Side,
) -> Vec<String> {
    let mut out = Vec::new();
    let mut cursor = start;
    for hunk in cluster.iter().filter(|h| h.side == side) {
        out.extend(base[cursor..hunk.start].iter().map(|l| l.to_string()));
        out.extend(hunk.lines.iter().map(|l| l.to_string()));
        cursor = hunk.end;
    }
    out.extend(base[cursor..end].iter().map(|l| l.to_string()));
    out
}
