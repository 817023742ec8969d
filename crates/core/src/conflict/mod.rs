//! Three-way merging of page text.
//!
//! Two-sided edits are merged line by line against the stored baseline.
//! A merge that cannot be completed is an outcome, not an error: the
//! conflicting regions keep both variants and the page is held back from
//! the remote until a human resolves it.

pub mod merger;

pub use merger::{has_conflict_markers, ConflictRegion, MergeResult, MergeStatus, Merger};
