//! Structural change executors.
//!
//! Deletions and moves run before any content is pushed or pulled, so later
//! phases operate on final paths. Each batch is partial-failure tolerant:
//! a failed item is recorded and the rest of the batch still runs. Items a
//! previous run already handled (remote page gone, file already moved or
//! removed) count as success, so re-running only redoes what failed.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::local::LocalTree;
use crate::models::{BatchReport, PageMove};
use crate::remote::RemoteStore;
use crate::state::PageStateStore;

/// Removes the counterpart of a deleted page and drops its record.
pub struct DeletionExecutor<'a> {
    remote: &'a dyn RemoteStore,
    tree: &'a LocalTree,
}

impl<'a> DeletionExecutor<'a> {
    pub fn new(remote: &'a dyn RemoteStore, tree: &'a LocalTree) -> Self {
        Self { remote, tree }
    }

    /// Pages deleted on the remote: remove the local mirror files.
    pub fn remove_local(&self, state: &mut PageStateStore, page_ids: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        for id in page_ids {
            let Some(record) = state.get(id) else {
                debug!(page_id = %id, "record already dropped");
                report.record_success(id);
                continue;
            };
            match self.tree.remove(&record.local_path) {
                Ok(()) => {
                    state.remove(id);
                    info!(page_id = %id, "local mirror removed");
                    report.record_success(id);
                }
                Err(e) => {
                    warn!(page_id = %id, error = %e, "failed to remove local mirror");
                    report.record_failure(id, e);
                }
            }
        }
        report
    }

    /// Pages deleted locally: move the remote pages to the trash.
    pub async fn trash_remote(
        &self,
        state: &mut PageStateStore,
        page_ids: &[String],
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for id in page_ids {
            match self.remote.trash(id).await {
                Ok(()) => {
                    info!(page_id = %id, "remote page moved to trash");
                }
                Err(e) if e.is_not_found() => {
                    debug!(page_id = %id, "remote page already gone");
                }
                Err(e) => {
                    warn!(page_id = %id, error = %e, "failed to trash remote page");
                    report.record_failure(id, e);
                    continue;
                }
            }
            state.remove(id);
            report.record_success(id);
        }
        report
    }
}

/// Makes one side follow a move observed on the other. Page bodies are
/// never read or written here.
pub struct MoveExecutor<'a> {
    remote: &'a dyn RemoteStore,
    tree: &'a LocalTree,
}

impl<'a> MoveExecutor<'a> {
    pub fn new(remote: &'a dyn RemoteStore, tree: &'a LocalTree) -> Self {
        Self { remote, tree }
    }

    /// Remote reparent: relocate the local file (and its child directory).
    pub fn follow_remote(&self, state: &mut PageStateStore, moves: &[PageMove]) -> BatchReport {
        let mut report = BatchReport::default();
        for mv in moves {
            let Some(mut record) = state.get(&mv.page_id).cloned() else {
                report.record_failure(&mv.page_id, "page is not tracked");
                continue;
            };

            if let Some(to) = mv.to_path.as_ref().filter(|to| **to != mv.from_path) {
                if let Some(other) = state
                    .find_by_path(to)
                    .filter(|r| r.page_id != mv.page_id)
                {
                    warn!(
                        page_id = %mv.page_id,
                        path = %to.display(),
                        occupant = %other.page_id,
                        "move target is taken by another page"
                    );
                    report.record_failure(
                        &mv.page_id,
                        format!("{} is already the mirror of page {}", to.display(), other.page_id),
                    );
                    continue;
                }
                if let Err(e) = self.tree.relocate(&mv.from_path, to) {
                    warn!(page_id = %mv.page_id, error = %e, "failed to relocate local file");
                    report.record_failure(&mv.page_id, e);
                    continue;
                }
                match self.tree.relocate_children(&mv.from_path, to) {
                    Ok(true) => rebase_children(state, &mv.from_path, to),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(page_id = %mv.page_id, error = %e, "child pages left in place");
                    }
                }
                record.local_path = to.clone();
            }

            record.parent_id = mv.new_parent_id.clone();
            if let Err(e) = state.upsert(record) {
                report.record_failure(&mv.page_id, e);
                continue;
            }
            info!(page_id = %mv.page_id, to = ?mv.to_path, "local mirror follows remote move");
            report.record_success(&mv.page_id);
        }
        report
    }

    /// Local move: reparent the remote page to match.
    pub async fn follow_local(
        &self,
        state: &mut PageStateStore,
        moves: &[PageMove],
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for mv in moves {
            let Some(mut record) = state.get(&mv.page_id).cloned() else {
                report.record_failure(&mv.page_id, "page is not tracked");
                continue;
            };

            if let Some(parent) = mv
                .new_parent_id
                .as_deref()
                .filter(|p| record.parent_id.as_deref() != Some(*p))
            {
                if let Err(e) = self.remote.move_page(&mv.page_id, parent).await {
                    warn!(page_id = %mv.page_id, parent, error = %e, "failed to reparent remote page");
                    report.record_failure(&mv.page_id, e);
                    continue;
                }
                info!(page_id = %mv.page_id, parent, "remote page reparented");
            }

            if let Some(to) = &mv.to_path {
                record.local_path = to.clone();
            }
            record.parent_id = mv.new_parent_id.clone();
            if let Err(e) = state.upsert(record) {
                report.record_failure(&mv.page_id, e);
                continue;
            }
            report.record_success(&mv.page_id);
        }
        report
    }
}

/// Point records of pages below a moved directory at their new paths.
fn rebase_children(state: &mut PageStateStore, from: &Path, to: &Path) {
    let from_dir = from.with_extension("");
    let to_dir = to.with_extension("");
    let moved: Vec<_> = state
        .records()
        .filter_map(|r| {
            let rest = r.local_path.strip_prefix(&from_dir).ok()?;
            let mut record = r.clone();
            record.local_path = to_dir.join(rest);
            Some(record)
        })
        .collect();
    for record in moved {
        debug!(page_id = %record.page_id, path = %record.local_path.display(), "child record rebased");
        if let Err(e) = state.upsert(record) {
            warn!(error = %e, "failed to rebase child record");
        }
    }
}
