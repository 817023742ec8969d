//! Domain model types used throughout wikisync.
//!
//! These types bridge the classifier, the executors, the orchestrator and the
//! persisted page state.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::fingerprint;

// ---------------------------------------------------------------------------
// Page record
// ---------------------------------------------------------------------------

/// Persisted knowledge about one tracked page.
///
/// `page_id` is the only join key between the two stores; titles and paths
/// are informational and may change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRecord {
    pub page_id: String,
    pub title: String,
    /// Path of the mirror file, relative to the local root.
    pub local_path: PathBuf,
    pub remote_version: u64,
    /// Content as of the last successful sync; the merge ancestor.
    pub baseline_text: String,
    pub parent_id: Option<String>,
    pub last_synced: DateTime<Utc>,
    /// Set while a merge conflict awaits a human edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_conflict: Option<PendingConflict>,
}

impl PageRecord {
    pub fn new(
        page_id: impl Into<String>,
        title: impl Into<String>,
        local_path: impl Into<PathBuf>,
        remote_version: u64,
        baseline_text: impl Into<String>,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            page_id: page_id.into(),
            title: title.into(),
            local_path: local_path.into(),
            remote_version,
            baseline_text: baseline_text.into(),
            parent_id,
            last_synced: Utc::now(),
            pending_conflict: None,
        }
    }

    pub fn baseline_fingerprint(&self) -> String {
        fingerprint(&self.baseline_text)
    }

    /// Text the local side is compared and merged against.
    ///
    /// While a conflict is pending this is the remote text the conflict was
    /// produced from, otherwise the baseline.
    pub fn merge_base(&self) -> &str {
        match &self.pending_conflict {
            Some(pending) => &pending.remote_text,
            None => &self.baseline_text,
        }
    }

    /// Remote version the local side was last reconciled with.
    pub fn known_remote_version(&self) -> u64 {
        match &self.pending_conflict {
            Some(pending) => pending.remote_version,
            None => self.remote_version,
        }
    }

    /// Advance the record after a confirmed, conflict-free sync.
    pub fn confirm(&mut self, text: impl Into<String>, remote_version: u64) {
        self.baseline_text = text.into();
        self.remote_version = self.remote_version.max(remote_version);
        self.pending_conflict = None;
        self.last_synced = Utc::now();
    }
}

/// Remote side of a conflict that is waiting for a human edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub remote_version: u64,
    pub remote_text: String,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Change set
// ---------------------------------------------------------------------------

/// Something to send to the remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PushTarget {
    /// A tracked page whose local copy changed.
    Existing(String),
    /// A local file with no page behind it yet.
    Create(PathBuf),
}

/// Something to bring from the remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PullTarget {
    /// A tracked page whose remote copy changed.
    Existing(String),
    /// A remote page with no local mirror yet.
    Create(String),
}

/// A page that needs merging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    pub page_id: String,
    /// The local file still carries conflict markers from an earlier cycle.
    pub unresolved: bool,
}

/// A confirmed structural move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMove {
    pub page_id: String,
    pub from_path: PathBuf,
    /// New local location; `None` when the page left the synced tree.
    pub to_path: Option<PathBuf>,
    pub new_parent_id: Option<String>,
}

/// Disjoint labelling of every page observed in one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub unchanged: Vec<String>,
    pub to_push: Vec<PushTarget>,
    pub to_pull: Vec<PullTarget>,
    pub conflicts: Vec<ConflictEntry>,
    /// Gone from the remote: the local mirror gets removed.
    pub deleted_remote: Vec<String>,
    /// Gone locally: the remote page goes to the trash.
    pub deleted_local: Vec<String>,
    /// Moved on the remote: the local file follows.
    pub moved_remote: Vec<PageMove>,
    /// Moved locally: the remote parent follows.
    pub moved_local: Vec<PageMove>,
}

impl ChangeSet {
    /// Number of labelled pages across all categories.
    pub fn len(&self) -> usize {
        self.unchanged.len()
            + self.to_push.len()
            + self.to_pull.len()
            + self.conflicts.len()
            + self.deleted_remote.len()
            + self.deleted_local.len()
            + self.moved_remote.len()
            + self.moved_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every tracked or remote page id that appears in the set, once per label.
    pub fn labelled_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::with_capacity(self.len());
        ids.extend(self.unchanged.iter().map(String::as_str));
        ids.extend(self.to_push.iter().filter_map(|t| match t {
            PushTarget::Existing(id) => Some(id.as_str()),
            PushTarget::Create(_) => None,
        }));
        ids.extend(self.to_pull.iter().map(|t| match t {
            PullTarget::Existing(id) | PullTarget::Create(id) => id.as_str(),
        }));
        ids.extend(self.conflicts.iter().map(|c| c.page_id.as_str()));
        ids.extend(self.deleted_remote.iter().map(String::as_str));
        ids.extend(self.deleted_local.iter().map(String::as_str));
        ids.extend(self.moved_remote.iter().map(|m| m.page_id.as_str()));
        ids.extend(self.moved_local.iter().map(|m| m.page_id.as_str()));
        ids
    }
}

// ---------------------------------------------------------------------------
// Run options
// ---------------------------------------------------------------------------

/// Which side, if any, is overwritten unconditionally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    #[default]
    Bidirectional,
    ForcePush,
    ForcePull,
}

impl SyncMode {
    /// Build a mode from the two CLI flags; both at once is a config error.
    pub fn from_flags(
        force_push: bool,
        force_pull: bool,
    ) -> Result<Self, crate::errors::ConfigError> {
        match (force_push, force_pull) {
            (true, true) => Err(crate::errors::ConfigError::ConflictingModes),
            (true, false) => Ok(Self::ForcePush),
            (false, true) => Ok(Self::ForcePull),
            (false, false) => Ok(Self::Bidirectional),
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bidirectional => write!(f, "bidirectional"),
            Self::ForcePush => write!(f, "force_push"),
            Self::ForcePull => write!(f, "force_pull"),
        }
    }
}

/// Options for one sync cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub mode: SyncMode,
    pub dry_run: bool,
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// One item of a deletion or move batch that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub page_id: String,
    pub error: String,
}

/// Outcome of a partial-failure tolerant batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<ItemFailure>,
}

impl BatchReport {
    pub fn record_success(&mut self, page_id: impl Into<String>) {
        self.succeeded.push(page_id.into());
    }

    pub fn record_failure(&mut self, page_id: impl Into<String>, error: impl ToString) {
        self.failed.push(ItemFailure {
            page_id: page_id.into(),
            error: error.to_string(),
        });
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }
}

/// An action a cycle performed, or would perform under `--dry-run`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub kind: ActionKind,
    /// Page id, or the local path for pages that do not exist remotely yet.
    pub target: String,
    pub detail: String,
    /// Unified diff of the content change, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Push,
    Pull,
    CreateRemote,
    CreateLocal,
    Merge,
    Conflict,
    DeleteLocal,
    TrashRemote,
    MoveLocal,
    MoveRemote,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::CreateRemote => "create remote",
            Self::CreateLocal => "create local",
            Self::Merge => "merge",
            Self::Conflict => "conflict",
            Self::DeleteLocal => "delete local",
            Self::TrashRemote => "trash remote",
            Self::MoveLocal => "move local",
            Self::MoveRemote => "move remote",
        };
        write!(f, "{}", s)
    }
}

/// Overall outcome, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Clean,
    Conflicts,
    Failed,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Clean => 0,
            Self::Conflicts => 2,
            Self::Failed => 1,
        }
    }
}

/// Summary of one sync cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: String,
    pub mode: SyncMode,
    pub dry_run: bool,
    pub unchanged: usize,
    pub pushed: usize,
    pub pulled: usize,
    pub created_remote: usize,
    pub created_local: usize,
    pub merged: usize,
    /// Pages left with conflict markers.
    pub conflicts: Vec<String>,
    pub deletions: BatchReport,
    pub moves: BatchReport,
    /// Per-page failures outside the deletion/move batches.
    pub failures: Vec<ItemFailure>,
    pub actions: Vec<PlannedAction>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncReport {
    pub fn plan(&mut self, kind: ActionKind, target: impl Into<String>, detail: impl Into<String>) {
        self.actions.push(PlannedAction {
            kind,
            target: target.into(),
            detail: detail.into(),
            preview: None,
        });
    }

    /// Record an action together with a diff preview.
    pub fn plan_with_preview(
        &mut self,
        kind: ActionKind,
        target: impl Into<String>,
        detail: impl Into<String>,
        preview: String,
    ) {
        self.actions.push(PlannedAction {
            kind,
            target: target.into(),
            detail: detail.into(),
            preview: Some(preview),
        });
    }

    /// Number of remote or local mutations performed.
    pub fn mutations(&self) -> usize {
        if self.dry_run {
            return 0;
        }
        self.pushed
            + self.pulled
            + self.created_remote
            + self.created_local
            + self.deletions.succeeded.len()
            + self.moves.succeeded.len()
    }

    /// Worst outcome encountered: clean < conflicts < failure.
    pub fn exit_status(&self) -> ExitStatus {
        if !self.failures.is_empty()
            || !self.deletions.failed.is_empty()
            || !self.moves.failed.is_empty()
        {
            ExitStatus::Failed
        } else if !self.conflicts.is_empty() {
            ExitStatus::Conflicts
        } else {
            ExitStatus::Clean
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_flags_are_exclusive() {
        assert!(SyncMode::from_flags(true, true).is_err());
        assert_eq!(SyncMode::from_flags(true, false).unwrap(), SyncMode::ForcePush);
        assert_eq!(SyncMode::from_flags(false, true).unwrap(), SyncMode::ForcePull);
        assert_eq!(
            SyncMode::from_flags(false, false).unwrap(),
            SyncMode::Bidirectional
        );
    }

    #[test]
    fn test_exit_status_ordering() {
        let mut report = SyncReport::default();
        assert_eq!(report.exit_status(), ExitStatus::Clean);
        report.conflicts.push("1".into());
        assert_eq!(report.exit_status(), ExitStatus::Conflicts);
        report.deletions.record_failure("2", "boom");
        assert_eq!(report.exit_status(), ExitStatus::Failed);
        assert!(ExitStatus::Clean < ExitStatus::Conflicts);
        assert!(ExitStatus::Conflicts < ExitStatus::Failed);
        assert_eq!(ExitStatus::Conflicts.code(), 2);
    }

    #[test]
    fn test_record_merge_base_follows_pending_conflict() {
        let mut record = PageRecord::new("7", "Page", "page.md", 3, "base", None);
        assert_eq!(record.merge_base(), "base");
        assert_eq!(record.known_remote_version(), 3);

        record.pending_conflict = Some(PendingConflict {
            remote_version: 5,
            remote_text: "theirs".into(),
            detected_at: Utc::now(),
        });
        assert_eq!(record.merge_base(), "theirs");
        assert_eq!(record.known_remote_version(), 5);

        record.confirm("resolved", 6);
        assert!(record.pending_conflict.is_none());
        assert_eq!(record.remote_version, 6);
        assert_eq!(record.baseline_text, "resolved");
    }

    #[test]
    fn test_confirm_never_lowers_version() {
        let mut record = PageRecord::new("7", "Page", "page.md", 9, "base", None);
        record.confirm("x", 4);
        assert_eq!(record.remote_version, 9);
    }
}
