//! Bidirectional wiki <-> file synchronization engine.
//!
//! The [`SyncEngine`] runs one cycle in a fixed phase order:
//!
//! 1. List the remote tree, fetch changed pages, scan the local tree.
//! 2. Classify every page against the stored records and resolve ambiguous
//!    absences by `page_id`.
//! 3. Apply deletions and moves, so content phases see final paths.
//! 4. Three-way merge pages changed on both sides.
//! 5. Push, pull and create content; pushes run on a bounded worker pool.
//! 6. Persist records and `last_synced`.
//!
//! Force modes skip phases 2 to 4 and overwrite one side. A dry run stops
//! short of any write and reports the actions it would take. A lock flag
//! prevents concurrent cycles.

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classify::{
    label_content, record_label, title_excluded, Classification, Classifier, RemoteEntry,
    RemoteSnapshot,
};
use crate::config::SyncConfig;
use crate::conflict::{has_conflict_markers, Merger};
use crate::convert::{ContentConverter, StorageFormatConverter};
use crate::disambiguate::{local_path_for, Disambiguated, Disambiguator};
use crate::document::Document;
use crate::errors::{PatchError, RemoteError, SyncError};
use crate::executor::{DeletionExecutor, MoveExecutor};
use crate::fingerprint::same_content;
use crate::local::{LocalPage, LocalTree, PageHeader};
use crate::models::{
    ActionKind, ChangeSet, ItemFailure, PageRecord, PendingConflict, PullTarget, PushTarget,
    SyncMode, SyncOptions, SyncReport,
};
use crate::patch::{DocumentPatcher, PageLocks, PatchResult, PushOutcome};
use crate::remote::{ConfluenceClient, RemotePage, RemoteStore, RetryingRemote};
use crate::state::{JsonStateFile, PageStateStore, StateBackend};

// ---------------------------------------------------------------------------
// Status types
// ---------------------------------------------------------------------------

/// What the local tree looks like against the stored records, without
/// asking the remote.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalStatus {
    pub tracked: usize,
    pub last_synced: Option<DateTime<Utc>>,
    /// Tracked files edited since the last sync.
    pub modified: Vec<PathBuf>,
    /// Files with no record yet.
    pub new_files: Vec<PathBuf>,
    /// Tracked files no longer at their recorded path.
    pub missing: Vec<PathBuf>,
    /// Files still carrying conflict markers.
    pub conflicts: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// Cycle internals
// ---------------------------------------------------------------------------

/// Mutable state of one cycle.
struct Cycle {
    state: PageStateStore,
    report: SyncReport,
    dry_run: bool,
}

impl Cycle {
    fn fail(&mut self, target: impl Into<String>, error: impl ToString) {
        self.report.failures.push(ItemFailure {
            page_id: target.into(),
            error: error.to_string(),
        });
    }
}

/// Phase 1 output.
struct Observation {
    remote: RemoteSnapshot,
    local: Vec<LocalPage>,
    /// Pages whose fetch or conversion failed; they sit this cycle out.
    skipped: HashSet<String>,
}

/// One submission for the worker pool.
struct PushJob {
    page_id: String,
    title: String,
    desired: String,
    /// Remote text `desired` was derived from; `None` overwrites.
    expected: Option<String>,
    local_path: PathBuf,
    local_body: String,
    local_version: Option<u64>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The bidirectional sync engine.
pub struct SyncEngine {
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    converter: Arc<dyn ContentConverter>,
    state_backend: Arc<dyn StateBackend>,
    tree: LocalTree,
    locks: Arc<PageLocks>,
    /// Atomic flag preventing concurrent sync cycles.
    running: Arc<AtomicBool>,
    started_at: DateTime<Utc>,
}

impl SyncEngine {
    /// Create an engine from explicit collaborators.
    pub fn new(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        converter: Arc<dyn ContentConverter>,
        state_backend: Arc<dyn StateBackend>,
    ) -> Self {
        info!(root = %config.local.root.display(), "initializing sync engine");
        let tree = LocalTree::from_config(&config.local);
        Self {
            config,
            remote,
            converter,
            state_backend,
            tree,
            locks: Arc::new(PageLocks::new()),
            running: Arc::new(AtomicBool::new(false)),
            started_at: Utc::now(),
        }
    }

    /// Wire the production collaborators: the REST client behind the retry
    /// policy, the storage-format converter and the JSON state file.
    pub fn from_config(config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        config.require_token()?;
        let client = ConfluenceClient::from_config(&config.remote)?;
        let remote = RetryingRemote::new(client, config.retry.policy());
        let backend = JsonStateFile::new(config.state_path());
        Ok(Self::new(
            config,
            Arc::new(remote),
            Arc::new(StorageFormatConverter::new()),
            Arc::new(backend),
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn tree(&self) -> &LocalTree {
        &self.tree
    }

    /// Check if a sync cycle is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Execute one sync cycle.
    ///
    /// Conflicts and per-page failures do not fail the cycle; they are in
    /// the report and its [`SyncReport::exit_status`]. Errors are run-level:
    /// bad configuration or state, rejected credentials, an unreachable
    /// remote. Whatever completed before such an error is persisted.
    pub async fn run(&self, options: SyncOptions) -> Result<SyncReport, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning {
                started_at: self.started_at.to_rfc3339(),
            });
        }
        let _guard = SyncLockGuard(self.running.clone());

        self.config.validate()?;
        let state = PageStateStore::load(self.state_backend.as_ref())?;

        let mut cycle = Cycle {
            state,
            report: SyncReport {
                run_id: Uuid::new_v4().to_string(),
                mode: options.mode,
                dry_run: options.dry_run,
                started_at: Some(Utc::now()),
                ..Default::default()
            },
            dry_run: options.dry_run,
        };
        info!(
            run_id = %cycle.report.run_id,
            mode = %options.mode,
            dry_run = options.dry_run,
            tracked = cycle.state.len(),
            "sync cycle starting"
        );

        let result = match options.mode {
            SyncMode::Bidirectional => self.bidirectional(&mut cycle).await,
            SyncMode::ForcePush => self.force_push(&mut cycle).await,
            SyncMode::ForcePull => self.force_pull(&mut cycle).await,
        };

        if let Err(e) = result {
            warn!(error = %e, "sync cycle aborted");
            if let Err(save_err) = self.checkpoint(&cycle) {
                warn!(error = %save_err, "failed to persist partial progress");
            }
            return Err(e);
        }

        let completed = Utc::now();
        if !cycle.dry_run {
            cycle.state.save(self.state_backend.as_ref(), completed)?;
        }
        cycle.report.completed_at = Some(completed);

        let report = cycle.report;
        info!(
            run_id = %report.run_id,
            unchanged = report.unchanged,
            pushed = report.pushed,
            pulled = report.pulled,
            created_remote = report.created_remote,
            created_local = report.created_local,
            merged = report.merged,
            conflicts = report.conflicts.len(),
            deletions = report.deletions.succeeded.len(),
            moves = report.moves.succeeded.len(),
            failures = report.failures.len(),
            "sync cycle completed"
        );
        Ok(report)
    }

    /// Compare the local tree with the stored records. No remote calls.
    pub fn local_status(&self) -> Result<LocalStatus, SyncError> {
        local_status(&self.tree, self.state_backend.as_ref())
    }

    /// Records of pages waiting for a human to resolve a conflict.
    pub fn pending_conflicts(&self) -> Result<Vec<PageRecord>, SyncError> {
        pending_conflicts(self.state_backend.as_ref())
    }

    // -----------------------------------------------------------------------
    // Bidirectional cycle
    // -----------------------------------------------------------------------

    async fn bidirectional(&self, cycle: &mut Cycle) -> Result<(), SyncError> {
        // 1. Observe both sides.
        let mut observed = self.observe(cycle).await?;

        // 2. Classify.
        let mut classification =
            Classifier::new(&cycle.state, &self.config.sync.exclude_titles, &observed.skipped)
                .classify(&observed.local, &observed.remote);
        for record in std::mem::take(&mut classification.adoptions) {
            cycle.state.upsert(record)?;
        }
        self.disambiguate(cycle, &mut observed, &mut classification)
            .await?;
        let changes = std::mem::take(&mut classification.changes);
        info!(
            unchanged = changes.unchanged.len(),
            to_push = changes.to_push.len(),
            to_pull = changes.to_pull.len(),
            conflicts = changes.conflicts.len(),
            deleted_remote = changes.deleted_remote.len(),
            deleted_local = changes.deleted_local.len(),
            moved_remote = changes.moved_remote.len(),
            moved_local = changes.moved_local.len(),
            "classification complete"
        );
        cycle.report.unchanged = changes.unchanged.len();
        self.refresh_versions(cycle, &classification.version_refresh, &observed.remote)?;
        self.settle_unchanged(cycle, &changes)?;

        // 3. Structure before content.
        self.apply_structure(cycle, &changes).await?;

        // 4. Merge two-sided edits.
        let mut jobs = self.merge_conflicts(cycle, &changes, &observed)?;

        // 5. Content.
        let mut creates = Vec::new();
        for target in &changes.to_push {
            match target {
                PushTarget::Existing(id) => {
                    if let Some(job) = self.push_job(cycle, id, &observed.local) {
                        jobs.push(job);
                    }
                }
                PushTarget::Create(path) => creates.push(path.clone()),
            }
        }
        self.run_pushes(cycle, jobs).await?;
        self.create_remote_pages(cycle, creates, &observed.local)
            .await?;
        self.apply_pulls(cycle, &changes, &observed)?;
        Ok(())
    }

    /// Phase 1: list the remote tree, fetch what changed, scan local files.
    async fn observe(&self, cycle: &mut Cycle) -> Result<Observation, SyncError> {
        let root_id = self.config.remote.root_page_id.as_str();
        let listing = self.remote.list_tree(root_id).await?;
        let local = self.tree.scan()?;
        debug!(remote = listing.len(), local = local.len(), "observed both sides");

        let mut remote = RemoteSnapshot::new(root_id);
        for summary in listing {
            remote.pages.insert(
                summary.page_id.clone(),
                RemoteEntry {
                    summary,
                    in_tree: true,
                    page: None,
                    text: None,
                },
            );
        }

        // Header files naming pages we do not track need the remote text
        // for adoption, wherever the page lives.
        let claimed: HashSet<&str> = local
            .iter()
            .filter_map(|p| p.header.page_id.as_deref())
            .filter(|id| cycle.state.get(id).is_none())
            .collect();

        let mut wanted: Vec<String> = remote
            .pages
            .values()
            .filter(|e| {
                let id = e.summary.page_id.as_str();
                match cycle.state.get(id) {
                    Some(record) => record.known_remote_version() != e.summary.version,
                    None => {
                        claimed.contains(id)
                            || !title_excluded(&self.config.sync.exclude_titles, &e.summary.title)
                    }
                }
            })
            .map(|e| e.summary.page_id.clone())
            .collect();
        wanted.extend(
            claimed
                .iter()
                .filter(|id| !remote.pages.contains_key(**id))
                .map(|id| id.to_string()),
        );

        let mut skipped = HashSet::new();
        for (id, result) in self.fetch_pages(wanted).await? {
            match result {
                Ok(page) => match self.converter.to_text(&page.body) {
                    Ok(text) => {
                        let entry = remote.pages.entry(id).or_insert_with(|| RemoteEntry {
                            summary: page.summary(),
                            in_tree: false,
                            page: None,
                            text: None,
                        });
                        entry.summary = page.summary();
                        entry.text = Some(text);
                        entry.page = Some(page);
                    }
                    Err(e) => {
                        warn!(page_id = %id, error = %e, "remote page could not be converted, skipping");
                        cycle.fail(id.clone(), e);
                        skipped.insert(id);
                    }
                },
                Err(e) if e.is_not_found() => {
                    debug!(page_id = %id, "page vanished after listing");
                    remote.pages.remove(&id);
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(page_id = %id, error = %e, "remote fetch failed, skipping page this cycle");
                    cycle.fail(id.clone(), e);
                    skipped.insert(id);
                }
            }
        }

        Ok(Observation {
            remote,
            local,
            skipped,
        })
    }

    /// Fetch pages on the worker pool.
    async fn fetch_pages(
        &self,
        ids: Vec<String>,
    ) -> Result<Vec<(String, Result<RemotePage, RemoteError>)>, SyncError> {
        let remote = Arc::clone(&self.remote);
        let mut fetched = run_bounded(self.config.sync.workers, ids, move |id: String| {
            let remote = Arc::clone(&remote);
            async move {
                let result = remote.fetch(&id).await;
                (id, result)
            }
        })
        .await?;
        fetched.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(fetched)
    }

    /// Phase 2b: settle every ambiguous absence by identity.
    async fn disambiguate(
        &self,
        cycle: &mut Cycle,
        observed: &mut Observation,
        classification: &mut Classification,
    ) -> Result<(), SyncError> {
        if classification.ambiguous.is_empty() {
            return Ok(());
        }

        let mut resolved = Vec::with_capacity(classification.ambiguous.len());
        {
            let disambiguator = Disambiguator::new(
                self.remote.as_ref(),
                &self.tree,
                &cycle.state,
                &observed.local,
                &self.config.remote.root_page_id,
            );
            for ambiguity in &classification.ambiguous {
                match disambiguator.resolve(ambiguity).await {
                    Ok(outcome) => resolved.push(outcome),
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        warn!(page_id = %ambiguity.page_id, error = %e, "could not disambiguate, skipping");
                        cycle.report.failures.push(ItemFailure {
                            page_id: ambiguity.page_id.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }

        for outcome in resolved {
            let changes = &mut classification.changes;
            match outcome {
                Disambiguated::Present { page_id, page } => {
                    let text = match self.converter.to_text(&page.body) {
                        Ok(text) => text,
                        Err(e) => {
                            cycle.fail(page_id, e);
                            continue;
                        }
                    };
                    let Some(record) = cycle.state.get(&page_id) else {
                        continue;
                    };
                    let Some(local) = observed.local.iter().find(|p| p.path == record.local_path)
                    else {
                        continue;
                    };
                    let (label, refresh) = label_content(record, &local.body, page.version, Some(&text));
                    debug!(page_id = %page_id, ?label, "classified page found in place");
                    record_label(changes, &page_id, label);
                    if let Some(version) = refresh {
                        classification.version_refresh.push((page_id.clone(), version));
                    }
                    observed.remote.pages.insert(
                        page_id,
                        RemoteEntry {
                            summary: page.summary(),
                            in_tree: true,
                            page: Some(*page),
                            text: Some(text),
                        },
                    );
                }
                Disambiguated::MovedRemote(mv) => changes.moved_remote.push(mv),
                Disambiguated::MovedLocal(mv) => changes.moved_local.push(mv),
                Disambiguated::DeletedRemote {
                    page_id,
                    local_path,
                } => {
                    // The file may have moved locally in the same cycle.
                    if let Some(mut record) = cycle
                        .state
                        .get(&page_id)
                        .filter(|r| r.local_path != local_path)
                        .cloned()
                    {
                        record.local_path = local_path;
                        cycle.state.upsert(record)?;
                    }
                    changes.deleted_remote.push(page_id);
                }
                Disambiguated::DeletedLocal(id) => changes.deleted_local.push(id),
            }
        }
        Ok(())
    }

    /// Remote version bumps without a content change only move the record.
    fn refresh_versions(
        &self,
        cycle: &mut Cycle,
        refresh: &[(String, u64)],
        remote: &RemoteSnapshot,
    ) -> Result<(), SyncError> {
        for (id, version) in refresh {
            let Some(mut record) = cycle.state.get(id).cloned() else {
                continue;
            };
            match record.pending_conflict.as_mut() {
                Some(pending) => pending.remote_version = pending.remote_version.max(*version),
                None => record.remote_version = record.remote_version.max(*version),
            }
            if let Some(entry) = remote.pages.get(id) {
                record.title = entry.summary.title.clone();
            }
            debug!(page_id = %id, version, "remote version refreshed");
            cycle.state.upsert(record)?;
        }
        Ok(())
    }

    /// A pending conflict whose file now equals the remote side was resolved
    /// by taking the remote text.
    fn settle_unchanged(&self, cycle: &mut Cycle, changes: &ChangeSet) -> Result<(), SyncError> {
        for id in &changes.unchanged {
            let Some(record) = cycle.state.get(id) else {
                continue;
            };
            let Some(pending) = record.pending_conflict.clone() else {
                continue;
            };
            let mut record = record.clone();
            info!(page_id = %id, "conflict resolved with the remote text");
            record.confirm(pending.remote_text, pending.remote_version);
            cycle.state.upsert(record)?;
        }
        Ok(())
    }

    /// Phase 3: deletions, then moves.
    async fn apply_structure(&self, cycle: &mut Cycle, changes: &ChangeSet) -> Result<(), SyncError> {
        if cycle.dry_run {
            for id in &changes.deleted_remote {
                let path = cycle
                    .state
                    .get(id)
                    .map(|r| r.local_path.display().to_string())
                    .unwrap_or_default();
                cycle
                    .report
                    .plan(ActionKind::DeleteLocal, id, format!("remove {}", path));
            }
            for id in &changes.deleted_local {
                cycle
                    .report
                    .plan(ActionKind::TrashRemote, id, "move remote page to trash");
            }
            for mv in &changes.moved_remote {
                let detail = match &mv.to_path {
                    Some(to) => format!("{} -> {}", mv.from_path.display(), to.display()),
                    None => "page left the synced tree, file stays".to_string(),
                };
                cycle.report.plan(ActionKind::MoveLocal, &mv.page_id, detail);
            }
            for mv in &changes.moved_local {
                let parent = mv.new_parent_id.as_deref().unwrap_or("-");
                cycle
                    .report
                    .plan(ActionKind::MoveRemote, &mv.page_id, format!("reparent under {}", parent));
            }
            return Ok(());
        }

        if changes.deleted_remote.is_empty()
            && changes.deleted_local.is_empty()
            && changes.moved_remote.is_empty()
            && changes.moved_local.is_empty()
        {
            return Ok(());
        }

        let deletions = DeletionExecutor::new(self.remote.as_ref(), &self.tree);
        let batch = deletions.remove_local(&mut cycle.state, &changes.deleted_remote);
        cycle.report.deletions.merge(batch);
        let batch = deletions
            .trash_remote(&mut cycle.state, &changes.deleted_local)
            .await;
        cycle.report.deletions.merge(batch);

        let moves = MoveExecutor::new(self.remote.as_ref(), &self.tree);
        let batch = moves.follow_remote(&mut cycle.state, &changes.moved_remote);
        cycle.report.moves.merge(batch);
        let batch = moves.follow_local(&mut cycle.state, &changes.moved_local).await;
        cycle.report.moves.merge(batch);

        info!(
            deleted = cycle.report.deletions.succeeded.len(),
            moved = cycle.report.moves.succeeded.len(),
            failed = cycle.report.deletions.failed.len() + cycle.report.moves.failed.len(),
            "structural changes applied"
        );
        self.checkpoint(cycle)
    }

    /// Phase 4: merge pages edited on both sides. Clean merges become push
    /// jobs; conflicts are written to the local file with markers.
    fn merge_conflicts(
        &self,
        cycle: &mut Cycle,
        changes: &ChangeSet,
        observed: &Observation,
    ) -> Result<Vec<PushJob>, SyncError> {
        let mut jobs = Vec::new();
        for entry in &changes.conflicts {
            let id = &entry.page_id;
            if entry.unresolved {
                info!(page_id = %id, "conflict markers still present, holding page back");
                if cycle.dry_run {
                    cycle
                        .report
                        .plan(ActionKind::Conflict, id, "unresolved conflict markers");
                }
                cycle.report.conflicts.push(id.clone());
                continue;
            }

            let Some(record) = cycle.state.get(id).cloned() else {
                continue;
            };
            let Some(local) = observed.local.iter().find(|p| p.path == record.local_path) else {
                cycle.fail(id.clone(), "local file missing at merge time");
                continue;
            };
            let remote_entry = observed.remote.pages.get(id);
            let (Some(remote_page), Some(remote_text)) = (
                remote_entry.and_then(|e| e.page.as_ref()),
                remote_entry.and_then(|e| e.text.as_deref()),
            ) else {
                cycle.fail(id.clone(), "remote content unavailable for merge");
                continue;
            };

            let merge = Merger::three_way_merge(record.merge_base(), &local.body, remote_text);
            if merge.is_clean() {
                debug!(page_id = %id, "clean three-way merge");
                if cycle.dry_run {
                    cycle.report.plan_with_preview(
                        ActionKind::Merge,
                        id,
                        "merge both sides and push",
                        preview(&local.body, &merge.merged_text),
                    );
                    continue;
                }
                cycle.report.merged += 1;
                jobs.push(PushJob {
                    page_id: id.clone(),
                    title: record.title.clone(),
                    desired: merge.merged_text,
                    expected: Some(remote_text.to_string()),
                    local_path: record.local_path.clone(),
                    local_body: local.body.clone(),
                    local_version: local.header.version,
                });
            } else {
                cycle.report.conflicts.push(id.clone());
                if cycle.dry_run {
                    cycle.report.plan(
                        ActionKind::Conflict,
                        id,
                        format!("{} conflicting region(s)", merge.conflicts.len()),
                    );
                    continue;
                }
                self.record_conflict(cycle, record, &merge.merged_text, remote_page.version, remote_text)?;
            }
        }
        Ok(jobs)
    }

    /// Write a conflicted merge to the local file and remember the remote side.
    fn record_conflict(
        &self,
        cycle: &mut Cycle,
        mut record: PageRecord,
        marked_text: &str,
        remote_version: u64,
        remote_text: &str,
    ) -> Result<(), SyncError> {
        let header = PageHeader::tracked(&record.page_id, remote_version, &record.title);
        if let Err(e) = self.tree.write(&record.local_path, &header, marked_text) {
            warn!(page_id = %record.page_id, error = %e, "failed to write conflict file");
            cycle.fail(record.page_id.clone(), e);
            return Ok(());
        }
        warn!(
            page_id = %record.page_id,
            path = %record.local_path.display(),
            remote_version,
            "merge conflict written to local file"
        );
        record.pending_conflict = Some(PendingConflict {
            remote_version,
            remote_text: remote_text.to_string(),
            detected_at: Utc::now(),
        });
        cycle.state.upsert(record)?;
        Ok(())
    }

    /// Push job for a tracked page edited only locally.
    fn push_job(&self, cycle: &mut Cycle, page_id: &str, local: &[LocalPage]) -> Option<PushJob> {
        let record = cycle.state.get(page_id)?.clone();
        let Some(page) = local.iter().find(|p| p.path == record.local_path) else {
            cycle.fail(page_id, "local file missing at push time");
            return None;
        };
        if cycle.dry_run {
            cycle.report.plan_with_preview(
                ActionKind::Push,
                page_id,
                record.local_path.display().to_string(),
                preview(record.merge_base(), &page.body),
            );
            return None;
        }
        Some(PushJob {
            page_id: record.page_id.clone(),
            title: record.title.clone(),
            desired: page.body.clone(),
            expected: Some(record.merge_base().to_string()),
            local_path: record.local_path.clone(),
            local_body: page.body.clone(),
            local_version: page.header.version,
        })
    }

    /// Phase 5a: submit patches on the worker pool, one page at a time per id.
    async fn run_pushes(&self, cycle: &mut Cycle, jobs: Vec<PushJob>) -> Result<(), SyncError> {
        if jobs.is_empty() {
            return Ok(());
        }
        let patcher = DocumentPatcher::new(
            Arc::clone(&self.remote),
            Arc::clone(&self.converter),
            self.config.sync.replace_threshold,
            Arc::clone(&self.locks),
        );
        let results = run_bounded(self.config.sync.workers, jobs, move |job: PushJob| {
            let patcher = patcher.clone();
            async move {
                let outcome = match job.expected.as_deref() {
                    Some(expected) => {
                        patcher
                            .push(&job.page_id, &job.title, &job.desired, expected)
                            .await
                    }
                    None => patcher.overwrite(&job.page_id, &job.title, &job.desired).await,
                };
                (job, outcome)
            }
        })
        .await?;

        let mut fatal = None;
        let mut recreate = Vec::new();
        for (job, outcome) in results {
            match outcome {
                Ok(PushOutcome::Applied { result, text }) => self.settle_push(cycle, &job, &result, &text)?,
                Ok(PushOutcome::Conflict {
                    merge,
                    remote_version,
                    remote_text,
                }) => {
                    cycle.report.conflicts.push(job.page_id.clone());
                    if let Some(record) = cycle.state.get(&job.page_id).cloned() {
                        self.record_conflict(cycle, record, &merge.merged_text, remote_version, &remote_text)?;
                    }
                }
                Err(PatchError::Remote(e)) if e.is_not_found() && job.expected.is_none() => {
                    recreate.push(job);
                }
                Err(PatchError::Remote(e)) if e.is_version_conflict() => {
                    // Still racing after the re-fetch: the local edit is kept
                    // and retried next cycle.
                    warn!(page_id = %job.page_id, error = %e, "remote kept moving, page left unresolved");
                    cycle.report.conflicts.push(job.page_id.clone());
                }
                Err(e) => {
                    let failed = PatchResult::failed(&e);
                    warn!(page_id = %job.page_id, error = ?failed.error, "push failed");
                    cycle.fail(job.page_id.clone(), failed.error.unwrap_or_default());
                    if let PatchError::Remote(remote) = e {
                        if remote.is_fatal() && fatal.is_none() {
                            fatal = Some(remote);
                        }
                    }
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e.into());
        }
        for job in recreate {
            self.recreate_remote(cycle, job).await?;
        }
        self.checkpoint(cycle)
    }

    /// Record a successful submission and bring the local file to the
    /// canonical text the remote now holds.
    fn settle_push(
        &self,
        cycle: &mut Cycle,
        job: &PushJob,
        result: &PatchResult,
        text: &str,
    ) -> Result<(), SyncError> {
        let Some(mut record) = cycle.state.get(&job.page_id).cloned() else {
            return Ok(());
        };
        let version = result.new_version.unwrap_or(record.remote_version);
        if job.local_body != text || job.local_version != Some(version) {
            let header = PageHeader::tracked(&record.page_id, version, &record.title);
            if let Err(e) = self.tree.write(&job.local_path, &header, text) {
                warn!(page_id = %job.page_id, error = %e, "pushed, but the local file could not be refreshed");
                cycle.fail(job.page_id.clone(), e);
                return Ok(());
            }
        }
        record.local_path = job.local_path.clone();
        record.confirm(text, version);
        cycle.state.upsert(record)?;
        if result.operations_applied > 0 {
            cycle.report.pushed += 1;
        }
        Ok(())
    }

    /// Force-push target whose remote page is gone: create it afresh.
    async fn recreate_remote(&self, cycle: &mut Cycle, job: PushJob) -> Result<(), SyncError> {
        let Some(old) = cycle.state.get(&job.page_id).cloned() else {
            return Ok(());
        };
        let parent_id = old
            .parent_id
            .clone()
            .unwrap_or_else(|| self.config.remote.root_page_id.clone());
        info!(page_id = %job.page_id, parent = %parent_id, "remote page is gone, recreating");
        let body = self.converter.from_text(&job.desired);
        match self.remote.create(&parent_id, &job.title, &body).await {
            Ok(created) => {
                cycle.state.remove(&job.page_id);
                self.adopt_created(cycle, &created, &job.local_path, &job.desired, parent_id)
            }
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                cycle.fail(job.page_id.clone(), e);
                Ok(())
            }
        }
    }

    /// Phase 5b: create remote pages for new local files, parents first.
    async fn create_remote_pages(
        &self,
        cycle: &mut Cycle,
        mut paths: Vec<PathBuf>,
        local: &[LocalPage],
    ) -> Result<(), SyncError> {
        paths.sort_by(|a, b| {
            (a.components().count(), a.as_path()).cmp(&(b.components().count(), b.as_path()))
        });
        for path in paths {
            let Some(page) = local.iter().find(|p| p.path == path) else {
                continue;
            };
            let parent_id = self.parent_for(&cycle.state, &path);
            let title = page.title();
            if cycle.dry_run {
                let canonical = Document::from_text(&page.body).to_text();
                cycle.report.plan_with_preview(
                    ActionKind::CreateRemote,
                    path.display().to_string(),
                    format!("\"{}\" under page {}", title, parent_id),
                    preview("", &canonical),
                );
                continue;
            }

            let body = self.converter.from_text(&page.body);
            match self.remote.create(&parent_id, &title, &body).await {
                Ok(created) => {
                    self.adopt_created(cycle, &created, &path, &page.body, parent_id)?;
                    cycle.report.created_remote += 1;
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to create remote page");
                    cycle.fail(path.display().to_string(), e);
                }
            }
        }
        Ok(())
    }

    /// Track a page the engine just created remotely.
    fn adopt_created(
        &self,
        cycle: &mut Cycle,
        created: &RemotePage,
        path: &Path,
        local_text: &str,
        parent_id: String,
    ) -> Result<(), SyncError> {
        let text = self
            .converter
            .to_text(&created.body)
            .unwrap_or_else(|_| Document::from_text(local_text).to_text());
        let header = PageHeader::tracked(&created.page_id, created.version, &created.title);
        if let Err(e) = self.tree.write(path, &header, &text) {
            warn!(page_id = %created.page_id, error = %e, "created remotely, but the local header could not be written");
            cycle.fail(created.page_id.clone(), e);
        }
        info!(page_id = %created.page_id, path = %path.display(), "remote page created");
        cycle.state.upsert(PageRecord::new(
            created.page_id.clone(),
            created.title.clone(),
            path,
            created.version,
            text,
            Some(parent_id),
        ))?;
        Ok(())
    }

    /// Parent page for a new local file: the page stored at `<dir>.<ext>`,
    /// else the sync root.
    fn parent_for(&self, state: &PageStateStore, path: &Path) -> String {
        self.tree
            .parent_page_path(path)
            .and_then(|p| state.find_by_path(&p).map(|r| r.page_id.clone()))
            .unwrap_or_else(|| self.config.remote.root_page_id.clone())
    }

    /// Phase 5c: write remote changes locally and mirror new remote pages.
    fn apply_pulls(
        &self,
        cycle: &mut Cycle,
        changes: &ChangeSet,
        observed: &Observation,
    ) -> Result<(), SyncError> {
        let mut creates: Vec<(&RemotePage, &str)> = Vec::new();
        for target in &changes.to_pull {
            let (PullTarget::Existing(id) | PullTarget::Create(id)) = target;
            let entry = observed.remote.pages.get(id);
            let (Some(page), Some(text)) = (
                entry.and_then(|e| e.page.as_ref()),
                entry.and_then(|e| e.text.as_deref()),
            ) else {
                cycle.fail(id.clone(), "remote content was not fetched");
                continue;
            };
            match target {
                PullTarget::Create(_) => creates.push((page, text)),
                PullTarget::Existing(_) => {
                    let Some(record) = cycle.state.get(id).cloned() else {
                        continue;
                    };
                    if cycle.dry_run {
                        let current = observed
                            .local
                            .iter()
                            .find(|p| p.path == record.local_path)
                            .map(|p| p.body.as_str())
                            .unwrap_or_default();
                        cycle.report.plan_with_preview(
                            ActionKind::Pull,
                            id,
                            record.local_path.display().to_string(),
                            preview(current, text),
                        );
                        continue;
                    }
                    self.write_pulled(cycle, record, page, text)?;
                }
            }
        }

        creates.sort_by(|a, b| {
            (a.0.ancestors.len(), &a.0.page_id).cmp(&(b.0.ancestors.len(), &b.0.page_id))
        });
        for (page, text) in creates {
            self.create_local(cycle, page, text)?;
        }
        Ok(())
    }

    fn write_pulled(
        &self,
        cycle: &mut Cycle,
        mut record: PageRecord,
        page: &RemotePage,
        text: &str,
    ) -> Result<(), SyncError> {
        let header = PageHeader::tracked(&page.page_id, page.version, &page.title);
        if let Err(e) = self.tree.write(&record.local_path, &header, text) {
            warn!(page_id = %page.page_id, error = %e, "failed to write pulled page");
            cycle.fail(page.page_id.clone(), e);
            return Ok(());
        }
        debug!(page_id = %page.page_id, version = page.version, "pulled remote change");
        record.title = page.title.clone();
        record.confirm(text, page.version);
        cycle.state.upsert(record)?;
        cycle.report.pulled += 1;
        Ok(())
    }

    /// Mirror a remote page that has no local file yet.
    fn create_local(&self, cycle: &mut Cycle, page: &RemotePage, text: &str) -> Result<(), SyncError> {
        let root_id = self.config.remote.root_page_id.as_str();
        let mut path = local_path_for(&self.tree, &cycle.state, root_id, page);
        if self.tree.exists(&path) || cycle.state.find_by_path(&path).is_some() {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            path.set_file_name(format!("{}-{}.{}", stem, page.page_id, self.tree.extension()));
        }
        if cycle.dry_run {
            cycle.report.plan_with_preview(
                ActionKind::CreateLocal,
                &page.page_id,
                path.display().to_string(),
                preview("", text),
            );
            return Ok(());
        }

        let header = PageHeader::tracked(&page.page_id, page.version, &page.title);
        if let Err(e) = self.tree.write(&path, &header, text) {
            warn!(page_id = %page.page_id, error = %e, "failed to create local file");
            cycle.fail(page.page_id.clone(), e);
            return Ok(());
        }
        info!(page_id = %page.page_id, path = %path.display(), "local mirror created");
        cycle.state.upsert(PageRecord::new(
            page.page_id.clone(),
            page.title.clone(),
            path,
            page.version,
            text,
            page.parent_id.clone(),
        ))?;
        cycle.report.created_local += 1;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Force modes
    // -----------------------------------------------------------------------

    /// Overwrite the remote with every local file. Remote pages that no
    /// longer exist are recreated; nothing is trashed.
    async fn force_push(&self, cycle: &mut Cycle) -> Result<(), SyncError> {
        let local = self.tree.scan()?;
        let mut jobs = Vec::new();
        let mut creates = Vec::new();
        for page in &local {
            let record = page
                .header
                .page_id
                .as_deref()
                .and_then(|id| cycle.state.get(id))
                .cloned();
            let Some(record) = record else {
                creates.push(page.path.clone());
                continue;
            };
            if cycle.dry_run {
                cycle.report.plan(
                    ActionKind::Push,
                    &record.page_id,
                    format!("overwrite remote with {}", page.path.display()),
                );
                continue;
            }
            jobs.push(PushJob {
                page_id: record.page_id.clone(),
                title: record.title.clone(),
                desired: page.body.clone(),
                expected: None,
                local_path: page.path.clone(),
                local_body: page.body.clone(),
                local_version: page.header.version,
            });
        }
        info!(overwrite = jobs.len(), create = creates.len(), "force push");
        self.run_pushes(cycle, jobs).await?;
        self.create_remote_pages(cycle, creates, &local).await
    }

    /// Overwrite local files with every remote page under the root. Local
    /// files are never deleted.
    async fn force_pull(&self, cycle: &mut Cycle) -> Result<(), SyncError> {
        let root_id = self.config.remote.root_page_id.as_str();
        let listing = self.remote.list_tree(root_id).await?;
        let local = self.tree.scan()?;
        let ids: Vec<String> = listing
            .iter()
            .filter(|s| {
                cycle.state.get(&s.page_id).is_some()
                    || !title_excluded(&self.config.sync.exclude_titles, &s.title)
            })
            .map(|s| s.page_id.clone())
            .collect();
        info!(pages = ids.len(), "force pull");

        let mut creates = Vec::new();
        for (id, result) in self.fetch_pages(ids).await? {
            let page = match result {
                Ok(page) => page,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(page_id = %id, error = %e, "remote fetch failed");
                    cycle.fail(id, e);
                    continue;
                }
            };
            let text = match self.converter.to_text(&page.body) {
                Ok(text) => text,
                Err(e) => {
                    cycle.fail(id, e);
                    continue;
                }
            };
            let Some(record) = cycle.state.get(&id).cloned() else {
                creates.push((page, text));
                continue;
            };
            let current = local.iter().find(|p| p.path == record.local_path);
            if current.is_some_and(|p| p.body == text && p.header.version == Some(page.version)) {
                cycle.report.unchanged += 1;
                let mut record = record;
                record.confirm(text, page.version);
                cycle.state.upsert(record)?;
                continue;
            }
            if cycle.dry_run {
                let before = current.map(|p| p.body.as_str()).unwrap_or_default();
                cycle.report.plan_with_preview(
                    ActionKind::Pull,
                    &id,
                    record.local_path.display().to_string(),
                    preview(before, &text),
                );
                continue;
            }
            self.write_pulled(cycle, record, &page, &text)?;
        }

        creates.sort_by(|a, b| {
            (a.0.ancestors.len(), &a.0.page_id).cmp(&(b.0.ancestors.len(), &b.0.page_id))
        });
        for (page, text) in &creates {
            self.create_local(cycle, page, text)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Persist the records as they stand. `last_synced` only moves at the
    /// end of a completed cycle.
    fn checkpoint(&self, cycle: &Cycle) -> Result<(), SyncError> {
        if cycle.dry_run {
            return Ok(());
        }
        let at = cycle
            .state
            .last_synced()
            .or(cycle.report.started_at)
            .unwrap_or_else(Utc::now);
        cycle.state.save(self.state_backend.as_ref(), at)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Offline queries
// ---------------------------------------------------------------------------

/// Compare `tree` with the records in `backend`. Needs no credentials.
pub fn local_status(tree: &LocalTree, backend: &dyn StateBackend) -> Result<LocalStatus, SyncError> {
    let state = PageStateStore::load(backend)?;
    let local = tree.scan()?;
    let mut status = LocalStatus {
        tracked: state.len(),
        last_synced: state.last_synced(),
        ..Default::default()
    };

    for record in state.records() {
        match local.iter().find(|p| p.path == record.local_path) {
            None => status.missing.push(record.local_path.clone()),
            Some(page) if record.pending_conflict.is_some() && has_conflict_markers(&page.body) => {
                status.conflicts.push(page.path.clone())
            }
            Some(page) if !same_content(&page.body, record.merge_base()) => {
                status.modified.push(page.path.clone())
            }
            Some(_) => {}
        }
    }
    status.new_files = local
        .iter()
        .filter(|p| state.find_by_path(&p.path).is_none())
        .map(|p| p.path.clone())
        .collect();
    Ok(status)
}

/// Records with a pending conflict, in page id order.
pub fn pending_conflicts(backend: &dyn StateBackend) -> Result<Vec<PageRecord>, SyncError> {
    let state = PageStateStore::load(backend)?;
    Ok(state
        .records()
        .filter(|r| r.pending_conflict.is_some())
        .cloned()
        .collect())
}

/// Run `job` over `items` with at most `workers` in flight.
async fn run_bounded<I, T, F, Fut>(workers: usize, items: Vec<I>, job: F) -> Result<Vec<T>, SyncError>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();
    for item in items {
        let semaphore = Arc::clone(&semaphore);
        let work = job(item);
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| SyncError::Internal("worker pool closed unexpectedly".into()))?;
            Ok::<T, SyncError>(work.await)
        });
    }

    let mut out = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| SyncError::Internal(format!("worker task failed: {}", e)))?;
        out.push(result?);
    }
    Ok(out)
}

/// Unified diff for dry-run previews.
fn preview(from: &str, to: &str) -> String {
    diffy::create_patch(from, to).to_string()
}

/// RAII guard that clears the running flag on drop.
struct SyncLockGuard(Arc<AtomicBool>);

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
