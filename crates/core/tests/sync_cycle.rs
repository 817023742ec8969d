//! End-to-end tests for bidirectional wiki <-> file synchronization.
//!
//! These tests exercise the real `SyncEngine` with:
//! - An in-memory wiki space (`InMemoryRemote`) standing in for the REST API
//! - A real local mirror tree in a temporary directory
//! - In-memory page state, so saves can be counted
//!
//! No network I/O.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use wikisync_core::config::{LocalConfig, RemoteConfig, SyncConfig};
use wikisync_core::convert::{ContentConverter, StorageFormatConverter};
use wikisync_core::errors::RemoteError;
use wikisync_core::local::PageHeader;
use wikisync_core::models::{ActionKind, ExitStatus, SyncMode, SyncOptions, SyncReport};
use wikisync_core::remote::InMemoryRemote;
use wikisync_core::state::{MemoryBackend, PageStateStore};
use wikisync_core::sync_engine::SyncEngine;

// ===========================================================================
// Helpers
// ===========================================================================

const GUIDE: &str = "<h1>Guide</h1><p>alpha</p><p>beta</p>";

struct Harness {
    dir: TempDir,
    remote: Arc<InMemoryRemote>,
    backend: Arc<MemoryBackend>,
    engine: SyncEngine,
}

fn config(root: &Path) -> SyncConfig {
    SyncConfig {
        remote: RemoteConfig {
            base_url: "https://wiki.example.com".into(),
            space_key: "DOC".into(),
            root_page_id: "1".into(),
            username: "sync-bot".into(),
            token_env: "WIKISYNC_TOKEN".into(),
            timeout_secs: 30,
            token: None,
        },
        local: LocalConfig {
            root: root.to_path_buf(),
            extension: "md".into(),
            ignore_patterns: Vec::new(),
        },
        sync: Default::default(),
        retry: Default::default(),
        logging: Default::default(),
    }
}

/// Root page "1" with Guide (10), its child Setup (11), and Misc (12).
fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(InMemoryRemote::new("1", "Root"));
    remote.seed("10", "1", "Guide", GUIDE);
    remote.seed("11", "10", "Setup", "<p>install</p>");
    remote.seed("12", "1", "Misc", "<p>misc</p>");
    let backend = Arc::new(MemoryBackend::new());
    let engine = SyncEngine::new(
        config(dir.path()),
        remote.clone(),
        Arc::new(StorageFormatConverter::new()),
        backend.clone(),
    );
    Harness {
        dir,
        remote,
        backend,
        engine,
    }
}

/// A harness after one clean initial sync.
async fn synced() -> Harness {
    let h = harness();
    let report = h.run().await;
    assert_eq!(report.created_local, 3);
    h
}

impl Harness {
    async fn run(&self) -> SyncReport {
        self.run_with(SyncOptions::default()).await
    }

    async fn run_with(&self, options: SyncOptions) -> SyncReport {
        self.engine.run(options).await.unwrap()
    }

    fn path(&self, rel: &str) -> std::path::PathBuf {
        self.dir.path().join(rel)
    }

    fn body(&self, rel: &str) -> String {
        self.engine
            .tree()
            .read(Path::new(rel))
            .unwrap()
            .unwrap_or_else(|| panic!("{} is missing", rel))
            .body
    }

    fn header(&self, rel: &str) -> PageHeader {
        self.engine.tree().read(Path::new(rel)).unwrap().unwrap().header
    }

    /// Rewrite a page file's body, keeping its header.
    fn edit_local(&self, rel: &str, from: &str, to: &str) {
        let path = self.path(rel);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains(from), "{} does not contain {:?}", rel, from);
        std::fs::write(&path, text.replace(from, to)).unwrap();
    }

    fn remote_text(&self, page_id: &str) -> String {
        StorageFormatConverter::new()
            .to_text(&self.remote.page(page_id).unwrap().body)
            .unwrap()
    }

    fn state(&self) -> PageStateStore {
        PageStateStore::load(self.backend.as_ref()).unwrap()
    }
}

// ===========================================================================
// Initial sync and idempotence
// ===========================================================================

#[tokio::test]
async fn test_initial_sync_mirrors_remote_tree() {
    let h = synced().await;

    assert_eq!(h.body("guide.md"), "# Guide\n\nalpha\n\nbeta\n");
    assert_eq!(h.body("guide/setup.md"), "install\n");
    assert_eq!(h.body("misc.md"), "misc\n");
    assert_eq!(h.header("guide.md"), PageHeader::tracked("10", 1, "Guide"));
    assert_eq!(h.remote.mutations(), 0);

    let state = h.state();
    assert_eq!(state.len(), 3);
    assert!(state.last_synced().is_some());
    assert_eq!(state.get("11").unwrap().parent_id.as_deref(), Some("10"));
}

#[tokio::test]
async fn test_second_cycle_without_changes_is_a_noop() {
    let h = synced().await;
    let mutations = h.remote.mutations();
    let before = std::fs::read(h.path("guide.md")).unwrap();

    let report = h.run().await;
    assert_eq!(report.mutations(), 0);
    assert_eq!(report.unchanged, 3);
    assert!(report.conflicts.is_empty());
    assert_eq!(report.exit_status(), ExitStatus::Clean);
    assert_eq!(h.remote.mutations(), mutations);
    assert_eq!(std::fs::read(h.path("guide.md")).unwrap(), before);
}

// ===========================================================================
// Content changes
// ===========================================================================

#[tokio::test]
async fn test_local_edit_is_pushed_and_settles() {
    let h = synced().await;
    h.edit_local("guide.md", "alpha", "ALPHA");

    let report = h.run().await;
    assert_eq!(report.pushed, 1);
    assert_eq!(h.remote_text("10"), "# Guide\n\nALPHA\n\nbeta\n");
    assert_eq!(h.remote.page("10").unwrap().version, 2);
    assert_eq!(h.header("guide.md").version, Some(2));

    let again = h.run().await;
    assert_eq!(again.mutations(), 0);
}

#[tokio::test]
async fn test_push_preserves_macros_it_cannot_edit() {
    let h = harness();
    h.remote.seed(
        "13",
        "1",
        "Dashboard",
        "<p>intro</p><ac:structured-macro ac:name=\"jira\"><ac:parameter ac:name=\"key\">OPS-1</ac:parameter></ac:structured-macro>",
    );
    h.run().await;
    h.edit_local("dashboard.md", "intro", "introduction");

    h.run().await;
    let body = h.remote.page("13").unwrap().body;
    assert!(body.starts_with("<p>introduction</p>"));
    assert!(body.contains(
        "<ac:structured-macro ac:name=\"jira\"><ac:parameter ac:name=\"key\">OPS-1</ac:parameter></ac:structured-macro>"
    ));
}

#[tokio::test]
async fn test_remote_edit_is_pulled() {
    let h = synced().await;
    h.remote.edit("12", "<p>misc, revised</p>");

    let report = h.run().await;
    assert_eq!(report.pulled, 1);
    assert_eq!(h.body("misc.md"), "misc, revised\n");
    assert_eq!(h.header("misc.md").version, Some(2));
    assert_eq!(h.state().get("12").unwrap().remote_version, 2);
}

#[tokio::test]
async fn test_new_pages_are_created_on_both_sides() {
    let h = synced().await;
    std::fs::write(h.path("notes.md"), "Some notes\n").unwrap();
    std::fs::write(h.path("guide/faq.md"), "Questions\n").unwrap();
    h.remote.seed("13", "10", "Tips", "<p>tip one</p>");

    let report = h.run().await;
    assert_eq!(report.created_remote, 2);
    assert_eq!(report.created_local, 1);
    assert_eq!(h.body("guide/tips.md"), "tip one\n");

    let notes = h.remote.find_by_title("notes").unwrap();
    assert_eq!(h.remote.page(&notes).unwrap().parent_id.as_deref(), Some("1"));
    let faq = h.remote.find_by_title("faq").unwrap();
    assert_eq!(h.remote.page(&faq).unwrap().parent_id.as_deref(), Some("10"));
    assert_eq!(h.header("notes.md").page_id.as_deref(), Some(notes.as_str()));

    let again = h.run().await;
    assert_eq!(again.mutations(), 0);
}

#[tokio::test]
async fn test_excluded_titles_are_never_pulled() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(InMemoryRemote::new("1", "Root"));
    remote.seed("10", "1", "Guide", GUIDE);
    remote.seed("14", "1", "Archive 2023", "<p>old</p>");
    let mut config = config(dir.path());
    config.sync.exclude_titles = vec!["Archive*".into()];
    let engine = SyncEngine::new(
        config,
        remote,
        Arc::new(StorageFormatConverter::new()),
        Arc::new(MemoryBackend::new()),
    );

    let report = engine.run(SyncOptions::default()).await.unwrap();
    assert_eq!(report.created_local, 1);
    assert!(!dir.path().join("archive-2023.md").exists());
}

// ===========================================================================
// Merges and conflicts
// ===========================================================================

#[tokio::test]
async fn test_disjoint_edits_on_both_sides_merge_cleanly() {
    let h = synced().await;
    h.edit_local("guide.md", "alpha", "ALPHA");
    h.remote.edit("10", "<h1>Guide</h1><p>alpha</p><p>BETA</p>");

    let report = h.run().await;
    assert_eq!(report.merged, 1);
    assert!(report.conflicts.is_empty());
    assert_eq!(h.remote_text("10"), "# Guide\n\nALPHA\n\nBETA\n");
    assert_eq!(h.body("guide.md"), "# Guide\n\nALPHA\n\nBETA\n");
    assert_eq!(h.header("guide.md").version, Some(3));

    let again = h.run().await;
    assert_eq!(again.mutations(), 0);
}

#[tokio::test]
async fn test_overlapping_edits_leave_markers_until_resolved() {
    let h = synced().await;
    h.edit_local("guide.md", "alpha", "local alpha");
    h.remote.edit("10", "<h1>Guide</h1><p>remote alpha</p><p>beta</p>");

    let report = h.run().await;
    assert_eq!(report.conflicts, vec!["10".to_string()]);
    assert_eq!(report.exit_status(), ExitStatus::Conflicts);
    let body = h.body("guide.md");
    assert!(body.contains("<<<<<<< local\nlocal alpha\n"));
    assert!(body.contains("remote alpha\n>>>>>>> remote\n"));
    assert_eq!(h.remote_text("10"), "# Guide\n\nremote alpha\n\nbeta\n");

    let pending = h.engine.pending_conflicts().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].pending_conflict.as_ref().unwrap().remote_version, 2);

    // Markers still present: the page is held back.
    let held = h.run().await;
    assert_eq!(held.conflicts, vec!["10".to_string()]);
    assert_eq!(h.remote.page("10").unwrap().version, 2);

    // The human resolves the conflict; the resolution is pushed.
    let header = h.header("guide.md");
    let resolved = "# Guide\n\nmerged alpha\n\nbeta\n";
    h.engine
        .tree()
        .write(Path::new("guide.md"), &header, resolved)
        .unwrap();
    let report = h.run().await;
    assert_eq!(report.pushed, 1);
    assert!(report.conflicts.is_empty());
    assert_eq!(h.remote_text("10"), resolved);
    assert!(h.engine.pending_conflicts().unwrap().is_empty());
}

#[tokio::test]
async fn test_conflict_resolved_by_taking_remote_text() {
    let h = synced().await;
    h.edit_local("guide.md", "alpha", "local alpha");
    h.remote.edit("10", "<h1>Guide</h1><p>remote alpha</p><p>beta</p>");
    h.run().await;

    let header = h.header("guide.md");
    h.engine
        .tree()
        .write(Path::new("guide.md"), &header, "# Guide\n\nremote alpha\n\nbeta\n")
        .unwrap();
    let report = h.run().await;
    assert!(report.conflicts.is_empty());
    assert_eq!(report.mutations(), 0);
    let record = h.state().get("10").cloned().unwrap();
    assert!(record.pending_conflict.is_none());
    assert_eq!(record.remote_version, 2);
}

// ===========================================================================
// Structure: moves and deletions
// ===========================================================================

#[tokio::test]
async fn test_remote_move_relocates_file_and_children_byte_identically() {
    let h = synced().await;
    let guide = std::fs::read(h.path("guide.md")).unwrap();
    let setup = std::fs::read(h.path("guide/setup.md")).unwrap();
    h.remote.reparent("10", "12");
    let mutations = h.remote.mutations();

    let report = h.run().await;
    assert_eq!(report.moves.succeeded, vec!["10".to_string()]);
    assert!(!h.path("guide.md").exists());
    assert_eq!(std::fs::read(h.path("misc/guide.md")).unwrap(), guide);
    assert_eq!(std::fs::read(h.path("misc/guide/setup.md")).unwrap(), setup);
    assert_eq!(h.remote.mutations(), mutations);

    let state = h.state();
    assert_eq!(state.get("10").unwrap().parent_id.as_deref(), Some("12"));
    assert_eq!(
        state.get("11").unwrap().local_path,
        std::path::PathBuf::from("misc/guide/setup.md")
    );

    let again = h.run().await;
    assert_eq!(again.mutations(), 0);
}

#[tokio::test]
async fn test_local_move_reparents_remote_page() {
    let h = synced().await;
    std::fs::create_dir_all(h.path("guide")).unwrap();
    std::fs::rename(h.path("misc.md"), h.path("guide/misc.md")).unwrap();

    let report = h.run().await;
    assert_eq!(report.moves.succeeded, vec!["12".to_string()]);
    let page = h.remote.page("12").unwrap();
    assert_eq!(page.parent_id.as_deref(), Some("10"));
    assert_eq!(page.version, 1);
    assert!(!h.remote.is_trashed("12"));

    let again = h.run().await;
    assert_eq!(again.mutations(), 0);
}

#[tokio::test]
async fn test_remote_deletion_removes_local_mirror() {
    let h = synced().await;
    h.remote.purge("12");

    let report = h.run().await;
    assert_eq!(report.deletions.succeeded, vec!["12".to_string()]);
    assert!(!h.path("misc.md").exists());
    assert!(h.state().get("12").is_none());
}

#[tokio::test]
async fn test_local_deletion_trashes_remote_page() {
    let h = synced().await;
    std::fs::remove_file(h.path("misc.md")).unwrap();

    let report = h.run().await;
    assert_eq!(report.deletions.succeeded, vec!["12".to_string()]);
    assert!(h.remote.is_trashed("12"));
    assert!(h.state().get("12").is_none());

    let again = h.run().await;
    assert_eq!(again.mutations(), 0);
    assert!(!h.path("misc.md").exists());
}

#[tokio::test]
async fn test_remote_deletion_wins_over_local_move() {
    let h = synced().await;
    h.remote.purge("12");
    std::fs::rename(h.path("misc.md"), h.path("guide/misc.md")).unwrap();

    let report = h.run().await;
    assert_eq!(report.deletions.succeeded, vec!["12".to_string()]);
    assert!(report.moves.succeeded.is_empty());
    assert!(!h.path("misc.md").exists());
    assert!(!h.path("guide/misc.md").exists());
    assert!(h.state().get("12").is_none());

    // Nothing is left to resurrect the page.
    let again = h.run().await;
    assert_eq!(again.created_remote, 0);
    assert_eq!(again.mutations(), 0);
    assert!(h.remote.find_by_title("Misc").is_none());
}

#[tokio::test]
async fn test_remote_move_with_edit_relocates_then_pulls() {
    let h = synced().await;
    h.remote.reparent("12", "10");
    h.remote.edit("12", "<p>misc edited</p>");

    let first = h.run().await;
    assert_eq!(first.moves.succeeded, vec!["12".to_string()]);
    assert!(!h.path("misc.md").exists());

    // The content change lands in this cycle or the next, never lost.
    let second = h.run().await;
    assert_eq!(first.pulled + second.pulled, 1);
    assert_eq!(h.body("guide/misc.md"), "misc edited\n");
    assert_eq!(h.state().get("12").unwrap().baseline_text, "misc edited\n");

    let third = h.run().await;
    assert_eq!(third.pulled, 0);
    assert_eq!(third.mutations(), 0);
}

#[tokio::test]
async fn test_local_move_with_edit_reparents_then_pushes() {
    let h = synced().await;
    std::fs::rename(h.path("misc.md"), h.path("guide/misc.md")).unwrap();
    h.edit_local("guide/misc.md", "misc\n", "misc edited\n");

    let first = h.run().await;
    assert_eq!(first.moves.succeeded, vec!["12".to_string()]);
    assert_eq!(h.remote.page("12").unwrap().parent_id.as_deref(), Some("10"));

    let second = h.run().await;
    assert_eq!(first.pushed + second.pushed, 1);
    assert_eq!(h.remote_text("12"), "misc edited\n");
    assert!(!h.remote.is_trashed("12"));

    let third = h.run().await;
    assert_eq!(third.mutations(), 0);
}

#[tokio::test]
async fn test_transient_error_is_never_read_as_deletion() {
    let h = synced().await;
    h.remote.purge("12");
    h.remote.inject_failure("fetch", Some("12"), 1, || RemoteError::Api {
        status: 500,
        body: "internal error".into(),
    });

    let report = h.run().await;
    assert!(report.deletions.succeeded.is_empty());
    assert_eq!(report.exit_status(), ExitStatus::Failed);
    assert!(h.path("misc.md").exists());
    assert!(h.state().get("12").is_some());

    // Once the remote answers, the deletion is recognised.
    let report = h.run().await;
    assert_eq!(report.deletions.succeeded, vec!["12".to_string()]);
    assert!(!h.path("misc.md").exists());
}

#[tokio::test]
async fn test_page_moved_out_of_tree_keeps_local_file() {
    let h = synced().await;
    h.remote.seed("50", "900", "Elsewhere", "");
    h.remote.reparent("12", "50");

    let report = h.run().await;
    assert_eq!(report.moves.succeeded, vec!["12".to_string()]);
    assert!(h.path("misc.md").exists());
    assert!(report.deletions.succeeded.is_empty());

    let again = h.run().await;
    assert_eq!(again.mutations(), 0);
    assert!(again.moves.succeeded.is_empty());
    assert!(h.path("misc.md").exists());
}

// ===========================================================================
// Dry run
// ===========================================================================

#[tokio::test]
async fn test_dry_run_reports_without_touching_anything() {
    let h = synced().await;
    h.edit_local("guide.md", "alpha", "ALPHA");
    h.remote.edit("12", "<p>misc, revised</p>");
    std::fs::write(h.path("notes.md"), "Some notes\n").unwrap();
    let saves = h.backend.saves();
    let mutations = h.remote.mutations();
    let misc = std::fs::read(h.path("misc.md")).unwrap();

    let report = h
        .run_with(SyncOptions {
            dry_run: true,
            ..SyncOptions::default()
        })
        .await;

    assert!(report.dry_run);
    assert_eq!(report.mutations(), 0);
    assert_eq!(h.backend.saves(), saves);
    assert_eq!(h.remote.mutations(), mutations);
    assert_eq!(std::fs::read(h.path("misc.md")).unwrap(), misc);

    let kinds: Vec<ActionKind> = report.actions.iter().map(|a| a.kind).collect();
    assert!(kinds.contains(&ActionKind::Push));
    assert!(kinds.contains(&ActionKind::Pull));
    assert!(kinds.contains(&ActionKind::CreateRemote));
    let push = report
        .actions
        .iter()
        .find(|a| a.kind == ActionKind::Push)
        .unwrap();
    assert!(push.preview.as_deref().unwrap().contains("+ALPHA"));

    // The real run afterwards does exactly what was planned.
    let report = h.run().await;
    assert_eq!(report.pushed, 1);
    assert_eq!(report.pulled, 1);
    assert_eq!(report.created_remote, 1);
}

// ===========================================================================
// Force modes
// ===========================================================================

#[tokio::test]
async fn test_force_push_overwrites_remote_edits() {
    let h = synced().await;
    h.remote.edit("12", "<p>remote change</p>");

    let report = h
        .run_with(SyncOptions {
            mode: SyncMode::ForcePush,
            dry_run: false,
        })
        .await;
    assert_eq!(report.failures, Vec::new());
    assert_eq!(h.remote_text("12"), "misc\n");
    assert_eq!(h.header("misc.md").version, Some(3));
    assert!(!h.remote.is_trashed("10"));
}

#[tokio::test]
async fn test_force_push_recreates_vanished_page() {
    let h = synced().await;
    h.remote.purge("12");

    let report = h
        .run_with(SyncOptions {
            mode: SyncMode::ForcePush,
            dry_run: false,
        })
        .await;
    assert!(report.failures.is_empty());
    let id = h.remote.find_by_title("Misc").unwrap();
    assert_ne!(id, "12");
    assert_eq!(h.header("misc.md").page_id.as_deref(), Some(id.as_str()));
    assert!(h.state().get("12").is_none());
}

#[tokio::test]
async fn test_force_pull_overwrites_local_edits_and_keeps_extra_files() {
    let h = synced().await;
    h.edit_local("guide.md", "alpha", "local only");
    std::fs::write(h.path("scratch.md"), "draft\n").unwrap();

    let report = h
        .run_with(SyncOptions {
            mode: SyncMode::ForcePull,
            dry_run: false,
        })
        .await;
    assert_eq!(report.pulled, 1);
    assert_eq!(h.body("guide.md"), "# Guide\n\nalpha\n\nbeta\n");
    assert!(h.path("scratch.md").exists());
    assert_eq!(h.remote.mutations(), 0);
}

#[test]
fn test_both_force_flags_are_a_config_error() {
    let err = SyncMode::from_flags(true, true).unwrap_err();
    assert!(err.to_string().contains("force"));
}

// ===========================================================================
// Failure handling
// ===========================================================================

#[tokio::test]
async fn test_repeated_version_conflict_leaves_page_unresolved() {
    let h = synced().await;
    h.edit_local("guide.md", "alpha", "ALPHA");
    h.remote
        .inject_failure("update", Some("10"), 2, || RemoteError::VersionConflict {
            page_id: "10".into(),
            expected: 1,
            actual: Some(2),
        });

    let report = h.run().await;
    assert_eq!(report.pushed, 0);
    assert!(report.failures.is_empty());
    assert_eq!(report.conflicts, vec!["10".to_string()]);
    assert_eq!(report.exit_status(), ExitStatus::Conflicts);
    assert!(h.state().get("10").unwrap().pending_conflict.is_none());
    assert_eq!(h.remote.page("10").unwrap().body, GUIDE);
    assert_eq!(h.state().get("10").unwrap().baseline_text, "# Guide\n\nalpha\n\nbeta\n");

    // The local edit survives and goes out on the next cycle.
    let report = h.run().await;
    assert_eq!(report.pushed, 1);
    assert_eq!(h.remote_text("10"), "# Guide\n\nALPHA\n\nbeta\n");
}

#[tokio::test]
async fn test_unreachable_remote_aborts_with_network_error() {
    let h = synced().await;
    h.remote.inject_failure("list_children", None, 1, || {
        RemoteError::Unreachable("connection refused".into())
    });
    let saves = h.backend.saves();

    let err = h.engine.run(SyncOptions::default()).await.unwrap_err();
    assert_eq!(err.exit_code(), 4);
    assert!(!h.engine.is_running());
    // The abort still checkpoints the records as they were.
    assert_eq!(h.backend.saves(), saves + 1);
    assert_eq!(h.state().len(), 3);
}
