//! Change classification.
//!
//! Compares the observed local tree and remote hierarchy against the stored
//! [`PageRecord`]s and labels every page. Nothing here mutates either store;
//! the orchestrator acts on the returned [`Classification`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::conflict::has_conflict_markers;
use crate::fingerprint::same_content;
use crate::local::LocalPage;
use crate::models::{ChangeSet, ConflictEntry, PageRecord, PullTarget, PushTarget};
use crate::remote::{PageSummary, RemotePage};
use crate::state::PageStateStore;

/// What the remote looked like at the start of the cycle.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    pub root_id: String,
    pub pages: BTreeMap<String, RemoteEntry>,
}

/// One remote page as observed in phase 1.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub summary: PageSummary,
    /// Listed under the sync root, as opposed to fetched by id only.
    pub in_tree: bool,
    /// Full page, when it was fetched.
    pub page: Option<RemotePage>,
    /// Common text form of `page.body`.
    pub text: Option<String>,
}

impl RemoteSnapshot {
    pub fn new(root_id: impl Into<String>) -> Self {
        Self {
            root_id: root_id.into(),
            pages: BTreeMap::new(),
        }
    }

    pub fn in_tree(&self, page_id: &str) -> Option<&RemoteEntry> {
        self.pages.get(page_id).filter(|e| e.in_tree)
    }

    pub fn text(&self, page_id: &str) -> Option<&str> {
        self.pages.get(page_id).and_then(|e| e.text.as_deref())
    }
}

/// A tracked page missing from its expected location on one or both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ambiguity {
    pub page_id: String,
    pub local_missing: bool,
    pub remote_missing: bool,
}

/// Classifier output.
#[derive(Debug, Clone, Default)]
pub struct Classification {
    pub changes: ChangeSet,
    /// Absences the disambiguator must resolve before they get a label.
    pub ambiguous: Vec<Ambiguity>,
    /// Remote version bumps that did not change content.
    pub version_refresh: Vec<(String, u64)>,
    /// Records to create for header files that claim an untracked page.
    pub adoptions: Vec<PageRecord>,
}

/// Content-level decision for a page present on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentLabel {
    Unchanged,
    Push,
    Pull,
    Conflict { unresolved: bool },
}

/// Decide how a page present on both sides changed since the baseline.
///
/// Returns the label and, for a version bump without a content change, the
/// version the record should be refreshed to. `remote_text` may be `None`
/// when the remote version did not move and nothing was fetched.
pub fn label_content(
    record: &PageRecord,
    local_body: &str,
    remote_version: u64,
    remote_text: Option<&str>,
) -> (ContentLabel, Option<u64>) {
    if record.pending_conflict.is_some() && has_conflict_markers(local_body) {
        return (ContentLabel::Conflict { unresolved: true }, None);
    }

    let base = record.merge_base();
    let local_changed = !same_content(local_body, base);
    let (remote_changed, refresh) = if remote_version == record.known_remote_version() {
        (false, None)
    } else {
        match remote_text {
            Some(text) if same_content(text, base) => (false, Some(remote_version)),
            _ => (true, None),
        }
    };

    let label = match (local_changed, remote_changed) {
        (false, false) => ContentLabel::Unchanged,
        (true, false) => ContentLabel::Push,
        (false, true) => ContentLabel::Pull,
        (true, true) => ContentLabel::Conflict { unresolved: false },
    };
    (label, refresh)
}

/// Put a content label into the change set.
pub fn record_label(changes: &mut ChangeSet, page_id: &str, label: ContentLabel) {
    let id = page_id.to_string();
    match label {
        ContentLabel::Unchanged => changes.unchanged.push(id),
        ContentLabel::Push => changes.to_push.push(PushTarget::Existing(id)),
        ContentLabel::Pull => changes.to_pull.push(PullTarget::Existing(id)),
        ContentLabel::Conflict { unresolved } => changes.conflicts.push(ConflictEntry {
            page_id: id,
            unresolved,
        }),
    }
}

/// Whether `title` matches one of the `exclude_titles` glob patterns.
pub fn title_excluded(patterns: &[String], title: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| glob_match::glob_match(pattern, title))
}

/// Labels pages against the stored state.
pub struct Classifier<'a> {
    records: &'a PageStateStore,
    exclude_titles: &'a [String],
    /// Pages whose observation failed this cycle; they get no label.
    skipped: &'a HashSet<String>,
}

impl<'a> Classifier<'a> {
    pub fn new(
        records: &'a PageStateStore,
        exclude_titles: &'a [String],
        skipped: &'a HashSet<String>,
    ) -> Self {
        Self {
            records,
            exclude_titles,
            skipped,
        }
    }

    pub fn classify(&self, local: &[LocalPage], remote: &RemoteSnapshot) -> Classification {
        let mut out = Classification::default();

        let by_path: HashMap<&PathBuf, &LocalPage> = local.iter().map(|p| (&p.path, p)).collect();
        let mut claimed_paths: HashSet<&PathBuf> = HashSet::new();
        let mut claimed_remote: HashSet<&str> = HashSet::new();

        // Tracked pages.
        for record in self.records.records() {
            let id = record.page_id.as_str();
            claimed_remote.insert(id);
            if self.skipped.contains(id) {
                if let Some(page) = by_path.get(&record.local_path) {
                    claimed_paths.insert(&page.path);
                }
                continue;
            }

            let local_page = by_path
                .get(&record.local_path)
                .copied()
                .filter(|p| p.header.page_id.as_deref().map_or(true, |pid| pid == id));
            if let Some(page) = local_page {
                claimed_paths.insert(&page.path);
            }

            let remote_entry = remote
                .in_tree(id)
                .filter(|e| e.summary.parent_id == record.parent_id);

            match (local_page, remote_entry) {
                (Some(page), Some(entry)) => {
                    let (label, refresh) = label_content(
                        record,
                        &page.body,
                        entry.summary.version,
                        entry.text.as_deref(),
                    );
                    debug!(page_id = id, ?label, "classified tracked page");
                    record_label(&mut out.changes, id, label);
                    if let Some(version) = refresh {
                        out.version_refresh.push((id.to_string(), version));
                    }
                }
                (local_page, remote_entry) => {
                    debug!(
                        page_id = id,
                        local = local_page.is_some(),
                        remote = remote_entry.is_some(),
                        "ambiguous absence"
                    );
                    out.ambiguous.push(Ambiguity {
                        page_id: id.to_string(),
                        local_missing: local_page.is_none(),
                        remote_missing: remote_entry.is_none(),
                    });
                }
            }
        }

        // Local files not claimed by a record at their expected path.
        for page in local {
            if claimed_paths.contains(&page.path) {
                continue;
            }
            match page.header.page_id.as_deref() {
                Some(id) if self.records.get(id).is_some() => {
                    // A tracked page found elsewhere: the disambiguator
                    // picks it up as a local move when its record is
                    // ambiguous. Otherwise it is a stray copy.
                    let record_ambiguous = out.ambiguous.iter().any(|a| a.page_id == id);
                    if !record_ambiguous {
                        warn!(
                            page_id = id,
                            path = %page.path.display(),
                            "ignoring second file claiming a tracked page"
                        );
                    }
                }
                Some(id) if self.skipped.contains(id) => {
                    claimed_remote.insert(id);
                }
                Some(id) => match remote.pages.get(id) {
                    Some(entry) => {
                        claimed_remote.insert(id);
                        self.adopt(&mut out, page, entry);
                    }
                    None => {
                        debug!(path = %page.path.display(), page_id = id, "header names an unknown page, creating");
                        out.changes.to_push.push(PushTarget::Create(page.path.clone()));
                    }
                },
                None => {
                    debug!(path = %page.path.display(), "new local file");
                    out.changes.to_push.push(PushTarget::Create(page.path.clone()));
                }
            }
        }

        // Remote pages nobody tracks yet.
        for (id, entry) in &remote.pages {
            if !entry.in_tree || claimed_remote.contains(id.as_str()) || self.skipped.contains(id) {
                continue;
            }
            if title_excluded(self.exclude_titles, &entry.summary.title) {
                debug!(page_id = %id, title = %entry.summary.title, "excluded by title");
                continue;
            }
            debug!(page_id = %id, "new remote page");
            out.changes.to_pull.push(PullTarget::Create(id.clone()));
        }

        out
    }

    /// A header file claims a page we have no record of.
    fn adopt(&self, out: &mut Classification, page: &LocalPage, entry: &RemoteEntry) {
        let id = entry.summary.page_id.clone();
        let Some(remote_text) = entry.text.as_deref() else {
            warn!(page_id = %id, "untracked page was not fetched, leaving it alone");
            return;
        };
        if same_content(&page.body, remote_text) {
            debug!(page_id = %id, "adopting untracked header file");
            out.adoptions.push(PageRecord::new(
                id.clone(),
                entry.summary.title.clone(),
                page.path.clone(),
                entry.summary.version,
                remote_text,
                entry.summary.parent_id.clone(),
            ));
            out.changes.unchanged.push(id);
        } else {
            debug!(page_id = %id, "untracked header file differs from remote");
            out.adoptions.push(PageRecord::new(
                id.clone(),
                entry.summary.title.clone(),
                page.path.clone(),
                entry.summary.version,
                "",
                entry.summary.parent_id.clone(),
            ));
            out.changes.conflicts.push(ConflictEntry {
                page_id: id,
                unresolved: false,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::PageHeader;
    use crate::models::PendingConflict;

    fn summary(id: &str, version: u64, parent: &str) -> PageSummary {
        PageSummary {
            page_id: id.into(),
            title: format!("Page {}", id),
            version,
            parent_id: Some(parent.into()),
        }
    }

    fn entry(id: &str, version: u64, parent: &str, text: Option<&str>) -> RemoteEntry {
        RemoteEntry {
            summary: summary(id, version, parent),
            in_tree: true,
            page: None,
            text: text.map(str::to_string),
        }
    }

    fn local(path: &str, id: Option<&str>, body: &str) -> LocalPage {
        LocalPage {
            path: PathBuf::from(path),
            header: PageHeader {
                page_id: id.map(str::to_string),
                version: None,
                title: None,
            },
            body: body.into(),
        }
    }

    fn store(records: Vec<PageRecord>) -> PageStateStore {
        let mut store = PageStateStore::default();
        for r in records {
            store.upsert(r).unwrap();
        }
        store
    }

    fn tracked(id: &str, version: u64, baseline: &str) -> PageRecord {
        PageRecord::new(id, format!("Page {}", id), format!("{}.md", id), version, baseline, Some("root".into()))
    }

    fn run(
        records: &PageStateStore,
        local_pages: &[LocalPage],
        remote: &RemoteSnapshot,
    ) -> Classification {
        let skipped = HashSet::new();
        let exclude = vec!["Archive*".to_string()];
        Classifier::new(records, &exclude, &skipped).classify(local_pages, remote)
    }

    fn snapshot(entries: Vec<RemoteEntry>) -> RemoteSnapshot {
        let mut snap = RemoteSnapshot::new("root");
        for e in entries {
            snap.pages.insert(e.summary.page_id.clone(), e);
        }
        snap
    }

    #[test]
    fn test_decision_table() {
        let records = store(vec![
            tracked("1", 1, "same\n"),
            tracked("2", 1, "base\n"),
            tracked("3", 1, "base\n"),
            tracked("4", 1, "base\n"),
        ]);
        let local_pages = vec![
            local("1.md", Some("1"), "same\n"),
            local("2.md", Some("2"), "local edit\n"),
            local("3.md", Some("3"), "base\n"),
            local("4.md", Some("4"), "local edit\n"),
        ];
        let remote = snapshot(vec![
            entry("1", 1, "root", None),
            entry("2", 1, "root", None),
            entry("3", 2, "root", Some("remote edit\n")),
            entry("4", 2, "root", Some("remote edit\n")),
        ]);
        let result = run(&records, &local_pages, &remote);
        let c = &result.changes;
        assert_eq!(c.unchanged, vec!["1".to_string()]);
        assert_eq!(c.to_push, vec![PushTarget::Existing("2".into())]);
        assert_eq!(c.to_pull, vec![PullTarget::Existing("3".into())]);
        assert_eq!(
            c.conflicts,
            vec![ConflictEntry {
                page_id: "4".into(),
                unresolved: false
            }]
        );
        assert!(result.ambiguous.is_empty());
        assert_eq!(c.len(), 4);
    }

    #[test]
    fn test_version_bump_without_content_change() {
        let records = store(vec![tracked("1", 3, "text\n")]);
        let local_pages = vec![local("1.md", Some("1"), "text\n")];
        let remote = snapshot(vec![entry("1", 5, "root", Some("text\n"))]);
        let result = run(&records, &local_pages, &remote);
        assert_eq!(result.changes.unchanged, vec!["1".to_string()]);
        assert_eq!(result.version_refresh, vec![("1".to_string(), 5)]);
    }

    #[test]
    fn test_absences_are_ambiguous() {
        let records = store(vec![tracked("1", 1, "a\n"), tracked("2", 1, "b\n"), tracked("3", 1, "c\n")]);
        let local_pages = vec![
            local("1.md", Some("1"), "a\n"),
            local("moved/2.md", Some("2"), "b\n"),
            local("3.md", Some("3"), "c\n"),
        ];
        let remote = snapshot(vec![entry("2", 1, "root", None), entry("3", 1, "elsewhere", None)]);
        let result = run(&records, &local_pages, &remote);
        assert!(result.changes.is_empty());
        assert_eq!(
            result.ambiguous,
            vec![
                Ambiguity {
                    page_id: "1".into(),
                    local_missing: false,
                    remote_missing: true
                },
                Ambiguity {
                    page_id: "2".into(),
                    local_missing: true,
                    remote_missing: false
                },
                Ambiguity {
                    page_id: "3".into(),
                    local_missing: false,
                    remote_missing: true
                },
            ]
        );
        // The moved file is not mistaken for a new page.
        assert!(result.changes.to_push.is_empty());
    }

    #[test]
    fn test_new_pages_on_both_sides() {
        let records = store(Vec::new());
        let local_pages = vec![local("notes.md", None, "hello\n")];
        let remote = snapshot(vec![
            entry("10", 1, "root", None),
            RemoteEntry {
                summary: PageSummary {
                    page_id: "11".into(),
                    title: "Archive 2020".into(),
                    version: 1,
                    parent_id: Some("root".into()),
                },
                in_tree: true,
                page: None,
                text: None,
            },
        ]);
        let result = run(&records, &local_pages, &remote);
        assert_eq!(
            result.changes.to_push,
            vec![PushTarget::Create(PathBuf::from("notes.md"))]
        );
        assert_eq!(result.changes.to_pull, vec![PullTarget::Create("10".into())]);
    }

    #[test]
    fn test_untracked_header_file_adoption() {
        let records = store(Vec::new());
        let local_pages = vec![
            local("a.md", Some("20"), "same\n"),
            local("b.md", Some("21"), "mine\n"),
        ];
        let remote = snapshot(vec![
            entry("20", 4, "root", Some("same\n")),
            entry("21", 2, "root", Some("theirs\n")),
        ]);
        let result = run(&records, &local_pages, &remote);
        assert_eq!(result.changes.unchanged, vec!["20".to_string()]);
        assert_eq!(result.changes.conflicts[0].page_id, "21");
        assert_eq!(result.adoptions.len(), 2);
        assert_eq!(result.adoptions[0].baseline_text, "same\n");
        assert_eq!(result.adoptions[1].baseline_text, "");
        assert!(result.changes.to_pull.is_empty());
    }

    #[test]
    fn test_pending_conflict_with_markers_stays_unresolved() {
        let mut record = tracked("1", 2, "base\n");
        record.pending_conflict = Some(PendingConflict {
            remote_version: 3,
            remote_text: "theirs\n".into(),
            detected_at: chrono::Utc::now(),
        });
        let body = "<<<<<<< local\nmine\n||||||| baseline\nbase\n=======\ntheirs\n>>>>>>> remote\n";
        let (label, _) = label_content(&record, body, 3, None);
        assert_eq!(label, ContentLabel::Conflict { unresolved: true });

        // Markers removed and the remote did not move: the edit is pushed.
        let (label, _) = label_content(&record, "resolved\n", 3, None);
        assert_eq!(label, ContentLabel::Push);

        // Resolution identical to the remote side: nothing to send.
        let (label, _) = label_content(&record, "theirs\n", 3, None);
        assert_eq!(label, ContentLabel::Unchanged);
    }
}
