//! Move/delete disambiguation.
//!
//! A tracked page missing from its expected location is resolved by
//! identity, never by location: if the page still resolves by `page_id` it
//! moved, and only a definitive "not found" makes it a deletion.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::classify::Ambiguity;
use crate::errors::RemoteError;
use crate::local::{LocalPage, LocalTree};
use crate::models::{PageMove, PageRecord};
use crate::remote::{RemotePage, RemoteStore};
use crate::state::PageStateStore;

/// Result of resolving one side.
#[derive(Debug, Clone, PartialEq)]
pub enum SideResolution {
    /// Still under the recorded parent: a listing glitch, or a page that
    /// already left the synced tree in an earlier cycle.
    Present(Box<RemotePage>),
    /// Still resolvable by id, somewhere else.
    Moved {
        /// Remote: the page as fetched. Local: `None`.
        page: Option<Box<RemotePage>>,
        new_parent_id: Option<String>,
        /// Local path the file now has (local side) or should get (remote
        /// side); `None` when a remote page left the synced tree.
        path: Option<PathBuf>,
    },
    Deleted,
}

/// Final label for an ambiguous page.
#[derive(Debug, Clone, PartialEq)]
pub enum Disambiguated {
    /// The remote page was found in place; classify it by content.
    Present { page_id: String, page: Box<RemotePage> },
    MovedRemote(PageMove),
    MovedLocal(PageMove),
    /// Gone from the remote: remove the local mirror, wherever the file
    /// currently is.
    DeletedRemote { page_id: String, local_path: PathBuf },
    /// Gone locally: trash the remote page.
    DeletedLocal(String),
}

/// Resolves ambiguous absences against the remote store and local scan.
pub struct Disambiguator<'a> {
    remote: &'a dyn RemoteStore,
    tree: &'a LocalTree,
    records: &'a PageStateStore,
    local_pages: &'a [LocalPage],
    root_id: &'a str,
}

impl<'a> Disambiguator<'a> {
    pub fn new(
        remote: &'a dyn RemoteStore,
        tree: &'a LocalTree,
        records: &'a PageStateStore,
        local_pages: &'a [LocalPage],
        root_id: &'a str,
    ) -> Self {
        Self {
            remote,
            tree,
            records,
            local_pages,
            root_id,
        }
    }

    /// Re-fetch by id. Only `NotFound` counts as deletion; any other error
    /// is returned to the caller.
    pub async fn resolve_remote(&self, record: &PageRecord) -> Result<SideResolution, RemoteError> {
        match self.remote.fetch(&record.page_id).await {
            Ok(page) => {
                if page.parent_id == record.parent_id {
                    debug!(page_id = %record.page_id, "remote page found in place");
                    return Ok(SideResolution::Present(Box::new(page)));
                }
                let path = if self.under_root(&page) {
                    Some(self.remote_path(&page))
                } else {
                    warn!(
                        page_id = %record.page_id,
                        "remote page moved outside the synced tree, keeping local file in place"
                    );
                    None
                };
                info!(
                    page_id = %record.page_id,
                    from_parent = ?record.parent_id,
                    to_parent = ?page.parent_id,
                    "remote page moved"
                );
                Ok(SideResolution::Moved {
                    new_parent_id: page.parent_id.clone(),
                    page: Some(Box::new(page)),
                    path,
                })
            }
            Err(e) if e.is_not_found() => {
                info!(page_id = %record.page_id, "remote page no longer exists");
                Ok(SideResolution::Deleted)
            }
            Err(e) => Err(e),
        }
    }

    /// Look for the file by its embedded `page_id` at another path.
    pub fn resolve_local(&self, record: &PageRecord) -> SideResolution {
        let found = self.local_pages.iter().find(|p| {
            p.header.page_id.as_deref() == Some(record.page_id.as_str())
                && p.path != record.local_path
        });
        match found {
            Some(page) => {
                let new_parent_id = self.local_parent(&page.path);
                info!(
                    page_id = %record.page_id,
                    from = %record.local_path.display(),
                    to = %page.path.display(),
                    "local file moved"
                );
                SideResolution::Moved {
                    page: None,
                    new_parent_id,
                    path: Some(page.path.clone()),
                }
            }
            None => {
                info!(page_id = %record.page_id, path = %record.local_path.display(), "local file deleted");
                SideResolution::Deleted
            }
        }
    }

    /// Resolve one ambiguity into a final label.
    ///
    /// When both sides are missing the remote side decides first: a remote
    /// deletion wins, a remote move is followed locally, and a remote move
    /// with a local deletion trashes the remote page.
    pub async fn resolve(&self, ambiguity: &Ambiguity) -> Result<Disambiguated, RemoteError> {
        let id = ambiguity.page_id.clone();
        let Some(record) = self.records.get(&id) else {
            return Err(RemoteError::NotFound { page_id: id });
        };

        let remote = if ambiguity.remote_missing {
            Some(self.resolve_remote(record).await?)
        } else {
            None
        };
        let local = if ambiguity.local_missing {
            Some(self.resolve_local(record))
        } else {
            None
        };

        let outcome = match (remote, local) {
            (Some(SideResolution::Deleted), local) => {
                let local_path = match local {
                    Some(SideResolution::Moved {
                        path: Some(found), ..
                    }) => found,
                    _ => record.local_path.clone(),
                };
                Disambiguated::DeletedRemote {
                    page_id: id,
                    local_path,
                }
            }
            (Some(SideResolution::Moved { new_parent_id, path, .. }), None) => {
                Disambiguated::MovedRemote(PageMove {
                    page_id: id,
                    from_path: record.local_path.clone(),
                    to_path: path,
                    new_parent_id,
                })
            }
            (Some(SideResolution::Moved { new_parent_id, path, .. }), Some(local)) => match local {
                SideResolution::Moved {
                    path: Some(found), ..
                } => Disambiguated::MovedRemote(PageMove {
                    page_id: id,
                    from_path: found,
                    to_path: path,
                    new_parent_id,
                }),
                _ => Disambiguated::DeletedLocal(id),
            },
            (Some(SideResolution::Present(page)), None) => Disambiguated::Present { page_id: id, page },
            (Some(SideResolution::Present(_)) | None, Some(SideResolution::Moved { path, new_parent_id, .. })) => {
                Disambiguated::MovedLocal(PageMove {
                    page_id: id,
                    from_path: record.local_path.clone(),
                    to_path: path,
                    new_parent_id,
                })
            }
            (Some(SideResolution::Present(_)) | None, Some(_)) => Disambiguated::DeletedLocal(id),
            (None, None) => {
                return Err(RemoteError::Parse(format!(
                    "page {} is not ambiguous on either side",
                    ambiguity.page_id
                )))
            }
        };
        debug!(page_id = %ambiguity.page_id, ?outcome, "disambiguated");
        Ok(outcome)
    }

    fn under_root(&self, page: &RemotePage) -> bool {
        page.parent_id.as_deref() == Some(self.root_id)
            || page.ancestors.iter().any(|a| a.id == self.root_id)
    }

    /// Where the mirror of a remote page belongs locally.
    pub fn remote_path(&self, page: &RemotePage) -> PathBuf {
        local_path_for(self.tree, self.records, self.root_id, page)
    }

    /// Parent page id implied by a local path: the page stored at
    /// `<dir>.<ext>`, else the sync root.
    fn local_parent(&self, path: &Path) -> Option<String> {
        let parent = self
            .tree
            .parent_page_path(path)
            .and_then(|p| self.records.find_by_path(&p).map(|r| r.page_id.clone()));
        Some(parent.unwrap_or_else(|| self.root_id.to_string()))
    }
}

/// Local path for a remote page: below its parent's file when the parent is
/// tracked, otherwise laid out from the ancestor titles below the root.
pub fn local_path_for(
    tree: &LocalTree,
    records: &PageStateStore,
    root_id: &str,
    page: &RemotePage,
) -> PathBuf {
    if page.parent_id.as_deref() == Some(root_id) {
        return tree.child_path(None, &page.title);
    }
    if let Some(parent) = page.parent_id.as_deref().and_then(|id| records.get(id)) {
        return tree.child_path(Some(&parent.local_path), &page.title);
    }
    let below_root: Vec<&str> = match page.ancestors.iter().position(|a| a.id == root_id) {
        Some(idx) => page.ancestors[idx + 1..].iter().map(|a| a.title.as_str()).collect(),
        None => Vec::new(),
    };
    tree.layout_path(&below_root, &page.title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::PageHeader;
    use crate::remote::InMemoryRemote;

    fn setup() -> (InMemoryRemote, PageStateStore, LocalTree) {
        let remote = InMemoryRemote::new("root", "Root");
        remote.seed("10", "root", "Ops", "<p>ops</p>");
        remote.seed("11", "root", "Runbook", "<p>run</p>");
        let mut records = PageStateStore::default();
        records
            .upsert(PageRecord::new("10", "Ops", "ops.md", 1, "ops\n", Some("root".into())))
            .unwrap();
        records
            .upsert(PageRecord::new("11", "Runbook", "runbook.md", 1, "run\n", Some("root".into())))
            .unwrap();
        let tree = LocalTree::new("/nonexistent", "md", Vec::new());
        (remote, records, tree)
    }

    fn missing_remote(id: &str) -> Ambiguity {
        Ambiguity {
            page_id: id.into(),
            local_missing: false,
            remote_missing: true,
        }
    }

    #[tokio::test]
    async fn test_reparented_page_is_a_move() {
        let (remote, records, tree) = setup();
        remote.reparent("11", "10");
        let d = Disambiguator::new(&remote, &tree, &records, &[], "root");
        match d.resolve(&missing_remote("11")).await.unwrap() {
            Disambiguated::MovedRemote(m) => {
                assert_eq!(m.new_parent_id.as_deref(), Some("10"));
                assert_eq!(m.from_path, PathBuf::from("runbook.md"));
                assert_eq!(m.to_path, Some(PathBuf::from("ops/runbook.md")));
            }
            other => panic!("expected move, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_found_is_a_delete() {
        let (remote, records, tree) = setup();
        remote.purge("11");
        let d = Disambiguator::new(&remote, &tree, &records, &[], "root");
        assert_eq!(
            d.resolve(&missing_remote("11")).await.unwrap(),
            Disambiguated::DeletedRemote {
                page_id: "11".into(),
                local_path: PathBuf::from("runbook.md"),
            }
        );
    }

    #[tokio::test]
    async fn test_other_errors_are_not_deletions() {
        let (remote, records, tree) = setup();
        remote.inject_failure("fetch", Some("11"), 1, || {
            RemoteError::Unreachable("down".into())
        });
        let d = Disambiguator::new(&remote, &tree, &records, &[], "root");
        assert!(d.resolve(&missing_remote("11")).await.is_err());
    }

    #[tokio::test]
    async fn test_listing_glitch_is_present() {
        let (remote, records, tree) = setup();
        let d = Disambiguator::new(&remote, &tree, &records, &[], "root");
        assert!(matches!(
            d.resolve(&missing_remote("11")).await.unwrap(),
            Disambiguated::Present { .. }
        ));
    }

    #[tokio::test]
    async fn test_local_file_found_elsewhere_is_a_move() {
        let (remote, records, tree) = setup();
        let local = vec![LocalPage {
            path: PathBuf::from("ops/runbook.md"),
            header: PageHeader::tracked("11", 1, "Runbook"),
            body: "run\n".into(),
        }];
        let d = Disambiguator::new(&remote, &tree, &records, &local, "root");
        let ambiguity = Ambiguity {
            page_id: "11".into(),
            local_missing: true,
            remote_missing: false,
        };
        match d.resolve(&ambiguity).await.unwrap() {
            Disambiguated::MovedLocal(m) => {
                assert_eq!(m.to_path, Some(PathBuf::from("ops/runbook.md")));
                assert_eq!(m.new_parent_id.as_deref(), Some("10"));
            }
            other => panic!("expected local move, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_local_file_gone_is_a_delete() {
        let (remote, records, tree) = setup();
        let d = Disambiguator::new(&remote, &tree, &records, &[], "root");
        let ambiguity = Ambiguity {
            page_id: "11".into(),
            local_missing: true,
            remote_missing: false,
        };
        assert_eq!(
            d.resolve(&ambiguity).await.unwrap(),
            Disambiguated::DeletedLocal("11".into())
        );
    }

    #[tokio::test]
    async fn test_both_sides_moved_follows_remote() {
        let (remote, records, tree) = setup();
        remote.reparent("11", "10");
        let local = vec![LocalPage {
            path: PathBuf::from("misc/runbook.md"),
            header: PageHeader::tracked("11", 1, "Runbook"),
            body: "run\n".into(),
        }];
        let d = Disambiguator::new(&remote, &tree, &records, &local, "root");
        let ambiguity = Ambiguity {
            page_id: "11".into(),
            local_missing: true,
            remote_missing: true,
        };
        match d.resolve(&ambiguity).await.unwrap() {
            Disambiguated::MovedRemote(m) => {
                assert_eq!(m.from_path, PathBuf::from("misc/runbook.md"));
                assert_eq!(m.to_path, Some(PathBuf::from("ops/runbook.md")));
            }
            other => panic!("expected remote move, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_delete_removes_the_moved_file() {
        let (remote, records, tree) = setup();
        remote.purge("11");
        let local = vec![LocalPage {
            path: PathBuf::from("ops/runbook.md"),
            header: PageHeader::tracked("11", 1, "Runbook"),
            body: "run\n".into(),
        }];
        let d = Disambiguator::new(&remote, &tree, &records, &local, "root");
        let ambiguity = Ambiguity {
            page_id: "11".into(),
            local_missing: true,
            remote_missing: true,
        };
        assert_eq!(
            d.resolve(&ambiguity).await.unwrap(),
            Disambiguated::DeletedRemote {
                page_id: "11".into(),
                local_path: PathBuf::from("ops/runbook.md"),
            }
        );
    }
}
