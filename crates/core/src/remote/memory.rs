//! In-process [`RemoteStore`] used by tests and offline runs.
//!
//! Behaves like the real wiki where the engine can observe it: versions
//! increase on every update, stale writes are rejected, trashed pages vanish
//! from fetches and listings. Failures can be injected per operation, and the
//! store records how many updates were ever in flight for one page at once.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::{AncestorRef, PageSummary, RemotePage, RemoteStore};
use crate::errors::RemoteError;

#[derive(Debug, Clone)]
struct Entry {
    title: String,
    body: String,
    version: u64,
    parent_id: Option<String>,
    trashed: bool,
    seq: u64,
}

struct InjectedFailure {
    operation: &'static str,
    page_id: Option<String>,
    remaining: usize,
    make: fn() -> RemoteError,
}

#[derive(Default)]
struct Inner {
    pages: BTreeMap<String, Entry>,
    next_id: u64,
    next_seq: u64,
    failures: Vec<InjectedFailure>,
    in_flight: HashMap<String, usize>,
    max_in_flight: usize,
    mutations: usize,
}

impl Inner {
    fn take_failure(&mut self, operation: &str, page_id: &str) -> Option<RemoteError> {
        let failure = self.failures.iter_mut().find(|f| {
            f.remaining > 0
                && f.operation == operation
                && f.page_id.as_deref().map_or(true, |id| id == page_id)
        })?;
        failure.remaining -= 1;
        Some((failure.make)())
    }

    fn live(&self, page_id: &str) -> Result<&Entry, RemoteError> {
        self.pages
            .get(page_id)
            .filter(|e| !e.trashed)
            .ok_or_else(|| RemoteError::NotFound {
                page_id: page_id.to_string(),
            })
    }

    fn ancestors(&self, page_id: &str) -> Vec<AncestorRef> {
        let mut chain = Vec::new();
        let mut cursor = self.pages.get(page_id).and_then(|e| e.parent_id.clone());
        while let Some(id) = cursor {
            let Some(entry) = self.pages.get(&id) else {
                break;
            };
            chain.push(AncestorRef {
                id: id.clone(),
                title: entry.title.clone(),
            });
            cursor = entry.parent_id.clone();
        }
        chain.reverse();
        chain
    }

    fn insert(&mut self, page_id: String, title: &str, body: &str, parent_id: Option<String>) {
        self.next_seq += 1;
        self.pages.insert(
            page_id,
            Entry {
                title: title.to_string(),
                body: body.to_string(),
                version: 1,
                parent_id,
                trashed: false,
                seq: self.next_seq,
            },
        );
    }
}

/// A wiki space held in memory.
pub struct InMemoryRemote {
    inner: Mutex<Inner>,
}

impl InMemoryRemote {
    /// A space with a single root page.
    pub fn new(root_id: &str, root_title: &str) -> Self {
        let mut inner = Inner {
            next_id: 1000,
            ..Inner::default()
        };
        inner.insert(root_id.to_string(), root_title, "", None);
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a page with an explicit id, outside any sync.
    pub fn seed(&self, page_id: &str, parent_id: &str, title: &str, body: &str) {
        self.lock()
            .insert(page_id.to_string(), title, body, Some(parent_id.to_string()));
    }

    /// Edit a page as another wiki user would: body replaced, version bumped.
    pub fn edit(&self, page_id: &str, body: &str) {
        if let Some(entry) = self.lock().pages.get_mut(page_id) {
            entry.body = body.to_string();
            entry.version += 1;
        }
    }

    /// Reparent a page as another wiki user would.
    pub fn reparent(&self, page_id: &str, new_parent_id: &str) {
        if let Some(entry) = self.lock().pages.get_mut(page_id) {
            entry.parent_id = Some(new_parent_id.to_string());
        }
    }

    /// Remove a page outright, as a purge by another user would.
    pub fn purge(&self, page_id: &str) {
        self.lock().pages.remove(page_id);
    }

    /// Fail the next `times` calls of `operation` (optionally for one page).
    pub fn inject_failure(
        &self,
        operation: &'static str,
        page_id: Option<&str>,
        times: usize,
        make: fn() -> RemoteError,
    ) {
        self.lock().failures.push(InjectedFailure {
            operation,
            page_id: page_id.map(str::to_string),
            remaining: times,
            make,
        });
    }

    /// Current stored page, trashed or not.
    pub fn page(&self, page_id: &str) -> Option<RemotePage> {
        let inner = self.lock();
        inner.pages.get(page_id).map(|e| RemotePage {
            page_id: page_id.to_string(),
            title: e.title.clone(),
            body: e.body.clone(),
            version: e.version,
            parent_id: e.parent_id.clone(),
            ancestors: inner.ancestors(page_id),
        })
    }

    pub fn is_trashed(&self, page_id: &str) -> bool {
        self.lock().pages.get(page_id).is_some_and(|e| e.trashed)
    }

    /// Successful create, update, move and trash calls.
    pub fn mutations(&self) -> usize {
        self.lock().mutations
    }

    /// Highest number of concurrent `update` calls seen for a single page.
    pub fn max_in_flight_per_page(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn find_by_title(&self, title: &str) -> Option<String> {
        self.lock()
            .pages
            .iter()
            .find(|(_, e)| !e.trashed && e.title == title)
            .map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn fetch(&self, page_id: &str) -> Result<RemotePage, RemoteError> {
        let mut inner = self.lock();
        if let Some(err) = inner.take_failure("fetch", page_id) {
            return Err(err);
        }
        let entry = inner.live(page_id)?.clone();
        Ok(RemotePage {
            page_id: page_id.to_string(),
            title: entry.title,
            body: entry.body,
            version: entry.version,
            parent_id: entry.parent_id,
            ancestors: inner.ancestors(page_id),
        })
    }

    async fn list_children(&self, page_id: &str) -> Result<Vec<PageSummary>, RemoteError> {
        let mut inner = self.lock();
        if let Some(err) = inner.take_failure("list_children", page_id) {
            return Err(err);
        }
        inner.live(page_id)?;
        let mut children: Vec<(&String, &Entry)> = inner
            .pages
            .iter()
            .filter(|(_, e)| !e.trashed && e.parent_id.as_deref() == Some(page_id))
            .collect();
        children.sort_by_key(|(_, e)| e.seq);
        Ok(children
            .into_iter()
            .map(|(id, e)| PageSummary {
                page_id: id.clone(),
                title: e.title.clone(),
                version: e.version,
                parent_id: e.parent_id.clone(),
            })
            .collect())
    }

    async fn create(
        &self,
        parent_id: &str,
        title: &str,
        body: &str,
    ) -> Result<RemotePage, RemoteError> {
        let mut inner = self.lock();
        if let Some(err) = inner.take_failure("create", parent_id) {
            return Err(err);
        }
        inner.live(parent_id)?;
        inner.next_id += 1;
        let page_id = inner.next_id.to_string();
        inner.insert(page_id.clone(), title, body, Some(parent_id.to_string()));
        inner.mutations += 1;
        debug!(page_id = %page_id, parent_id, "in-memory page created");
        Ok(RemotePage {
            page_id: page_id.clone(),
            title: title.to_string(),
            body: body.to_string(),
            version: 1,
            parent_id: Some(parent_id.to_string()),
            ancestors: inner.ancestors(&page_id),
        })
    }

    async fn update(
        &self,
        page_id: &str,
        title: &str,
        body: &str,
        base_version: u64,
    ) -> Result<u64, RemoteError> {
        {
            let mut inner = self.lock();
            if let Some(err) = inner.take_failure("update", page_id) {
                return Err(err);
            }
            let count = inner.in_flight.entry(page_id.to_string()).or_insert(0);
            *count += 1;
            let now = *count;
            inner.max_in_flight = inner.max_in_flight.max(now);
        }

        // Give any other task touching this page a chance to overlap.
        tokio::task::yield_now().await;

        let mut inner = self.lock();
        if let Some(count) = inner.in_flight.get_mut(page_id) {
            *count -= 1;
        }
        let current = inner.live(page_id)?.version;
        if current != base_version {
            return Err(RemoteError::VersionConflict {
                page_id: page_id.to_string(),
                expected: base_version,
                actual: Some(current),
            });
        }
        let Some(entry) = inner.pages.get_mut(page_id) else {
            return Err(RemoteError::NotFound {
                page_id: page_id.to_string(),
            });
        };
        entry.title = title.to_string();
        entry.body = body.to_string();
        entry.version += 1;
        let version = entry.version;
        inner.mutations += 1;
        Ok(version)
    }

    async fn move_page(&self, page_id: &str, new_parent_id: &str) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        if let Some(err) = inner.take_failure("move_page", page_id) {
            return Err(err);
        }
        inner.live(new_parent_id)?;
        inner.live(page_id)?;
        if let Some(entry) = inner.pages.get_mut(page_id) {
            entry.parent_id = Some(new_parent_id.to_string());
        }
        inner.mutations += 1;
        Ok(())
    }

    async fn trash(&self, page_id: &str) -> Result<(), RemoteError> {
        let mut inner = self.lock();
        if let Some(err) = inner.take_failure("trash", page_id) {
            return Err(err);
        }
        inner.live(page_id)?;
        if let Some(entry) = inner.pages.get_mut(page_id) {
            entry.trashed = true;
        }
        inner.mutations += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> InMemoryRemote {
        let remote = InMemoryRemote::new("1", "Root");
        remote.seed("2", "1", "Child", "<p>a</p>");
        remote.seed("3", "2", "Grandchild", "<p>b</p>");
        remote
    }

    #[tokio::test]
    async fn test_fetch_reports_ancestors() {
        let page = remote().fetch("3").await.unwrap();
        assert_eq!(page.parent_id.as_deref(), Some("2"));
        let ids: Vec<_> = page.ancestors.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_list_tree_is_breadth_first() {
        let tree = remote().list_tree("1").await.unwrap();
        let ids: Vec<_> = tree.iter().map(|p| p.page_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "3"]);
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected() {
        let remote = remote();
        assert_eq!(remote.update("2", "Child", "<p>x</p>", 1).await.unwrap(), 2);
        let err = remote.update("2", "Child", "<p>y</p>", 1).await.unwrap_err();
        assert!(matches!(
            err,
            RemoteError::VersionConflict {
                expected: 1,
                actual: Some(2),
                ..
            }
        ));
        assert_eq!(remote.page("2").unwrap().body, "<p>x</p>");
    }

    #[tokio::test]
    async fn test_trash_is_recoverable_and_hidden() {
        let remote = remote();
        remote.trash("3").await.unwrap();
        assert!(remote.is_trashed("3"));
        assert!(remote.page("3").is_some());
        assert!(remote.fetch("3").await.unwrap_err().is_not_found());
        assert!(remote.trash("3").await.unwrap_err().is_not_found());
        assert!(remote.list_children("2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let remote = remote();
        remote.inject_failure("fetch", Some("2"), 1, || {
            RemoteError::Unreachable("injected".into())
        });
        assert!(remote.fetch("2").await.is_err());
        assert!(remote.fetch("2").await.is_ok());
    }
}
