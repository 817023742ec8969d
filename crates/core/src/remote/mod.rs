//! Remote wiki store abstraction.
//!
//! The engine talks to the wiki only through [`RemoteStore`]. Page bodies
//! cross this boundary in the wiki's native markup; conversion to the common
//! text form happens in [`crate::convert`].

pub mod confluence;
pub mod memory;
pub mod retry;

use std::collections::VecDeque;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::RemoteError;

pub use confluence::ConfluenceClient;
pub use memory::InMemoryRemote;
pub use retry::{RetryPolicy, RetryingRemote};

/// An ancestor reference, root first in [`RemotePage::ancestors`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestorRef {
    pub id: String,
    pub title: String,
}

/// A fully fetched page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePage {
    pub page_id: String,
    pub title: String,
    /// Native markup.
    pub body: String,
    pub version: u64,
    pub parent_id: Option<String>,
    /// Ancestor chain from the space root down to the immediate parent.
    pub ancestors: Vec<AncestorRef>,
}

impl RemotePage {
    pub fn summary(&self) -> PageSummary {
        PageSummary {
            page_id: self.page_id.clone(),
            title: self.title.clone(),
            version: self.version,
            parent_id: self.parent_id.clone(),
        }
    }
}

/// Listing entry: identity and version without the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSummary {
    pub page_id: String,
    pub title: String,
    pub version: u64,
    pub parent_id: Option<String>,
}

/// Page-level operations on the remote wiki.
///
/// Every method is a single remote call; retrying is layered on top by
/// [`RetryingRemote`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch(&self, page_id: &str) -> Result<RemotePage, RemoteError>;

    /// Direct children of `page_id`.
    async fn list_children(&self, page_id: &str) -> Result<Vec<PageSummary>, RemoteError>;

    /// Every descendant of `root_id`, parents before children.
    async fn list_tree(&self, root_id: &str) -> Result<Vec<PageSummary>, RemoteError> {
        let mut out = Vec::new();
        let mut queue = VecDeque::from([root_id.to_string()]);
        while let Some(id) = queue.pop_front() {
            for child in self.list_children(&id).await? {
                queue.push_back(child.page_id.clone());
                out.push(child);
            }
        }
        Ok(out)
    }

    /// Create a page under `parent_id`; returns it as stored (version 1).
    async fn create(
        &self,
        parent_id: &str,
        title: &str,
        body: &str,
    ) -> Result<RemotePage, RemoteError>;

    /// Replace a page body. Rejected with `VersionConflict` unless the remote
    /// is still at `base_version`. Returns the new version.
    async fn update(
        &self,
        page_id: &str,
        title: &str,
        body: &str,
        base_version: u64,
    ) -> Result<u64, RemoteError>;

    /// Reparent a page without touching its body.
    async fn move_page(&self, page_id: &str, new_parent_id: &str) -> Result<(), RemoteError>;

    /// Move a page to the recoverable trash.
    async fn trash(&self, page_id: &str) -> Result<(), RemoteError>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for std::sync::Arc<T> {
    async fn fetch(&self, page_id: &str) -> Result<RemotePage, RemoteError> {
        (**self).fetch(page_id).await
    }

    async fn list_children(&self, page_id: &str) -> Result<Vec<PageSummary>, RemoteError> {
        (**self).list_children(page_id).await
    }

    async fn list_tree(&self, root_id: &str) -> Result<Vec<PageSummary>, RemoteError> {
        (**self).list_tree(root_id).await
    }

    async fn create(
        &self,
        parent_id: &str,
        title: &str,
        body: &str,
    ) -> Result<RemotePage, RemoteError> {
        (**self).create(parent_id, title, body).await
    }

    async fn update(
        &self,
        page_id: &str,
        title: &str,
        body: &str,
        base_version: u64,
    ) -> Result<u64, RemoteError> {
        (**self).update(page_id, title, body, base_version).await
    }

    async fn move_page(&self, page_id: &str, new_parent_id: &str) -> Result<(), RemoteError> {
        (**self).move_page(page_id, new_parent_id).await
    }

    async fn trash(&self, page_id: &str) -> Result<(), RemoteError> {
        (**self).trash(page_id).await
    }
}
