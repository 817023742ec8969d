//! Patch planning and submission.
//!
//! A push never uploads a locally rendered page. The [`DocumentPatcher`]
//! re-fetches the remote page, plans surgical operations against that fresh
//! document, applies them in memory and submits the result with the fetched
//! version as the optimistic-concurrency base.

pub mod ops;
pub mod planner;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

use crate::conflict::merger::{MergeResult, Merger};
use crate::convert::ContentConverter;
use crate::errors::{PatchError, RemoteError};
use crate::fingerprint::fingerprint;
use crate::remote::RemoteStore;

pub use ops::{apply_operations, replace_whole, InsertPosition, Locator, SurgicalOperation};
pub use planner::{PatchPlan, Planner, DEFAULT_REPLACE_THRESHOLD};

/// Submissions per push: the first, plus one re-fetch-and-recompute after a
/// version conflict.
const MAX_SUBMISSIONS: u32 = 2;

/// Outcome of one submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchResult {
    pub success: bool,
    pub new_version: Option<u64>,
    pub operations_applied: usize,
    pub error: Option<String>,
}

impl PatchResult {
    pub fn applied(new_version: u64, operations_applied: usize) -> Self {
        Self {
            success: true,
            new_version: Some(new_version),
            operations_applied,
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// What a push ended in, short of an error.
#[derive(Debug, Clone)]
pub enum PushOutcome {
    /// The remote now holds `text` at `result.new_version`. Zero operations
    /// means the remote already matched and nothing was submitted.
    Applied { result: PatchResult, text: String },
    /// The remote moved since the desired text was derived and the changes
    /// overlap. Nothing was submitted.
    Conflict {
        merge: MergeResult,
        remote_version: u64,
        remote_text: String,
    },
}

/// One async mutex per page id; holding it is required to submit a patch.
#[derive(Debug, Default)]
pub struct PageLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, page_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(page_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Fetch, plan, apply and submit a page edit.
#[derive(Clone)]
pub struct DocumentPatcher {
    remote: Arc<dyn RemoteStore>,
    converter: Arc<dyn ContentConverter>,
    planner: Planner,
    locks: Arc<PageLocks>,
}

impl DocumentPatcher {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        converter: Arc<dyn ContentConverter>,
        replace_threshold: f64,
        locks: Arc<PageLocks>,
    ) -> Self {
        Self {
            remote,
            converter,
            planner: Planner::new(replace_threshold),
            locks,
        }
    }

    /// Bring the remote page to `desired`.
    ///
    /// `expected` is the remote text `desired` was derived from. If the
    /// fresh remote differs, the two are merged three ways first; a
    /// conflicting merge is returned without touching the remote.
    pub async fn push(
        &self,
        page_id: &str,
        title: &str,
        desired: &str,
        expected: &str,
    ) -> Result<PushOutcome, PatchError> {
        self.submit(page_id, title, desired, Some(expected)).await
    }

    /// Bring the remote page to `desired` whatever it holds now. Opaque
    /// blocks of the remote page are still preserved.
    pub async fn overwrite(
        &self,
        page_id: &str,
        title: &str,
        desired: &str,
    ) -> Result<PushOutcome, PatchError> {
        self.submit(page_id, title, desired, None).await
    }

    #[instrument(skip_all, fields(page_id = %page_id, merge = expected.is_some()))]
    async fn submit(
        &self,
        page_id: &str,
        title: &str,
        desired: &str,
        expected: Option<&str>,
    ) -> Result<PushOutcome, PatchError> {
        let _guard = self.locks.lock(page_id).await;

        let mut desired = desired.to_string();
        let mut expected = expected.map(str::to_string);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let page = self.remote.fetch(page_id).await?;
            let base = self.converter.parse_storage(&page.body)?;
            let fresh = base.to_text();

            if let Some(exp) = expected.as_deref() {
                if fingerprint(&fresh) != fingerprint(exp) {
                    let merge = Merger::three_way_merge(exp, &desired, &fresh);
                    if !merge.is_clean() {
                        info!(
                            remote_version = page.version,
                            "remote changed underneath the push, merge conflicts"
                        );
                        return Ok(PushOutcome::Conflict {
                            merge,
                            remote_version: page.version,
                            remote_text: fresh,
                        });
                    }
                    debug!(remote_version = page.version, "merged fresh remote changes");
                    desired = merge.merged_text;
                    expected = Some(fresh.clone());
                }
            }

            let plan = self.planner.plan(&base, &desired);
            if plan.is_noop() {
                debug!("remote already matches");
                return Ok(PushOutcome::Applied {
                    result: PatchResult::applied(page.version, 0),
                    text: fresh,
                });
            }

            let patched = apply_operations(&base, &plan.operations)?;
            let body = self.converter.render_storage(&patched);
            match self.remote.update(page_id, title, &body, page.version).await {
                Ok(new_version) => {
                    info!(
                        base_version = page.version,
                        new_version,
                        operations = plan.operations.len(),
                        full_replace = plan.is_full_replace(),
                        "patch submitted"
                    );
                    return Ok(PushOutcome::Applied {
                        result: PatchResult::applied(new_version, plan.operations.len()),
                        text: patched.to_text(),
                    });
                }
                Err(RemoteError::VersionConflict { actual, .. }) if attempt < MAX_SUBMISSIONS => {
                    warn!(
                        base_version = page.version,
                        actual = ?actual,
                        "version conflict, re-fetching and recomputing"
                    );
                    if expected.is_some() {
                        expected = Some(fresh);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
