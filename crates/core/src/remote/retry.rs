//! Bounded exponential backoff for remote calls.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{PageSummary, RemotePage, RemoteStore};
use crate::errors::RemoteError;

/// Retry policy as a plain value: attempt cap, backoff schedule and the
/// predicate deciding which errors are worth another attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    retryable: fn(&RemoteError) -> bool,
}

/// Only rate limiting is retried; everything else fails fast.
pub fn rate_limited_only(err: &RemoteError) -> bool {
    matches!(err, RemoteError::RateLimited { .. })
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(500), Duration::from_secs(30), 2.0)
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
            multiplier,
            retryable: rate_limited_only,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, 1.0)
    }

    pub fn with_retryable(mut self, retryable: fn(&RemoteError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_retryable(&self, err: &RemoteError) -> bool {
        (self.retryable)(err)
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * exp;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, or the
    /// attempt cap is reached.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if !self.is_retryable(&err) => return Err(err),
                Err(err) if attempt >= self.max_attempts => {
                    warn!(operation, attempts = attempt, error = %err, "retry budget exhausted");
                    return Err(RemoteError::RetriesExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }
                Err(err) => {
                    let mut delay = self.delay_for(attempt);
                    if let RemoteError::RateLimited {
                        retry_after: Some(after),
                    } = &err
                    {
                        delay = (*after).min(self.max_backoff).max(delay);
                    }
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying remote call"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// A [`RemoteStore`] that routes every call through a [`RetryPolicy`].
pub struct RetryingRemote<R> {
    inner: R,
    policy: RetryPolicy,
}

impl<R: RemoteStore> RetryingRemote<R> {
    pub fn new(inner: R, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<R: RemoteStore> RemoteStore for RetryingRemote<R> {
    async fn fetch(&self, page_id: &str) -> Result<RemotePage, RemoteError> {
        self.policy
            .run("fetch", || self.inner.fetch(page_id))
            .await
    }

    async fn list_children(&self, page_id: &str) -> Result<Vec<PageSummary>, RemoteError> {
        self.policy
            .run("list_children", || self.inner.list_children(page_id))
            .await
    }

    async fn create(
        &self,
        parent_id: &str,
        title: &str,
        body: &str,
    ) -> Result<RemotePage, RemoteError> {
        self.policy
            .run("create", || self.inner.create(parent_id, title, body))
            .await
    }

    async fn update(
        &self,
        page_id: &str,
        title: &str,
        body: &str,
        base_version: u64,
    ) -> Result<u64, RemoteError> {
        self.policy
            .run("update", || self.inner.update(page_id, title, body, base_version))
            .await
    }

    async fn move_page(&self, page_id: &str, new_parent_id: &str) -> Result<(), RemoteError> {
        self.policy
            .run("move_page", || self.inner.move_page(page_id, new_parent_id))
            .await
    }

    async fn trash(&self, page_id: &str) -> Result<(), RemoteError> {
        self.policy
            .run("trash", || self.inner.trash(page_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(100), Duration::from_millis(350), 2.0)
    }

    #[test]
    fn test_backoff_schedule_is_capped() {
        let p = policy();
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(350));
        assert_eq!(p.delay_for(10), Duration::from_millis(350));
    }

    #[test]
    fn test_only_rate_limit_is_retryable_by_default() {
        let p = policy();
        assert!(p.is_retryable(&RemoteError::RateLimited { retry_after: None }));
        assert!(!p.is_retryable(&RemoteError::Unreachable("down".into())));
        assert!(!p.is_retryable(&RemoteError::NotFound {
            page_id: "1".into()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = policy()
            .run("fetch", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RemoteError::RateLimited { retry_after: None })
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_reported() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy()
            .run("update", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::RateLimited {
                    retry_after: Some(Duration::from_secs(1)),
                })
            })
            .await;
        match result {
            Err(RemoteError::RetriesExhausted {
                operation,
                attempts,
                ..
            }) => {
                assert_eq!(operation, "update");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_fail_fast() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy()
            .run("fetch", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::Unauthorized("bad token".into()))
            })
            .await;
        assert!(matches!(result, Err(RemoteError::Unauthorized(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
