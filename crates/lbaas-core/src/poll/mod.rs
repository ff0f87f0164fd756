//! Convergence polling
//!
//! - [`poll_until_status`]: Fetch until the extracted status is terminal
//! - [`poll_until_deleted`]: Fetch until the API reports the resource gone
//!
//! ## State Machine
//!
//! ```text
//!            ┌──── non-terminal fetch, wait(interval) ────┐
//!            ▼                                            │
//!        Polling ─────────────────────────────────────────┘
//!            │
//!            ├──► Terminal(resource)   status ∈ terminal set
//!            ├──► FetchError(cause)    fetch failed, not a 404
//!            ├──► Timeout              deadline elapsed
//!            └──► Cancelled            caller cancelled
//! ```
//!
//! Every fetch runs through [`RetryExecutor::execute_with_auth_retry`], so a
//! token expiring mid-poll does not abort convergence. Polling never judges a
//! terminal status: `ERROR` is returned like `ACTIVE`, and the caller decides.

use crate::context::{Interrupted, OperationContext};
use crate::error::{ApiError, Error, Result};
use crate::retry::RetryExecutor;
use crate::status::{ProvisioningStatus, ResourceRef, TerminalStatusSet};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of one fetch while polling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusSnapshot<T> {
    /// The resource exists with the given status
    Present {
        /// Fetched representation
        resource: T,
        /// Extracted status
        status: String,
    },
    /// The API reported the resource as not found
    Absent,
}

/// Poll `fetch` until the extracted status is in `terminal`
///
/// Fetches immediately, then waits `interval` between fetches. A 404 is read
/// as "not yet visible" and polled again.
///
/// # Returns
///
/// - `Ok(T)`: The last representation, whose status is in `terminal`
/// - `Err(Error::PollTimeout)`: The deadline elapsed first
/// - `Err(Error::PollFetch)`: A fetch failed with anything other than 404
/// - `Err(Error::Cancelled)`: The caller cancelled the context
pub async fn poll_until_status<T, F, Fut, S>(
    ctx: &OperationContext,
    executor: &RetryExecutor,
    resource: &ResourceRef,
    interval: Duration,
    terminal: &TerminalStatusSet,
    mut fetch: F,
    extract_status: S,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ApiError>>,
    S: Fn(&T) -> String,
{
    let mut fetches: u32 = 0;

    loop {
        fetches += 1;

        let snapshot = match fetch_once(ctx, executor, resource, &mut fetch).await {
            Ok(Some(r)) => {
                let status = extract_status(&r);
                StatusSnapshot::Present { resource: r, status }
            }
            Ok(None) => StatusSnapshot::Absent,
            Err(e) => return Err(polling_error(e, resource, terminal)),
        };

        match snapshot {
            StatusSnapshot::Present { resource: r, status } if terminal.contains(&status) => {
                info!(
                    resource_type = %resource.resource_type,
                    id = %resource.id,
                    status = %status,
                    fetches,
                    "Resource reached terminal status"
                );
                return Ok(r);
            }
            StatusSnapshot::Present { status, .. } => {
                debug!(
                    resource_type = %resource.resource_type,
                    id = %resource.id,
                    status = %status,
                    targets = %terminal,
                    "Waiting for terminal status"
                );
            }
            StatusSnapshot::Absent => {
                debug!(
                    resource_type = %resource.resource_type,
                    id = %resource.id,
                    "Resource not visible yet"
                );
            }
        }

        ctx.sleep(interval)
            .await
            .map_err(|i| interrupted(i, resource, terminal))?;
    }
}

/// Poll `fetch` until it reports the resource as not found
///
/// A fetch that still finds the resource, in any status, causes another wait.
///
/// # Returns
///
/// - `Ok(())`: The API reported 404
/// - `Err(Error::PollTimeout)`: The deadline elapsed first
/// - `Err(Error::PollFetch)`: A fetch failed with anything other than 404
/// - `Err(Error::Cancelled)`: The caller cancelled the context
pub async fn poll_until_deleted<T, F, Fut>(
    ctx: &OperationContext,
    executor: &RetryExecutor,
    resource: &ResourceRef,
    interval: Duration,
    mut fetch: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ApiError>>,
{
    let gone = TerminalStatusSet::from(ProvisioningStatus::Deleted);
    let mut fetches: u32 = 0;

    loop {
        fetches += 1;

        match fetch_once(ctx, executor, resource, &mut fetch).await {
            Ok(None) => {
                info!(
                    resource_type = %resource.resource_type,
                    id = %resource.id,
                    fetches,
                    "Resource deleted"
                );
                return Ok(());
            }
            Ok(Some(_)) => {
                debug!(
                    resource_type = %resource.resource_type,
                    id = %resource.id,
                    "Resource still present, waiting for deletion"
                );
            }
            Err(e) => return Err(polling_error(e, resource, &gone)),
        }

        ctx.sleep(interval)
            .await
            .map_err(|i| interrupted(i, resource, &gone))?;
    }
}

/// One auth-retried fetch; `Ok(None)` when the API answered 404
async fn fetch_once<T, F, Fut>(
    ctx: &OperationContext,
    executor: &RetryExecutor,
    resource: &ResourceRef,
    fetch: &mut F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ApiError>>,
{
    let operation = format!("fetch {resource}");
    match executor.execute_with_auth_retry(ctx, &operation, fetch).await {
        Ok(r) => Ok(Some(r)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn interrupted(i: Interrupted, resource: &ResourceRef, targets: &TerminalStatusSet) -> Error {
    match i {
        Interrupted::Cancelled => Error::Cancelled,
        Interrupted::DeadlineExceeded => Error::PollTimeout {
            resource: resource.clone(),
            targets: targets.clone(),
        },
    }
}

fn polling_error(err: Error, resource: &ResourceRef, targets: &TerminalStatusSet) -> Error {
    match err {
        Error::Cancelled => interrupted(Interrupted::Cancelled, resource, targets),
        Error::DeadlineExceeded { .. } => interrupted(Interrupted::DeadlineExceeded, resource, targets),
        other => Error::PollFetch {
            resource: resource.clone(),
            source: Box::new(other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_polled_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let resource = ResourceRef::new("listener", "l-1");

        let status = poll_until_status(
            &OperationContext::with_timeout(Duration::from_secs(60)),
            &RetryExecutor::without_refresh(),
            &resource,
            Duration::from_secs(1),
            &TerminalStatusSet::active_or_error(),
            || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ApiError::from_status(404, "not found"))
                    } else {
                        Ok("ACTIVE".to_string())
                    }
                }
            },
            |s: &String| s.clone(),
        )
        .await
        .unwrap();

        assert_eq!(status, "ACTIVE");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_status_is_terminal_without_judgment() {
        let resource = ResourceRef::new("load balancer", "lb-1");

        let status = poll_until_status(
            &OperationContext::new(),
            &RetryExecutor::without_refresh(),
            &resource,
            Duration::from_secs(1),
            &TerminalStatusSet::active_or_error(),
            || async { Ok::<_, ApiError>("ERROR".to_string()) },
            |s: &String| s.clone(),
        )
        .await;

        assert_eq!(status.unwrap(), "ERROR");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletion_fetch_error_is_fatal() {
        let resource = ResourceRef::new("target group", "pool-1");

        let result = poll_until_deleted(
            &OperationContext::new(),
            &RetryExecutor::without_refresh(),
            &resource,
            Duration::from_secs(1),
            || async { Err::<(), _>(ApiError::from_status(500, "internal error")) },
        )
        .await;

        match result {
            Err(Error::PollFetch { resource: r, source }) => {
                assert_eq!(r, resource);
                assert_eq!(source.api_error().and_then(ApiError::status), Some(500));
            }
            other => panic!("expected PollFetch, got {other:?}"),
        }
    }
}
