//! Retry execution for remote calls
//!
//! The [`RetryExecutor`] wraps one remote operation with two independent
//! policies:
//!
//! - **Auth retry** (the default path for every call): on a 401, refresh
//!   credentials once and re-issue the same operation exactly once.
//! - **Conflict retry** (mutations that race provider-side state changes): on
//!   a 409 whose body names a known transient cause, back off exponentially
//!   and re-issue, up to a bounded number of attempts.
//!
//! A 409 whose body matches none of the keywords is a genuine conflict (a
//! stale plan, a duplicate name) and is returned immediately.
//!
//! ## Keyword vocabulary
//!
//! The retryable phrases are matched against free text. Provider wording
//! changes silently turn a retryable conflict into a final error; there is no
//! structured error code to match on instead.

use crate::config::RetryConfig;
use crate::context::OperationContext;
use crate::error::{ApiError, Error, Result};
use crate::traits::CredentialRefresher;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Phrases in a 409 body that mark the conflict as transient
pub const DEFAULT_CONFLICT_KEYWORDS: &[&str] = &[
    "resource is locked",
    "operation in progress",
    "concurrent modification",
    "temporarily unavailable",
    "immutable",
    "cannot modify",
];

/// Initial backoff interval for conflict retry
pub const DEFAULT_BASE_INTERVAL: Duration = Duration::from_secs(1);

/// Backoff growth factor applied after each retry
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Maximum invocations for conflict retry
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

type Retryable = Arc<dyn Fn(&ApiError) -> bool + Send + Sync>;

/// Backoff parameters plus a retryability test
#[derive(Clone)]
pub struct RetryPolicy {
    /// Wait before the first retry
    pub base_interval: Duration,
    /// Factor applied to the wait after each retry
    pub multiplier: f64,
    /// Maximum invocations, or `None` to rely on the context deadline alone
    pub max_attempts: Option<u32>,
    retryable: Retryable,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("base_interval", &self.base_interval)
            .field("multiplier", &self.multiplier)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Create a policy with an arbitrary retryability test
    pub fn new<P>(base_interval: Duration, multiplier: f64, max_attempts: Option<u32>, retryable: P) -> Self
    where
        P: Fn(&ApiError) -> bool + Send + Sync + 'static,
    {
        Self {
            base_interval,
            multiplier,
            max_attempts,
            retryable: Arc::new(retryable),
        }
    }

    /// Conflict retry with the default keyword vocabulary: 1s, doubling, 10 attempts
    pub fn conflict() -> Self {
        Self::conflict_with_keywords(
            DEFAULT_CONFLICT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            Some(DEFAULT_MAX_ATTEMPTS),
            DEFAULT_BASE_INTERVAL,
        )
    }

    /// Conflict retry matching `keywords` (case-insensitive) in 409 bodies
    ///
    /// Blank keywords are dropped; they would match every body.
    pub fn conflict_with_keywords(
        keywords: Vec<String>,
        max_attempts: Option<u32>,
        base_interval: Duration,
    ) -> Self {
        let keywords: Vec<String> = keywords
            .into_iter()
            .filter(|k| !k.trim().is_empty())
            .map(|k| k.to_lowercase())
            .collect();
        Self::new(base_interval, DEFAULT_MULTIPLIER, max_attempts, move |err| {
            is_retryable_conflict(err, &keywords)
        })
    }

    /// Retry 429/503 load-shedding responses with the default backoff shape
    pub fn throttling() -> Self {
        Self::new(
            DEFAULT_BASE_INTERVAL,
            DEFAULT_MULTIPLIER,
            Some(DEFAULT_MAX_ATTEMPTS),
            ApiError::is_throttled,
        )
    }

    /// Conflict retry built from configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        let mut policy = Self::conflict_with_keywords(
            config.conflict_keywords.clone(),
            config.max_attempts,
            config.base_interval(),
        );
        policy.multiplier = config.multiplier;
        policy
    }

    /// Throttling retry using the configured backoff shape and attempt budget
    pub fn throttling_from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.base_interval(),
            config.multiplier,
            config.max_attempts,
            ApiError::is_throttled,
        )
    }

    /// Override the attempt budget
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Override the initial backoff interval
    pub fn with_base_interval(mut self, base_interval: Duration) -> Self {
        self.base_interval = base_interval;
        self
    }

    /// Check if a failure should be retried under this policy
    pub fn is_retryable(&self, err: &ApiError) -> bool {
        (self.retryable)(err)
    }

    /// Wait before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(i32::try_from(retry).unwrap_or(i32::MAX));
        Duration::try_from_secs_f64(self.base_interval.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::conflict()
    }
}

/// Check if a failure is a 409 whose body names a known transient cause
///
/// `keywords` must already be lower-case. Reads the buffered body, which stays
/// readable for error formatting afterwards.
pub fn is_retryable_conflict(err: &ApiError, keywords: &[String]) -> bool {
    if !err.is_conflict() {
        return false;
    }

    let body = err.body().as_str().to_lowercase();
    keywords
        .iter()
        .filter(|k| !k.trim().is_empty())
        .any(|k| body.contains(k.as_str()))
}

fn as_millis_saturating(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

/// Failure of one auth-retried invocation
enum AttemptError {
    /// Remote failure eligible for the outer policy
    Api(ApiError),
    /// Authentication, cancellation or deadline; never retried
    Fatal(Error),
}

/// Executes remote operations under the auth and conflict retry policies
///
/// Cheap to clone; safe to share across concurrently running controllers.
#[derive(Clone, Default)]
pub struct RetryExecutor {
    refresher: Option<Arc<dyn CredentialRefresher>>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("refresher", &self.refresher.is_some())
            .finish()
    }
}

impl RetryExecutor {
    /// Create an executor that refreshes credentials with `refresher`
    pub fn new(refresher: Arc<dyn CredentialRefresher>) -> Self {
        Self {
            refresher: Some(refresher),
        }
    }

    /// Create an executor with no way to refresh; a 401 is final
    pub fn without_refresh() -> Self {
        Self::default()
    }

    /// Run `op`, refreshing credentials and retrying once on 401
    ///
    /// # Returns
    ///
    /// - `Ok(T)`: The operation succeeded, possibly after one refresh
    /// - `Err(Error::Authentication)`: Refresh failed or the retry was still 401
    /// - `Err(Error::Api)`: Any other remote failure, unchanged
    /// - `Err(Error::Cancelled)` / `Err(Error::DeadlineExceeded)`: The
    ///   context was interrupted during the call
    pub async fn execute_with_auth_retry<T, F, Fut>(
        &self,
        ctx: &OperationContext,
        operation: &str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        match self.attempt(ctx, operation, &mut op).await {
            Ok(value) => Ok(value),
            Err(AttemptError::Api(e)) => Err(Error::Api(e)),
            Err(AttemptError::Fatal(e)) => Err(e),
        }
    }

    /// Run `op` under `policy`, backing off between retryable failures
    ///
    /// Each invocation itself goes through the auth-retry path. The wait
    /// before retry `n` is `base_interval * multiplier^n`.
    ///
    /// # Returns
    ///
    /// - `Ok(T)`: The operation succeeded
    /// - `Err(Error::Api)`: A failure the policy does not retry, after one call
    /// - `Err(Error::RetryExhausted)`: `max_attempts` invocations all failed
    ///   with retryable errors
    /// - `Err(Error::Cancelled)` / `Err(Error::DeadlineExceeded)`: The
    ///   context was interrupted, including mid-backoff
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        ctx: &OperationContext,
        operation: &str,
        policy: &RetryPolicy,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let err = match self.attempt(ctx, operation, &mut op).await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(operation, attempts, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Api(e)) if !policy.is_retryable(&e) => return Err(Error::Api(e)),
                Err(AttemptError::Api(e)) => e,
            };

            if policy.exhausted(attempts) {
                warn!(operation, attempts, error = %err, "Giving up after retryable failures");
                return Err(Error::RetryExhausted {
                    operation: operation.to_string(),
                    attempts,
                    last: err,
                });
            }

            let delay = policy.delay_for(attempts - 1);
            warn!(
                operation,
                attempt = attempts,
                delay_ms = as_millis_saturating(delay),
                error = %err,
                "Retryable failure, backing off"
            );

            ctx.sleep(delay)
                .await
                .map_err(|i| i.into_error(operation))?;
        }
    }

    /// Run `op` under the default conflict policy with custom parameters
    pub async fn execute_with_conflict_retry<T, F, Fut>(
        &self,
        ctx: &OperationContext,
        operation: &str,
        keywords: &[&str],
        max_attempts: Option<u32>,
        base_interval: Duration,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        let policy = RetryPolicy::conflict_with_keywords(
            keywords.iter().map(|k| k.to_string()).collect(),
            max_attempts,
            base_interval,
        );
        self.execute_with_retry(ctx, operation, &policy, op).await
    }

    /// One invocation with the auth-refresh retry applied
    async fn attempt<T, F, Fut>(
        &self,
        ctx: &OperationContext,
        operation: &str,
        op: &mut F,
    ) -> std::result::Result<T, AttemptError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        let interrupted = |i: crate::context::Interrupted| AttemptError::Fatal(i.into_error(operation));

        ctx.check().map_err(interrupted)?;
        let err = match ctx.run(op()).await.map_err(interrupted)? {
            Ok(value) => return Ok(value),
            Err(e) if e.is_unauthorized() => e,
            Err(e) => return Err(AttemptError::Api(e)),
        };

        let Some(refresher) = &self.refresher else {
            return Err(AttemptError::Fatal(Error::auth(format!("{operation}: {err}"))));
        };

        warn!(operation, "Credentials rejected, refreshing and retrying once");
        if let Err(e) = ctx.run(refresher.refresh()).await.map_err(interrupted)? {
            return Err(AttemptError::Fatal(Error::auth(format!(
                "{operation}: credential refresh failed: {e}"
            ))));
        }

        match ctx.run(op()).await.map_err(interrupted)? {
            Ok(value) => Ok(value),
            Err(e) if e.is_unauthorized() => Err(AttemptError::Fatal(Error::auth(format!(
                "{operation}: still unauthorized after refresh: {e}"
            )))),
            Err(e) => Err(AttemptError::Api(e)),
        }
    }
}
