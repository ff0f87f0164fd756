//! Deadline and cancellation for a single logical operation
//!
//! Every public operation in this crate takes an [`OperationContext`]. Each
//! suspension point (inter-poll wait, retry backoff, lock wait, network call)
//! races the context, so a deadline or cancellation aborts promptly instead of
//! after the wait elapses.

use crate::error::Error;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a wait was cut short
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// The caller cancelled the operation
    Cancelled,
    /// The operation's deadline elapsed
    DeadlineExceeded,
}

impl Interrupted {
    /// Map to the crate error, naming the operation for deadline failures
    pub fn into_error(self, operation: &str) -> Error {
        match self {
            Interrupted::Cancelled => Error::Cancelled,
            Interrupted::DeadlineExceeded => Error::deadline(operation),
        }
    }
}

/// Deadline plus cancellation signal, scoped to one logical operation
///
/// Cloning shares the cancellation signal. Use [`OperationContext::child`] for
/// a context that can be cancelled without cancelling its parent.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OperationContext {
    /// Create a context with no deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context whose deadline is `timeout` from now
    ///
    /// A timeout too large to represent as an instant means no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::new(),
        }
    }

    /// Create a context with an absolute deadline
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Derive a context with the same deadline whose cancellation does not
    /// propagate to `self`
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancel this context and all of its children
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check if the context has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The cancellation token backing this context
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Absolute deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if any
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Check whether the context is still live without waiting
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.cancel.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Interrupted::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Sleep for `duration`, waking early if the context is interrupted
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.run(tokio::time::sleep(duration)).await
    }

    /// Drive `future` to completion unless the context is interrupted first
    ///
    /// Cancellation wins over the deadline, and both win over a future that
    /// becomes ready in the same poll.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        self.check()?;

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled),
            _ = deadline => Err(Interrupted::DeadlineExceeded),
            output = future => Ok(output),
        }
    }
}
