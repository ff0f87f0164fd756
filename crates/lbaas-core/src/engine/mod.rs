//! Convergence engine
//!
//! The ConvergenceEngine is the entry point resource controllers call. It is
//! responsible for:
//! - Serializing mutations per parent resource via the KeyedMutexRegistry
//! - Issuing the mutation through the RetryExecutor
//! - Driving the changed resource to a terminal status (or to absence)
//! - Rejecting terminal statuses other than `ACTIVE`
//! - Emitting events for monitoring/logging
//!
//! ## Architecture
//!
//! ```text
//!                 ┌────────────────────┐
//! controller ───► │ ConvergenceEngine  │ ─── EngineEvent ──► receiver
//!                 └────────────────────┘
//!                           │
//!         ┌─────────────────┼──────────────────────┐
//!         ▼                 ▼                      ▼
//! ┌───────────────┐ ┌───────────────┐ ┌──────────────────────┐
//! │ KeyedMutex    │ │ RetryExecutor │ │ poll_until_status /  │
//! │ Registry      │ │ (mutation)    │ │ poll_until_deleted   │
//! └───────────────┘ └───────────────┘ └──────────────────────┘
//! ```
//!
//! ## Operation Flow
//!
//! 1. Acquire the parent's lock (cancellable)
//! 2. Run the mutation; it returns the id of the changing resource
//! 3. Poll that id to `{ACTIVE, ERROR}`, or until it is gone for deletes
//! 4. Require `ACTIVE`
//! 5. Release the lock when the guard drops, on every exit path

use crate::config::{ConvergenceConfig, PollConfig};
use crate::context::OperationContext;
use crate::error::{ApiError, Error, Result};
use crate::poll::{poll_until_deleted, poll_until_status};
use crate::registry::{self, KeyedMutexRegistry};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::status::{ProvisioningStatus, ResourceId, ResourceRef, TerminalStatusSet, ensure_status};
use crate::traits::ResourceApi;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Events emitted by the ConvergenceEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Parent lock acquired
    LockAcquired {
        parent: ResourceId,
    },

    /// Mutation accepted by the API; convergence begins
    MutationAccepted {
        action: String,
        resource: ResourceRef,
    },

    /// Resource reached `ACTIVE`
    Converged {
        action: String,
        resource: ResourceRef,
    },

    /// Resource no longer exists
    Deleted {
        resource: ResourceRef,
    },

    /// Operation failed
    Failed {
        action: String,
        resource_type: String,
        error: String,
    },
}

/// Which retry policy wraps the mutation call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryMode {
    /// Auth-refresh retry only
    #[default]
    AuthOnly,
    /// Conflict retry with the engine's configured policy
    Conflict,
    /// Retry 429/503 load-shedding with the engine's configured backoff
    Throttling,
}

/// A create or update to converge
#[derive(Debug, Clone)]
pub struct ConvergeRequest {
    /// Action name for diagnostics (e.g., "create", "update")
    pub action: String,
    /// Parent resource whose lock serializes the sequence
    pub parent: ResourceId,
    /// Type of the resource being changed
    pub resource_type: String,
    /// Retry policy for the mutation call
    pub retry: RetryMode,
}

impl ConvergeRequest {
    /// Create a request using auth-only retry
    pub fn new(action: impl Into<String>, parent: impl Into<ResourceId>, resource_type: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            parent: parent.into(),
            resource_type: resource_type.into(),
            retry: RetryMode::AuthOnly,
        }
    }

    /// Set the retry policy for the mutation call
    pub fn with_retry(mut self, retry: RetryMode) -> Self {
        self.retry = retry;
        self
    }
}

/// A deletion to wait out
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    /// Parent resource whose lock serializes the sequence
    pub parent: ResourceId,
    /// Resource being deleted
    pub resource: ResourceRef,
    /// Retry policy for the delete call
    pub retry: RetryMode,
}

impl DeleteRequest {
    /// Create a request using auth-only retry
    pub fn new(parent: impl Into<ResourceId>, resource: ResourceRef) -> Self {
        Self {
            parent: parent.into(),
            resource,
            retry: RetryMode::AuthOnly,
        }
    }

    /// Set the retry policy for the delete call
    pub fn with_retry(mut self, retry: RetryMode) -> Self {
        self.retry = retry;
        self
    }
}

/// Convergence engine shared by resource controllers
///
/// Cheap to clone; clones share the lock registry, executor and event
/// channel, and are safe to use from concurrently running tasks.
///
/// ## Lifecycle
///
/// 1. Create with [`ConvergenceEngine::new()`]
/// 2. Call [`converge`](Self::converge) / [`delete`](Self::delete) /
///    [`read`](Self::read) with one fresh context per logical operation
/// 3. Drain the event receiver (or drop it; events are then discarded)
#[derive(Debug, Clone)]
pub struct ConvergenceEngine {
    /// Per-parent locks
    registry: Arc<KeyedMutexRegistry>,

    /// Executor for every remote call
    executor: RetryExecutor,

    /// Policy applied when a request asks for conflict retry
    conflict_policy: RetryPolicy,

    /// Policy applied when a request asks for throttling retry
    throttling_policy: RetryPolicy,

    /// Polling intervals
    poll: PollConfig,

    /// Event sender for external monitoring
    event_tx: mpsc::Sender<EngineEvent>,
}

impl ConvergenceEngine {
    /// Create a new engine backed by the process-wide lock registry
    ///
    /// # Returns
    ///
    /// A tuple of (engine, event_receiver) where event_receiver yields engine events
    pub fn new(
        executor: RetryExecutor,
        config: &ConvergenceConfig,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        Self::with_registry(executor, config, registry::global())
    }

    /// Create a new engine backed by a specific lock registry
    pub fn with_registry(
        executor: RetryExecutor,
        config: &ConvergenceConfig,
        registry: Arc<KeyedMutexRegistry>,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.event_channel_capacity);

        let engine = Self {
            registry,
            executor,
            conflict_policy: RetryPolicy::from_config(&config.retry),
            throttling_policy: RetryPolicy::throttling_from_config(&config.retry),
            poll: config.poll.clone(),
            event_tx: tx,
        };

        Ok((engine, rx))
    }

    /// The executor used for every remote call
    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    /// The lock registry serializing mutations
    pub fn registry(&self) -> &Arc<KeyedMutexRegistry> {
        &self.registry
    }

    /// Run a mutation under the parent's lock and converge the result to `ACTIVE`
    ///
    /// # Parameters
    ///
    /// - `mutate`: Issues the create/update; returns the id to poll
    /// - `fetch`: Fetches the changing resource by id
    /// - `extract_status`: Reads the status out of a fetched representation
    ///
    /// # Returns
    ///
    /// - `Ok(T)`: The converged representation, with status `ACTIVE`
    /// - `Err(Error::UnexpectedStatus)`: The resource settled in `ERROR`
    /// - `Err(Error)`: Any retry, polling, or cancellation failure
    pub async fn converge<T, M, MFut, F, FFut, S>(
        &self,
        ctx: &OperationContext,
        request: &ConvergeRequest,
        mutate: M,
        mut fetch: F,
        extract_status: S,
    ) -> Result<T>
    where
        M: FnMut() -> MFut,
        MFut: Future<Output = std::result::Result<ResourceId, ApiError>>,
        F: FnMut(&ResourceId) -> FFut,
        FFut: Future<Output = std::result::Result<T, ApiError>>,
        S: Fn(&T) -> String,
    {
        let result: Result<T> = async {
            let _guard = self.registry.acquire(ctx, &request.parent).await?;
            self.emit_event(EngineEvent::LockAcquired {
                parent: request.parent.clone(),
            });

            let operation = format!("{} {}", request.action, request.resource_type);
            let id = self.mutate(ctx, &operation, request.retry, mutate).await?;
            let resource = ResourceRef::new(request.resource_type.clone(), id.clone());

            info!(action = %request.action, resource = %resource, "Mutation accepted, waiting for convergence");
            self.emit_event(EngineEvent::MutationAccepted {
                action: request.action.clone(),
                resource: resource.clone(),
            });

            let converged = poll_until_status(
                ctx,
                &self.executor,
                &resource,
                self.poll.interval(),
                &TerminalStatusSet::active_or_error(),
                || fetch(&id),
                &extract_status,
            )
            .await?;

            ensure_status(&resource, &extract_status(&converged), ProvisioningStatus::Active)?;

            self.emit_event(EngineEvent::Converged {
                action: request.action.clone(),
                resource,
            });
            Ok(converged)
        }
        .await;

        if let Err(ref e) = result {
            self.report_failure(&request.action, &request.resource_type, e);
        }
        result
    }

    /// Delete a resource under the parent's lock and wait until it is gone
    ///
    /// A 404 from the delete call means the resource is already gone and
    /// counts as success.
    pub async fn delete<T, D, DFut, F, FFut>(
        &self,
        ctx: &OperationContext,
        request: &DeleteRequest,
        delete: D,
        fetch: F,
    ) -> Result<()>
    where
        D: FnMut() -> DFut,
        DFut: Future<Output = std::result::Result<(), ApiError>>,
        F: FnMut() -> FFut,
        FFut: Future<Output = std::result::Result<T, ApiError>>,
    {
        let resource = &request.resource;

        let result: Result<()> = async {
            let _guard = self.registry.acquire(ctx, &request.parent).await?;
            self.emit_event(EngineEvent::LockAcquired {
                parent: request.parent.clone(),
            });

            let operation = format!("delete {resource}");
            match self.mutate(ctx, &operation, request.retry, delete).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(resource = %resource, "Resource already gone");
                    self.emit_event(EngineEvent::Deleted {
                        resource: resource.clone(),
                    });
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            self.emit_event(EngineEvent::MutationAccepted {
                action: "delete".to_string(),
                resource: resource.clone(),
            });

            poll_until_deleted(ctx, &self.executor, resource, self.poll.delete_interval(), fetch).await?;

            self.emit_event(EngineEvent::Deleted {
                resource: resource.clone(),
            });
            Ok(())
        }
        .await;

        if let Err(ref e) = result {
            self.report_failure("delete", &resource.resource_type, e);
        }
        result
    }

    /// Fetch a resource once, without locking
    ///
    /// # Returns
    ///
    /// - `Ok(Some(T))`: The current representation
    /// - `Ok(None)`: The API reported the resource as not found
    pub async fn read<T, F, FFut>(
        &self,
        ctx: &OperationContext,
        resource: &ResourceRef,
        fetch: F,
    ) -> Result<Option<T>>
    where
        F: FnMut() -> FFut,
        FFut: Future<Output = std::result::Result<T, ApiError>>,
    {
        let operation = format!("read {resource}");
        match self.executor.execute_with_auth_retry(ctx, &operation, fetch).await {
            Ok(r) => Ok(Some(r)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Poll an existing resource to `{ACTIVE, ERROR}` and require `ACTIVE`
    pub async fn wait_active<A: ResourceApi>(
        &self,
        ctx: &OperationContext,
        api: &A,
        id: &ResourceId,
    ) -> Result<A::Resource> {
        let resource = ResourceRef::new(api.resource_type(), id.clone());

        let converged = poll_until_status(
            ctx,
            &self.executor,
            &resource,
            self.poll.interval(),
            &TerminalStatusSet::active_or_error(),
            || api.fetch(id),
            |r| api.status_of(r),
        )
        .await?;

        ensure_status(&resource, &api.status_of(&converged), ProvisioningStatus::Active)?;
        Ok(converged)
    }

    /// Poll an existing resource until the API reports it gone
    pub async fn wait_deleted<A: ResourceApi>(
        &self,
        ctx: &OperationContext,
        api: &A,
        id: &ResourceId,
    ) -> Result<()> {
        let resource = ResourceRef::new(api.resource_type(), id.clone());
        poll_until_deleted(ctx, &self.executor, &resource, self.poll.delete_interval(), || api.fetch(id)).await
    }

    /// Delete `id` under `parent`'s lock and wait until it is gone
    pub async fn delete_resource<A: ResourceApi>(
        &self,
        ctx: &OperationContext,
        api: &A,
        parent: &ResourceId,
        id: &ResourceId,
        retry: RetryMode,
    ) -> Result<()> {
        let request = DeleteRequest::new(parent.clone(), ResourceRef::new(api.resource_type(), id.clone()))
            .with_retry(retry);

        self.delete(ctx, &request, || api.delete(id), || api.fetch(id)).await
    }

    /// Run a mutation call under the requested retry policy
    async fn mutate<T, M, Fut>(
        &self,
        ctx: &OperationContext,
        operation: &str,
        mode: RetryMode,
        mutate: M,
    ) -> Result<T>
    where
        M: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        match mode {
            RetryMode::AuthOnly => self.executor.execute_with_auth_retry(ctx, operation, mutate).await,
            RetryMode::Conflict => {
                self.executor
                    .execute_with_retry(ctx, operation, &self.conflict_policy, mutate)
                    .await
            }
            RetryMode::Throttling => {
                self.executor
                    .execute_with_retry(ctx, operation, &self.throttling_policy, mutate)
                    .await
            }
        }
    }

    /// Log a failure and emit the failure event
    fn report_failure(&self, action: &str, resource_type: &str, err: &Error) {
        error!(action, resource_type, error = %err, "Operation failed");
        self.emit_event(EngineEvent::Failed {
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            error: err.to_string(),
        });
    }

    /// Emit an engine event
    ///
    /// # Parameters
    ///
    /// - `event`: The event to emit
    fn emit_event(&self, event: EngineEvent) {
        // Full channel or dropped receiver: the event is discarded
        if let Err(e) = self.event_tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!("Event receiver dropped, discarding event");
                }
            }
        }
    }
}
