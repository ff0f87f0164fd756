// # lbaas-core
//
// Convergence and concurrency-control core for load-balancer APIs whose
// control plane is asynchronous and eventually consistent.
//
// ## Architecture Overview
//
// A mutation against the load-balancing API returns immediately with a
// `PENDING_*` status. Callers must observe the resource until it settles
// before treating the operation as complete, and mutations touching the same
// parent load balancer must not interleave.
//
// - **KeyedMutexRegistry**: Per-resource exclusive locks, created lazily
// - **RetryExecutor**: Auth-refresh retry and conflict (409) retry with backoff
// - **poll_until_status**: Poll a resource until its status is terminal
// - **poll_until_deleted**: Poll a resource until the API reports it gone
// - **ConvergenceEngine**: Lock → mutate → converge → release, for controllers
//
// ## Control Flow
//
// ```text
// controller ──► registry.acquire(parent) ──► executor (mutation)
//                                                  │
//                                                  ▼
//                     release ◄── poll_until_status / poll_until_deleted
// ```
//
// Every remote call, including each fetch made while polling, goes through
// the `RetryExecutor`. Every wait races the caller's `OperationContext`.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod poll;
pub mod registry;
pub mod retry;
pub mod status;
pub mod traits;

// Re-export core types for convenience
pub use config::{ConvergenceConfig, OperationKind, PollConfig, RetryConfig, TimeoutConfig};
pub use context::{Interrupted, OperationContext};
pub use engine::{ConvergeRequest, ConvergenceEngine, DeleteRequest, EngineEvent, RetryMode};
pub use error::{ApiError, Error, ResponseBody, Result};
pub use poll::{StatusSnapshot, poll_until_deleted, poll_until_status};
pub use registry::KeyedMutexRegistry;
pub use retry::{RetryExecutor, RetryPolicy};
pub use status::{ProvisioningStatus, ResourceId, ResourceRef, TerminalStatusSet};
pub use traits::{CredentialRefresher, ResourceApi};
