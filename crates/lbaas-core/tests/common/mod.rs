//! Test doubles and common utilities for convergence contract tests
//!
//! Remote calls are replaced by scripts: each invocation returns the next
//! scripted response, and the last response repeats once the script runs out.

#![allow(dead_code)]

use lbaas_core::error::{ApiError, Result};
use lbaas_core::status::ResourceId;
use lbaas_core::traits::{CredentialRefresher, ResourceApi};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A sequence of remote responses, consumed one per call
pub struct Script<T> {
    steps: Vec<std::result::Result<T, ApiError>>,
    calls: AtomicUsize,
}

impl<T: Clone> Script<T> {
    /// Create a script; must contain at least one step
    pub fn new(steps: Vec<std::result::Result<T, ApiError>>) -> Arc<Self> {
        assert!(!steps.is_empty(), "script needs at least one step");
        Arc::new(Self {
            steps,
            calls: AtomicUsize::new(0),
        })
    }

    /// A script that returns the same response forever
    pub fn always(step: std::result::Result<T, ApiError>) -> Arc<Self> {
        Self::new(vec![step])
    }

    /// Record a call and return its scripted response
    pub fn next(&self) -> std::result::Result<T, ApiError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.steps[n.min(self.steps.len() - 1)].clone()
    }

    /// Number of calls made so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// A refresher that counts calls and optionally fails
pub struct CountingRefresher {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingRefresher {
    /// A refresher whose refresh always succeeds
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: false,
        })
    }

    /// A refresher whose refresh always fails
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    /// Number of refreshes attempted
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CredentialRefresher for CountingRefresher {
    async fn refresh(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(lbaas_core::Error::Other("identity service unavailable".to_string()));
        }
        Ok(())
    }
}

/// A fetched resource carrying only its status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeResource {
    pub id: ResourceId,
    pub status: String,
}

/// A resource API whose fetches and deletes follow scripts of statuses
pub struct ScriptedApi {
    pub fetches: Arc<Script<String>>,
    pub deletes: Arc<Script<()>>,
}

impl ScriptedApi {
    pub fn new(fetches: Arc<Script<String>>, deletes: Arc<Script<()>>) -> Self {
        Self { fetches, deletes }
    }
}

#[async_trait::async_trait]
impl ResourceApi for ScriptedApi {
    type Resource = FakeResource;

    fn resource_type(&self) -> &str {
        "listener"
    }

    async fn fetch(&self, id: &ResourceId) -> std::result::Result<FakeResource, ApiError> {
        self.fetches.next().map(|status| FakeResource {
            id: id.clone(),
            status,
        })
    }

    async fn delete(&self, _id: &ResourceId) -> std::result::Result<(), ApiError> {
        self.deletes.next()
    }

    fn status_of(&self, resource: &FakeResource) -> String {
        resource.status.clone()
    }
}

/// A successful fetch reporting `status`
pub fn status(status: &str) -> std::result::Result<String, ApiError> {
    Ok(status.to_string())
}

/// A 409 response with `body`
pub fn conflict<T>(body: &str) -> std::result::Result<T, ApiError> {
    Err(ApiError::new("PUT", "https://lb.example.test/v2/lbaas/listeners/l-1", 409, body))
}

/// A 404 response
pub fn not_found<T>() -> std::result::Result<T, ApiError> {
    Err(ApiError::new(
        "GET",
        "https://lb.example.test/v2/lbaas/listeners/l-1",
        404,
        "{\"faultstring\": \"Listener l-1 could not be found.\"}",
    ))
}

/// A 401 response
pub fn unauthorized<T>() -> std::result::Result<T, ApiError> {
    Err(ApiError::new(
        "GET",
        "https://lb.example.test/v2/lbaas/listeners/l-1",
        401,
        "The request you have made requires authentication.",
    ))
}

/// A 500 response
pub fn server_error<T>() -> std::result::Result<T, ApiError> {
    Err(ApiError::new(
        "GET",
        "https://lb.example.test/v2/lbaas/listeners/l-1",
        500,
        "internal error",
    ))
}

/// A 429 response
pub fn throttled<T>() -> std::result::Result<T, ApiError> {
    Err(ApiError::new(
        "POST",
        "https://lb.example.test/v2/lbaas/listeners",
        429,
        "Rate limit exceeded",
    ))
}

/// Body of a 409 that names a transient cause
pub const LOCKED_BODY: &str = "Load Balancer lb-1 is immutable and cannot be updated.";

/// Body of a 409 that names a genuine conflict
pub const DUPLICATE_BODY: &str = "Another Listener on this Load Balancer is already using protocol_port 80";
