//! Keyed mutex registry
//!
//! Serializes mutating sequences that touch the same parent resource. Several
//! controllers (listeners, target groups, policies) mutate children of one
//! load balancer concurrently; the provider rejects or corrupts overlapping
//! changes, so every sequence takes the parent's lock first.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lbaas_core::registry;
//!
//! let _guard = registry::global().acquire(&ctx, &load_balancer_id).await?;
//! // mutate, then poll to a terminal status
//! // guard drops here, on every exit path
//! ```
//!
//! Entries are created on first use and never evicted. The map grows with the
//! number of distinct parent resources touched during the process lifetime.

use crate::context::OperationContext;
use crate::error::Result;
use crate::status::ResourceId;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Exclusive lock for one resource identifier
pub type ResourceLock = Arc<tokio::sync::Mutex<()>>;

/// Held lock on one resource identifier; releases on drop
pub type ResourceGuard = OwnedMutexGuard<()>;

static GLOBAL: LazyLock<Arc<KeyedMutexRegistry>> = LazyLock::new(Default::default);

/// The process-wide registry
///
/// Lives until process exit; there is no teardown.
pub fn global() -> Arc<KeyedMutexRegistry> {
    Arc::clone(&GLOBAL)
}

/// Registry mapping resource identifiers to exclusive locks
///
/// ## Thread Safety
///
/// The map is guarded by a short-lived `std::sync::Mutex` that is never held
/// across an await. Lookups for different ids only contend on that map guard,
/// never on each other's resource locks.
///
/// Locks are not re-entrant: a task that acquires an id it already holds
/// deadlocks.
#[derive(Debug, Default)]
pub struct KeyedMutexRegistry {
    locks: Mutex<HashMap<ResourceId, ResourceLock>>,
}

impl KeyedMutexRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the lock for `id`, creating it if absent
    ///
    /// Repeated calls with the same id return the same lock instance. The
    /// registry does no acquiring; the caller locks and unlocks.
    pub fn lock_for(&self, id: &ResourceId) -> ResourceLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    /// Acquire the lock for `id`, waiting no longer than the context allows
    ///
    /// # Returns
    ///
    /// - `Ok(ResourceGuard)`: The lock is held until the guard drops
    /// - `Err(Error::Cancelled)` / `Err(Error::DeadlineExceeded)`: The context
    ///   was interrupted while waiting
    pub async fn acquire(&self, ctx: &OperationContext, id: &ResourceId) -> Result<ResourceGuard> {
        let lock = self.lock_for(id);
        debug!(id = %id, "Waiting for resource lock");

        let guard = ctx
            .run(lock.lock_owned())
            .await
            .map_err(|i| i.into_error(&format!("lock {id}")))?;

        debug!(id = %id, "Resource lock acquired");
        Ok(guard)
    }

    /// Number of ids that have a lock
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if no lock has been created yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if a lock exists for `id`
    pub fn contains(&self, id: &ResourceId) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;

    #[test]
    fn test_same_id_same_lock() {
        let registry = KeyedMutexRegistry::new();
        let id = ResourceId::from("8f1c7a52-3f0e-4b8e-9d55-2b1f1c7a0001");

        let first = registry.lock_for(&id);
        let second = registry.lock_for(&id);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_different_ids_different_locks() {
        let registry = KeyedMutexRegistry::new();
        let a = registry.lock_for(&ResourceId::from("lb-a"));
        let b = registry.lock_for(&ResourceId::from("lb-b"));

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(&ResourceId::from("lb-a")));
        assert!(!registry.contains(&ResourceId::from("lb-c")));
    }

    #[tokio::test]
    async fn test_different_ids_do_not_contend() {
        let registry = KeyedMutexRegistry::new();
        let ctx = OperationContext::with_timeout(Duration::from_secs(1));

        let _a = registry.acquire(&ctx, &ResourceId::from("lb-a")).await.unwrap();
        let b = registry.acquire(&ctx, &ResourceId::from("lb-b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_at_deadline() {
        let registry = KeyedMutexRegistry::new();
        let id = ResourceId::from("lb-a");
        let _held = registry.acquire(&OperationContext::new(), &id).await.unwrap();

        let ctx = OperationContext::with_timeout(Duration::from_secs(5));
        let result = registry.acquire(&ctx, &id).await;
        assert!(matches!(result, Err(Error::DeadlineExceeded { .. })));
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let registry = KeyedMutexRegistry::new();
        let id = ResourceId::from("lb-a");
        let ctx = OperationContext::new();

        {
            let _guard = registry.acquire(&ctx, &id).await.unwrap();
            assert!(registry.lock_for(&id).try_lock().is_err());
        }

        assert!(registry.lock_for(&id).try_lock().is_ok());
    }

    #[test]
    fn test_global_registry_is_shared() {
        let id = ResourceId::from("global-registry-test-id");
        assert!(Arc::ptr_eq(&global(), &global()));
        assert!(Arc::ptr_eq(&global().lock_for(&id), &global().lock_for(&id)));
    }
}
