//! Contract Test: Engine Operations and Events
//!
//! Constraints verified:
//! - converge emits lock, acceptance and convergence events in order
//! - Failures emit a single Failed event naming the action
//! - Throttling mode retries 429/503 and nothing else
//! - delete treats a 404 on the delete call as already gone
//! - The ResourceApi helpers drive the same polling paths
//! - read maps not-found to None and never locks

mod common;

use common::*;
use lbaas_core::registry::KeyedMutexRegistry;
use lbaas_core::{
    ConvergeRequest, ConvergenceConfig, ConvergenceEngine, DeleteRequest, EngineEvent, Error,
    OperationContext, ResourceId, ResourceRef, RetryExecutor, RetryMode,
};
use std::sync::Arc;
use tokio::sync::mpsc;

fn engine() -> (ConvergenceEngine, mpsc::Receiver<EngineEvent>, Arc<KeyedMutexRegistry>) {
    let registry = Arc::new(KeyedMutexRegistry::new());
    let (engine, events) = ConvergenceEngine::with_registry(
        RetryExecutor::without_refresh(),
        &ConvergenceConfig::default(),
        Arc::clone(&registry),
    )
    .unwrap();
    (engine, events, registry)
}

fn drain(events: &mut mpsc::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn converge_emits_events_in_order() {
    let (engine, mut events, _) = engine();
    let fetches = Script::new(vec![
        status("PENDING_CREATE"),
        status("PENDING_CREATE"),
        status("ACTIVE"),
    ]);

    let result = engine
        .converge(
            &OperationContext::new(),
            &ConvergeRequest::new("create", "lb-1", "listener"),
            || async { Ok(ResourceId::from("l-1")) },
            |_id: &ResourceId| {
                let r = fetches.next();
                async move { r }
            },
            |s: &String| s.clone(),
        )
        .await;

    assert_eq!(result.unwrap(), "ACTIVE");
    assert_eq!(fetches.calls(), 3);
    assert_eq!(
        drain(&mut events),
        vec![
            EngineEvent::LockAcquired {
                parent: ResourceId::from("lb-1"),
            },
            EngineEvent::MutationAccepted {
                action: "create".to_string(),
                resource: ResourceRef::new("listener", "l-1"),
            },
            EngineEvent::Converged {
                action: "create".to_string(),
                resource: ResourceRef::new("listener", "l-1"),
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn converge_retries_transient_conflicts_when_asked() {
    let (engine, _events, _) = engine();
    let mutation = Script::new(vec![conflict(LOCKED_BODY), Ok(ResourceId::from("l-1"))]);

    let result = engine
        .converge(
            &OperationContext::new(),
            &ConvergeRequest::new("update", "lb-1", "listener").with_retry(RetryMode::Conflict),
            || {
                let r = mutation.next();
                async move { r }
            },
            |_id: &ResourceId| async { status("ACTIVE") },
            |s: &String| s.clone(),
        )
        .await;

    assert!(result.is_ok());
    assert_eq!(mutation.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn throttling_mode_retries_load_shedding() {
    let (engine, _events, _) = engine();
    let mutation = Script::new(vec![throttled(), throttled(), Ok(ResourceId::from("l-1"))]);

    let start = tokio::time::Instant::now();
    let result = engine
        .converge(
            &OperationContext::new(),
            &ConvergeRequest::new("create", "lb-1", "listener").with_retry(RetryMode::Throttling),
            || {
                let r = mutation.next();
                async move { r }
            },
            |_id: &ResourceId| async { status("ACTIVE") },
            |s: &String| s.clone(),
        )
        .await;

    assert_eq!(result.unwrap(), "ACTIVE");
    assert_eq!(mutation.calls(), 3);
    assert_eq!(start.elapsed(), std::time::Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn throttling_mode_does_not_retry_conflicts() {
    let (engine, _events, _) = engine();
    let mutation = Script::always(conflict::<ResourceId>(LOCKED_BODY));

    let result = engine
        .converge(
            &OperationContext::new(),
            &ConvergeRequest::new("update", "lb-1", "listener").with_retry(RetryMode::Throttling),
            || {
                let r = mutation.next();
                async move { r }
            },
            |_id: &ResourceId| async { status("ACTIVE") },
            |s: &String| s.clone(),
        )
        .await;

    assert!(matches!(result, Err(Error::Api(_))));
    assert_eq!(mutation.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn auth_only_mode_does_not_retry_conflicts() {
    let (engine, mut events, _) = engine();
    let mutation = Script::always(conflict::<ResourceId>(LOCKED_BODY));

    let result = engine
        .converge(
            &OperationContext::new(),
            &ConvergeRequest::new("update", "lb-1", "listener"),
            || {
                let r = mutation.next();
                async move { r }
            },
            |_id: &ResourceId| async { status("ACTIVE") },
            |s: &String| s.clone(),
        )
        .await;

    assert!(matches!(result, Err(Error::Api(_))));
    assert_eq!(mutation.calls(), 1);

    let failures: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::Failed { .. }))
        .collect();
    assert_eq!(failures.len(), 1);
    match &failures[0] {
        EngineEvent::Failed { action, resource_type, .. } => {
            assert_eq!(action, "update");
            assert_eq!(resource_type, "listener");
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn delete_waits_until_gone() {
    let (engine, mut events, _) = engine();
    let deletes = Script::always(Ok(()));
    let fetches = Script::new(vec![
        status("PENDING_DELETE"),
        status("PENDING_DELETE"),
        not_found(),
    ]);

    let result = engine
        .delete(
            &OperationContext::new(),
            &DeleteRequest::new("lb-1", ResourceRef::new("listener", "l-1")),
            || {
                let r = deletes.next();
                async move { r }
            },
            || {
                let r = fetches.next();
                async move { r }
            },
        )
        .await;

    assert!(result.is_ok());
    assert_eq!(deletes.calls(), 1);
    assert_eq!(fetches.calls(), 3);
    assert!(drain(&mut events).contains(&EngineEvent::Deleted {
        resource: ResourceRef::new("listener", "l-1"),
    }));
}

#[tokio::test(start_paused = true)]
async fn delete_of_missing_resource_succeeds() {
    let (engine, _events, _) = engine();
    let fetches = Script::always(status("ACTIVE"));

    let result = engine
        .delete(
            &OperationContext::new(),
            &DeleteRequest::new("lb-1", ResourceRef::new("listener", "l-1")),
            || async { not_found::<()>() },
            || {
                let r = fetches.next();
                async move { r }
            },
        )
        .await;

    assert!(result.is_ok());
    assert_eq!(fetches.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn resource_api_helpers() {
    let (engine, _events, registry) = engine();
    let api = ScriptedApi::new(
        Script::new(vec![status("PENDING_UPDATE"), status("ACTIVE"), not_found()]),
        Script::always(Ok(())),
    );
    let ctx = OperationContext::new();
    let id = ResourceId::from("l-1");

    let listener = engine.wait_active(&ctx, &api, &id).await.unwrap();
    assert_eq!(listener.status, "ACTIVE");
    assert_eq!(api.fetches.calls(), 2);

    engine
        .delete_resource(&ctx, &api, &ResourceId::from("lb-1"), &id, RetryMode::Conflict)
        .await
        .unwrap();
    assert_eq!(api.deletes.calls(), 1);
    assert_eq!(api.fetches.calls(), 3);
    assert!(registry.contains(&ResourceId::from("lb-1")));

    engine.wait_deleted(&ctx, &api, &id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn wait_active_rejects_error_status() {
    let (engine, _events, _) = engine();
    let api = ScriptedApi::new(Script::always(status("ERROR")), Script::always(Ok(())));

    let err = engine
        .wait_active(&OperationContext::new(), &api, &ResourceId::from("l-1"))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "listener 'l-1' reached status ERROR, expected ACTIVE");
}

#[tokio::test]
async fn read_maps_not_found_to_none() {
    let (engine, _events, registry) = engine();
    let resource = ResourceRef::new("listener", "l-1");

    let missing = engine
        .read(&OperationContext::new(), &resource, || async { not_found::<String>() })
        .await
        .unwrap();
    assert_eq!(missing, None);

    let present = engine
        .read(&OperationContext::new(), &resource, || async { status("ACTIVE") })
        .await
        .unwrap();
    assert_eq!(present.as_deref(), Some("ACTIVE"));

    assert!(registry.is_empty());
}
