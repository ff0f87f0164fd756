//! Contract Test: Conflict Retry
//!
//! A 409 is retried only when its body names a transient cause, with a wait
//! that starts at the base interval and doubles per retry.
//!
//! Constraints verified:
//! - k retryable conflicts then success costs exactly k+1 calls
//! - Total backoff for k retries is base * (2^k - 1)
//! - A conflict naming no known cause is returned after one call
//! - The attempt bound ends the loop with RetryExhausted, without a final wait
//! - Cancellation and deadlines cut a backoff short

mod common;

use common::*;
use lbaas_core::retry::DEFAULT_CONFLICT_KEYWORDS;
use lbaas_core::{Error, OperationContext, RetryExecutor, RetryPolicy};
use std::time::Duration;
use tokio::time::Instant;

const BASE: Duration = Duration::from_secs(1);

#[tokio::test(start_paused = true)]
async fn retryable_conflicts_then_success() {
    for k in 0..4u32 {
        let mut steps = vec![conflict(LOCKED_BODY); k as usize];
        steps.push(Ok("l-1".to_string()));
        let script = Script::new(steps);

        let start = Instant::now();
        let result = RetryExecutor::without_refresh()
            .execute_with_conflict_retry(
                &OperationContext::new(),
                "update listener",
                DEFAULT_CONFLICT_KEYWORDS,
                Some(10),
                BASE,
                || {
                    let r = script.next();
                    async move { r }
                },
            )
            .await;

        assert_eq!(result.unwrap(), "l-1");
        assert_eq!(script.calls(), k as usize + 1);
        assert_eq!(start.elapsed(), BASE * (2u32.pow(k) - 1));
    }
}

#[tokio::test(start_paused = true)]
async fn keyword_match_ignores_case() {
    let script = Script::new(vec![
        conflict("{\"faultstring\": \"Operation In Progress on lb-1\"}"),
        Ok(()),
    ]);

    let result = RetryExecutor::without_refresh()
        .execute_with_retry(&OperationContext::new(), "create pool", &RetryPolicy::conflict(), || {
            let r = script.next();
            async move { r }
        })
        .await;

    assert!(result.is_ok());
    assert_eq!(script.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn genuine_conflict_is_not_retried() {
    let script = Script::always(conflict::<()>(DUPLICATE_BODY));

    let start = Instant::now();
    let result = RetryExecutor::without_refresh()
        .execute_with_retry(&OperationContext::new(), "create listener", &RetryPolicy::conflict(), || {
            let r = script.next();
            async move { r }
        })
        .await;

    match result {
        Err(Error::Api(e)) => {
            assert_eq!(e.status(), Some(409));
            assert_eq!(e.body().as_str(), DUPLICATE_BODY);
        }
        other => panic!("expected the conflict unchanged, got {other:?}"),
    }
    assert_eq!(script.calls(), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn blank_keyword_does_not_widen_retry() {
    let script = Script::always(conflict::<()>(DUPLICATE_BODY));

    let result = RetryExecutor::without_refresh()
        .execute_with_conflict_retry(
            &OperationContext::new(),
            "create listener",
            &["resource is locked", ""],
            Some(3),
            BASE,
            || {
                let r = script.next();
                async move { r }
            },
        )
        .await;

    assert!(matches!(result, Err(Error::Api(_))));
    assert_eq!(script.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn other_failures_are_not_retried() {
    let script = Script::always(server_error::<()>());

    let result = RetryExecutor::without_refresh()
        .execute_with_retry(&OperationContext::new(), "delete pool", &RetryPolicy::conflict(), || {
            let r = script.next();
            async move { r }
        })
        .await;

    assert_eq!(result.unwrap_err().api_error().and_then(|e| e.status()), Some(500));
    assert_eq!(script.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhaustion_after_max_attempts() {
    let script = Script::always(conflict::<()>(LOCKED_BODY));
    let policy = RetryPolicy::conflict().with_max_attempts(Some(4));

    let start = Instant::now();
    let result = RetryExecutor::without_refresh()
        .execute_with_retry(&OperationContext::new(), "update listener", &policy, || {
            let r = script.next();
            async move { r }
        })
        .await;

    match result {
        Err(Error::RetryExhausted { operation, attempts, last }) => {
            assert_eq!(operation, "update listener");
            assert_eq!(attempts, 4);
            assert_eq!(last.body().as_str(), LOCKED_BODY);
        }
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
    assert_eq!(script.calls(), 4);
    // Waits after calls 1-3 only: 1 + 2 + 4
    assert_eq!(start.elapsed(), Duration::from_secs(7));
}

#[tokio::test(start_paused = true)]
async fn exhaustion_message_names_the_operation() {
    let script = Script::always(conflict::<()>(LOCKED_BODY));
    let policy = RetryPolicy::conflict().with_max_attempts(Some(2));

    let err = RetryExecutor::without_refresh()
        .execute_with_retry(&OperationContext::new(), "update listener", &policy, || {
            let r = script.next();
            async move { r }
        })
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("update listener"));
    assert!(message.contains("exceeded max retries (2)"));
    assert!(message.contains(LOCKED_BODY));
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_backoff() {
    let script = Script::always(conflict::<()>(LOCKED_BODY));
    let ctx = OperationContext::new();

    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        canceller.cancel();
    });

    let start = Instant::now();
    let result = RetryExecutor::without_refresh()
        .execute_with_retry(&ctx, "update listener", &RetryPolicy::conflict(), || {
            let r = script.next();
            async move { r }
        })
        .await;

    assert!(matches!(result, Err(Error::Cancelled)));
    // Second backoff (2s, from t=1s) was cut short at t=1.5s
    assert_eq!(script.calls(), 2);
    assert_eq!(start.elapsed(), Duration::from_millis(1500));
}

#[tokio::test(start_paused = true)]
async fn deadline_bounds_unlimited_attempts() {
    let script = Script::always(conflict::<()>(LOCKED_BODY));
    let policy = RetryPolicy::conflict().with_max_attempts(None);
    let ctx = OperationContext::with_timeout(Duration::from_secs(20));

    let start = Instant::now();
    let result = RetryExecutor::without_refresh()
        .execute_with_retry(&ctx, "update listener", &policy, || {
            let r = script.next();
            async move { r }
        })
        .await;

    assert!(matches!(result, Err(Error::DeadlineExceeded { .. })));
    // Calls at t=0, 1, 3, 7, 15; the next wait ends past the deadline
    assert_eq!(script.calls(), 5);
    assert_eq!(start.elapsed(), Duration::from_secs(20));
}

#[tokio::test(start_paused = true)]
async fn already_cancelled_context_makes_no_call() {
    let script = Script::always(Ok::<_, lbaas_core::ApiError>(()));
    let ctx = OperationContext::new();
    ctx.cancel();

    let result = RetryExecutor::without_refresh()
        .execute_with_retry(&ctx, "update listener", &RetryPolicy::conflict(), || {
            let r = script.next();
            async move { r }
        })
        .await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(script.calls(), 0);
}
