//! Unit tests for per-workspace concurrency control.

use std::sync::Arc;
use std::time::Duration;

use parachute_sandbox::container::guard::ConcurrencyGuard;
use parachute_sandbox::AppError;

#[tokio::test]
async fn permits_track_active_execs() {
    let guard = ConcurrencyGuard::new(2);
    assert_eq!(guard.active_execs("a"), 0);

    let first = guard.acquire_exec("a").await.expect("slot");
    let second = guard.acquire_exec("a").await.expect("slot");
    assert_eq!(guard.active_execs("a"), 2);
    assert_eq!(guard.active_execs("b"), 0);

    drop(first);
    assert_eq!(guard.active_execs("a"), 1);
    drop(second);
    assert_eq!(guard.active_execs("a"), 0);
}

#[tokio::test]
async fn third_exec_waits_for_a_slot() {
    let guard = Arc::new(ConcurrencyGuard::new(2));
    let first = guard.acquire_exec("a").await.expect("slot");
    let _second = guard.acquire_exec("a").await.expect("slot");

    let waiter = {
        let guard = Arc::clone(&guard);
        tokio::spawn(async move { guard.acquire_exec("a").await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "no slot should be free yet");
    assert_eq!(guard.active_execs("a"), 3, "waiting callers count as active");

    drop(first);
    tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("slot freed")
        .expect("join")
        .expect("acquired");
}

#[tokio::test]
async fn zero_limit_is_clamped_to_one() {
    let guard = ConcurrencyGuard::new(0);
    let _permit = tokio::time::timeout(Duration::from_secs(1), guard.acquire_exec("a"))
        .await
        .expect("one slot available")
        .expect("slot");
}

#[tokio::test]
async fn retire_refuses_busy_workspace() {
    let guard = ConcurrencyGuard::new(2);
    let permit = guard.acquire_exec("a").await.expect("slot");

    let err = guard.retire("a").err().expect("busy");
    assert!(matches!(err, AppError::WorkspaceBusy(_)), "got {err:?}");

    drop(permit);
    let _retired = guard.retire("a").expect("idle workspace retires");
}

#[tokio::test]
async fn retired_workspace_refuses_new_execs_until_released() {
    let guard = ConcurrencyGuard::new(2);
    let retired = guard.retire("a").expect("retire");

    let err = guard.acquire_exec("a").await.err().expect("refused");
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
    let err = guard.retire("a").err().expect("second deletion");
    assert!(matches!(err, AppError::WorkspaceBusy(_)), "got {err:?}");

    drop(retired);
    let _permit = guard.acquire_exec("a").await.expect("slot after release");
}

#[tokio::test]
async fn lifecycle_lock_serializes_callers() {
    let guard = Arc::new(ConcurrencyGuard::new(1));
    let held = guard.lock_lifecycle("a").await;

    let contender = {
        let guard = Arc::clone(&guard);
        tokio::spawn(async move {
            let _lock = guard.lock_lifecycle("a").await;
        })
    };
    let other_slug = tokio::time::timeout(Duration::from_secs(1), guard.lock_lifecycle("b")).await;
    assert!(other_slug.is_ok(), "locks are per workspace");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!contender.is_finished());
    drop(held);
    tokio::time::timeout(Duration::from_secs(2), contender)
        .await
        .expect("lock released")
        .expect("join");
}
