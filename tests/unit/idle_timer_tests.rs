//! Unit tests for the per-workspace idle timer.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parachute_sandbox::container::idle::{IdleEvent, IdleTimer};

fn timer(window_ms: u64) -> (IdleTimer, mpsc::Receiver<IdleEvent>, CancellationToken) {
    let (tx, rx) = mpsc::channel(4);
    let cancel = CancellationToken::new();
    let timer = IdleTimer::new(
        "research".into(),
        Duration::from_millis(window_ms),
        tx,
        cancel.clone(),
    );
    (timer, rx, cancel)
}

#[tokio::test]
async fn fires_after_idle_window() {
    let (timer, mut rx, _cancel) = timer(50);
    let _handle = timer.spawn();

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timer fired")
        .expect("event");
    assert_eq!(
        event,
        IdleEvent::Expired {
            slug: "research".into()
        }
    );
}

#[tokio::test]
async fn resets_postpone_expiry() {
    let (timer, mut rx, _cancel) = timer(300);
    let handle = timer.spawn();

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.reset();
    }
    assert!(rx.try_recv().is_err(), "activity kept the workspace warm");

    let fired = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
    assert!(fired.is_ok());
}

#[tokio::test]
async fn fires_once_until_rearmed() {
    let (timer, mut rx, _cancel) = timer(50);
    let handle = timer.spawn();

    rx.recv().await.expect("first expiry");
    let again = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(again.is_err(), "disarmed after firing");

    handle.reset();
    let rearmed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
    assert!(rearmed.is_ok(), "reset re-arms the timer");
}

#[tokio::test]
async fn cancellation_stops_the_task() {
    let (timer, mut rx, cancel) = timer(50);
    let handle = timer.spawn();

    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handle.is_finished());
    assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .map_or(true, |event| event.is_none()));
}

#[tokio::test]
async fn dropping_the_handle_cancels() {
    let (timer, mut rx, cancel) = timer(50);
    drop(timer.spawn());

    assert!(cancel.is_cancelled());
    let next = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(matches!(next, Ok(None)), "sender dropped with the task");
}
