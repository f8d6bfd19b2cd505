//! End-to-end scenario: one session across container stop and restart.

use std::time::Duration;

use parachute_sandbox::models::container::ContainerStatus;
use parachute_sandbox::models::event::TurnEvent;

use super::test_helpers::{collect, harness_with, last, CONTAINER, SLUG};

#[tokio::test]
async fn session_survives_idle_stop_and_restart() {
    let h = harness_with("idle_timeout_seconds = 1");
    let background = h.orchestrator.start().await;
    h.seed_session("S").await;

    // Turn 1: fresh session creates the container.
    let events = collect(
        h.orchestrator
            .submit_turn(h.turn("S", "hello"))
            .await
            .expect("turn 1"),
    )
    .await;
    assert!(matches!(last(&events), TurnEvent::Done { .. }));
    assert_eq!(h.runtime.count("create"), 1);

    // Turn 2: resumes the engine transcript.
    collect(
        h.orchestrator
            .submit_turn(h.turn("S", "remember me?"))
            .await
            .expect("turn 2"),
    )
    .await;

    // No activity: the container is stopped, not removed.
    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        while h.manager.snapshot().await[0].status != ContainerStatus::Stopped {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(stopped.is_ok(), "container should stop after the idle window");
    assert!(h.runtime.container(CONTAINER).is_some());

    // Turn 3: the same container is restarted and the transcript resumed.
    let events = collect(
        h.orchestrator
            .submit_turn(h.turn("S", "still there?"))
            .await
            .expect("turn 3"),
    )
    .await;
    assert!(matches!(
        last(&events),
        TurnEvent::Done { session_id, degraded: false } if session_id == "S"
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, TurnEvent::SessionStart { resumed: true, .. })));

    assert_eq!(h.runtime.count("create"), 1);
    assert_eq!(h.runtime.count("start"), 1);
    let resumes: Vec<_> = h
        .runtime
        .requests()
        .iter()
        .map(|r| r.resume_session_id.clone())
        .collect();
    assert_eq!(resumes, vec![None, Some("S".into()), Some("S".into())]);
    assert!(h.manager.storage().engine_dir(SLUG).expect("slug").is_dir());

    h.orchestrator.shutdown().await;
    for handle in background {
        let _ = handle.await;
    }
}
