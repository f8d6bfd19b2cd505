//! Integration tests for native resume, history injection and the
//! resume-failure fallback.

use std::sync::Arc;

use tokio::sync::mpsc;

use parachute_sandbox::continuity::{ResumePlan, SessionContinuity};
use parachute_sandbox::models::event::TurnEvent;
use parachute_sandbox::models::session::{HistoryMessage, Session, TrustLevel, RESUME_REFERENCE_KEY};
use parachute_sandbox::models::turn::ExecutionRequest;
use parachute_sandbox::router::Route;
use parachute_sandbox::runtime::TurnExecutor;
use parachute_sandbox::store::memory::MemorySessionStore;
use parachute_sandbox::store::SessionStore;
use parachute_sandbox::{BoxFuture, Result};

use super::test_helpers::{collect, harness, last, text_of, SLUG};

async fn seed_history(h: &super::test_helpers::Harness, session_id: &str) {
    for (role, content) in [
        ("user", "my favourite colour is teal"),
        ("assistant", "noted, teal"),
    ] {
        h.sessions
            .append_message(session_id, HistoryMessage::new(role, content))
            .await
            .expect("append history");
    }
}

#[tokio::test]
async fn fresh_session_starts_without_resume_or_history() {
    let h = harness();
    h.seed_session("S").await;

    let events = collect(
        h.orchestrator
            .submit_turn(h.turn("S", "hello"))
            .await
            .expect("turn accepted"),
    )
    .await;

    assert!(matches!(
        &events[0],
        TurnEvent::SessionStart { session_id, resumed: false } if session_id == "S"
    ));
    assert!(matches!(last(&events), TurnEvent::Done { session_id, degraded: false } if session_id == "S"));

    let requests = h.runtime.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].resume_session_id, None);
    assert_eq!(requests[0].message, "hello");
    assert!(h.transcript_path("S").is_file(), "engine wrote its transcript");
}

#[tokio::test]
async fn second_turn_resumes_engine_transcript() {
    let h = harness();
    h.seed_session("S").await;

    for message in ["hello", "what did I say?"] {
        collect(
            h.orchestrator
                .submit_turn(h.turn("S", message))
                .await
                .expect("turn accepted"),
        )
        .await;
    }

    let requests = h.runtime.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].resume_session_id.as_deref(), Some("S"));
    assert_eq!(requests[1].message, "what did I say?");
    assert_eq!(h.runtime.count("create"), 1);
}

#[tokio::test]
async fn missing_transcript_falls_back_to_history_injection() {
    let h = harness();
    h.seed_session("S").await;
    seed_history(&h, "S").await;

    let events = collect(
        h.orchestrator
            .submit_turn(h.turn("S", "what colour?"))
            .await
            .expect("turn accepted"),
    )
    .await;
    assert!(matches!(last(&events), TurnEvent::Done { degraded: false, .. }));

    let requests = h.runtime.requests();
    assert_eq!(requests[0].resume_session_id, None);
    let sent = &requests[0].message;
    assert!(sent.starts_with("<conversation_history>"), "sent: {sent}");
    assert!(sent.contains("[user]: my favourite colour is teal"));
    assert!(sent.contains("[assistant]: noted, teal"));
    assert!(sent.ends_with("what colour?"));
}

#[tokio::test]
async fn resume_failure_retries_once_with_history() {
    let h = harness();
    h.seed_session("S").await;
    seed_history(&h, "S").await;
    // A transcript exists, but the engine will reject it as corrupt.
    let transcript = h.transcript_path("S");
    h.manager.storage().ensure(SLUG).expect("storage");
    std::fs::create_dir_all(transcript.parent().expect("parent")).expect("mkdir");
    std::fs::write(&transcript, "{garbage").expect("write transcript");
    h.runtime.set_fail_resume(true);

    let events = collect(
        h.orchestrator
            .submit_turn(h.turn("S", "what colour?"))
            .await
            .expect("turn accepted"),
    )
    .await;

    assert!(
        events
            .iter()
            .any(|e| matches!(e, TurnEvent::ResumeFailed { .. })),
        "resume failure is visible to the caller: {events:?}"
    );
    assert!(
        !events.iter().any(|e| matches!(e, TurnEvent::Error { .. })),
        "the failed attempt's error is not surfaced: {events:?}"
    );
    assert!(matches!(last(&events), TurnEvent::Done { degraded: true, .. }));
    assert!(text_of(&events).contains("my favourite colour is teal"));

    let requests = h.runtime.requests();
    assert_eq!(requests.len(), 2, "exactly one retry");
    assert_eq!(requests[0].resume_session_id.as_deref(), Some("S"));
    assert_eq!(requests[1].resume_session_id, None);
    assert!(requests[1].message.contains("<conversation_history>"));
}

#[tokio::test]
async fn resume_failure_without_history_is_a_typed_error() {
    let h = harness();
    h.seed_session("S").await;
    let transcript = h.transcript_path("S");
    h.manager.storage().ensure(SLUG).expect("storage");
    std::fs::create_dir_all(transcript.parent().expect("parent")).expect("mkdir");
    std::fs::write(&transcript, "{garbage").expect("write transcript");
    h.runtime.set_fail_resume(true);

    let events = collect(
        h.orchestrator
            .submit_turn(h.turn("S", "hi"))
            .await
            .expect("turn accepted"),
    )
    .await;

    assert!(matches!(&events[0], TurnEvent::ResumeFailed { .. }));
    assert!(
        matches!(last(&events), TurnEvent::Error { kind, .. } if kind == "resume-failed"),
        "got {events:?}"
    );
    assert_eq!(h.runtime.requests().len(), 1, "no context-free retry");
}

#[tokio::test]
async fn done_records_resume_reference_on_session() {
    let h = harness();
    h.seed_session("S").await;

    collect(
        h.orchestrator
            .submit_turn(h.turn("S", "hello"))
            .await
            .expect("turn accepted"),
    )
    .await;

    let session = h
        .sessions
        .get("S")
        .await
        .expect("store read")
        .expect("session exists");
    assert_eq!(session.resume_reference(), Some("S"));
}

#[tokio::test]
async fn turn_writes_only_the_session_fields_it_owns() {
    let h = harness();
    h.seed_session("S").await;
    h.sessions
        .set_metadata("S", "label", "kept")
        .await
        .expect("seed metadata");

    let mut turn = h.turn("S", "hello");
    turn.trust_override = Some(TrustLevel::Untrusted);
    collect(h.orchestrator.submit_turn(turn).await.expect("turn accepted")).await;

    let session = h
        .sessions
        .get("S")
        .await
        .expect("store read")
        .expect("session exists");
    assert_eq!(session.trust_level, Some(TrustLevel::Untrusted));
    assert_eq!(session.resume_reference(), Some("S"));
    assert_eq!(session.metadata.get("label").map(String::as_str), Some("kept"));
}

#[tokio::test]
async fn direct_route_plans_from_resume_reference() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sessions = Arc::new(MemorySessionStore::new());
    let mut session = Session::new("D".into(), None, dir.path().to_path_buf());
    session
        .metadata
        .insert(RESUME_REFERENCE_KEY.into(), "engine-abc".into());
    sessions.upsert(session).await.expect("seed");

    let continuity = SessionContinuity::new(
        sessions,
        parachute_sandbox::storage::WorkspaceStorage::new(dir.path().join("sandbox")),
        "/workspace",
        10,
    );
    let plan = continuity
        .plan(&Route::Direct, "D")
        .await
        .expect("plan");
    assert_eq!(
        plan,
        ResumePlan::Resume {
            session_id: "engine-abc".into()
        }
    );

    let plan = continuity
        .plan(&Route::Direct, "unknown")
        .await
        .expect("plan");
    assert_eq!(plan, ResumePlan::Fresh);
}

#[cfg(unix)]
#[tokio::test]
async fn symlinked_transcript_is_ignored() {
    let h = harness();
    h.seed_session("S").await;
    let engine_dir = h.manager.storage().ensure(SLUG).expect("storage");

    // Code in the sandbox points `projects` somewhere else on the host.
    let outside = h.dir.path().join("outside");
    std::fs::create_dir_all(outside.join("-workspace")).expect("mkdir");
    std::fs::write(outside.join("-workspace").join("S.jsonl"), "{}").expect("write");
    std::os::unix::fs::symlink(&outside, engine_dir.join("projects")).expect("symlink");

    let continuity = SessionContinuity::new(
        Arc::clone(&h.sessions) as Arc<dyn SessionStore>,
        h.manager.storage().clone(),
        "/workspace",
        10,
    );
    let plan = continuity
        .plan(
            &Route::Sandbox {
                slug: SLUG.to_owned(),
            },
            "S",
        )
        .await
        .expect("plan");
    assert_eq!(plan, ResumePlan::Fresh);
}

#[tokio::test]
async fn concurrent_first_turns_do_not_both_start_fresh() {
    let h = harness();
    h.seed_session("S").await;

    let (a, b) = tokio::join!(
        h.orchestrator.submit_turn(h.turn("S", "one")),
        h.orchestrator.submit_turn(h.turn("S", "two")),
    );
    let (a, b) = (a.expect("turn a"), b.expect("turn b"));
    let (ea, eb) = tokio::join!(collect(a), collect(b));
    assert!(matches!(last(&ea), TurnEvent::Done { .. }));
    assert!(matches!(last(&eb), TurnEvent::Done { .. }));

    let fresh = h
        .runtime
        .requests()
        .iter()
        .filter(|r| r.resume_session_id.is_none())
        .count();
    assert_eq!(fresh, 1, "second turn resumes the first one's transcript");
}

/// Executor replaying a fixed list of events, then closing the stream.
struct Replay(Vec<TurnEvent>);

impl TurnExecutor for Replay {
    fn execute(&self, _request: ExecutionRequest) -> BoxFuture<'_, Result<mpsc::Receiver<TurnEvent>>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(self.0.len().max(1));
            for event in &self.0 {
                tx.send(event.clone()).await.expect("buffered");
            }
            Ok(rx)
        })
    }
}

fn direct_continuity(dir: &std::path::Path) -> Arc<SessionContinuity> {
    Arc::new(SessionContinuity::new(
        Arc::new(MemorySessionStore::new()),
        parachute_sandbox::storage::WorkspaceStorage::new(dir.join("sandbox")),
        "/workspace",
        10,
    ))
}

fn direct_request(dir: &std::path::Path) -> ExecutionRequest {
    ExecutionRequest {
        message: "hello".into(),
        session_id: "D".into(),
        resume_session_id: None,
        working_directory: dir.to_path_buf(),
        capability_config: serde_json::Value::Null,
        request_id: "req-D".into(),
    }
}

#[tokio::test]
async fn stream_closed_without_result_ends_with_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let executor = Arc::new(Replay(vec![TurnEvent::TextDelta {
        text: "partial".into(),
    }]));

    let events = collect(
        direct_continuity(dir.path())
            .run_turn(executor, Route::Direct, direct_request(dir.path()))
            .await
            .expect("turn started"),
    )
    .await;

    assert_eq!(events.len(), 2, "events: {events:?}");
    assert_eq!(text_of(&events), "partial");
    assert!(
        matches!(last(&events), TurnEvent::Error { kind, .. } if kind == "engine"),
        "got {events:?}"
    );
}

#[tokio::test]
async fn terminal_error_is_not_followed_by_another() {
    let dir = tempfile::tempdir().expect("tempdir");
    let executor = Arc::new(Replay(vec![TurnEvent::Error {
        kind: "exec-timeout".into(),
        message: "exec timeout: no completion within 1s".into(),
    }]));

    let events = collect(
        direct_continuity(dir.path())
            .run_turn(executor, Route::Direct, direct_request(dir.path()))
            .await
            .expect("turn started"),
    )
    .await;

    assert_eq!(events.len(), 1, "events: {events:?}");
    assert!(matches!(&events[0], TurnEvent::Error { kind, .. } if kind == "exec-timeout"));
}
