//! Integration tests for the line-delimited stdio front end.

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use parachute_sandbox::store::{SessionStore, WorkspaceStore};
use parachute_sandbox::transport;

use super::test_helpers::{harness, Harness, SLUG};

/// Feed `input` to the front end and return every output line as JSON.
async fn run_lines(h: &Harness, input: &str) -> Vec<Value> {
    let (mut client_in, server_in) = tokio::io::duplex(64 * 1024);
    let (server_out, mut client_out) = tokio::io::duplex(256 * 1024);

    client_in
        .write_all(input.as_bytes())
        .await
        .expect("write input");
    drop(client_in);

    let sessions = Arc::clone(&h.sessions) as Arc<dyn SessionStore>;
    tokio::time::timeout(
        std::time::Duration::from_secs(10),
        transport::serve(
            Arc::clone(&h.orchestrator),
            sessions,
            server_in,
            server_out,
            CancellationToken::new(),
        ),
    )
    .await
    .expect("serve finishes at EOF")
    .expect("serve succeeds");

    let mut raw = String::new();
    client_out
        .read_to_string(&mut raw)
        .await
        .expect("read output");
    raw.lines()
        .map(|l| serde_json::from_str(l).expect("output line is json"))
        .collect()
}

fn turn_line(h: &Harness, request_id: &str, session_id: &str, message: &str) -> String {
    serde_json::json!({
        "request_id": request_id,
        "session_id": session_id,
        "workspace_id": SLUG,
        "working_directory": h.workspace_dir(),
        "message": message,
    })
    .to_string()
}

#[tokio::test]
async fn turn_streams_events_tagged_with_request_id() {
    let h = harness();
    let input = format!("{}\n", turn_line(&h, "r1", "S", "hello"));

    let out = run_lines(&h, &input).await;

    assert!(!out.is_empty());
    assert!(out.iter().all(|l| l["request_id"] == "r1"));
    let types: Vec<&str> = out
        .iter()
        .filter_map(|l| l["event"]["type"].as_str())
        .collect();
    assert_eq!(types, vec!["session-start", "text-delta", "done"]);
    assert_eq!(out[2]["event"]["session_id"], "S");
}

#[tokio::test]
async fn unknown_session_is_created_and_history_recorded() {
    let h = harness();
    let input = format!("{}\n", turn_line(&h, "r1", "new-session", "hello"));

    run_lines(&h, &input).await;

    let session = h
        .sessions
        .get("new-session")
        .await
        .expect("store read")
        .expect("session created");
    assert_eq!(session.workspace_id.as_deref(), Some(SLUG));

    let history = h
        .sessions
        .history("new-session", 10)
        .await
        .expect("history read");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, "user");
    assert_eq!(history[0].content, "hello");
    assert_eq!(history[1].role, "assistant");
    assert_eq!(history[1].content, "echo: hello");
}

#[tokio::test]
async fn malformed_line_yields_error_event_and_serving_continues() {
    let h = harness();
    let input = format!("{{not json\n{}\n", turn_line(&h, "r2", "S", "hi"));

    let out = run_lines(&h, &input).await;

    assert_eq!(out[0]["request_id"], "");
    assert_eq!(out[0]["event"]["type"], "error");
    assert_eq!(out[0]["event"]["kind"], "invalid-input");
    assert!(out
        .iter()
        .any(|l| l["request_id"] == "r2" && l["event"]["type"] == "done"));
}

#[tokio::test]
async fn status_reports_tracked_containers() {
    let h = harness();
    h.manager.ensure_running(SLUG).await.expect("running");

    let out = run_lines(&h, "{\"op\":\"status\",\"request_id\":\"st\"}\n").await;

    assert_eq!(out.len(), 1);
    assert_eq!(out[0]["request_id"], "st");
    let containers = out[0]["containers"].as_array().expect("array");
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0]["slug"], SLUG);
    assert_eq!(containers[0]["status"], "running");
}

#[tokio::test]
async fn delete_op_removes_workspace() {
    let h = harness();

    let out = run_lines(
        &h,
        "{\"op\":\"delete_workspace\",\"request_id\":\"d1\",\"slug\":\"research\"}\n",
    )
    .await;

    assert_eq!(out[0]["request_id"], "d1");
    assert_eq!(out[0]["deleted"], SLUG);
    assert_eq!(out[0]["record_removed"], true);
    assert!(h.workspaces.get(SLUG).await.expect("registry").is_none());
}

#[tokio::test]
async fn delete_op_while_busy_reports_conflict() {
    let h = harness();
    let _permit = h
        .manager
        .guard()
        .acquire_exec(SLUG)
        .await
        .expect("slot acquired");

    let out = run_lines(
        &h,
        "{\"op\":\"delete_workspace\",\"request_id\":\"d2\",\"slug\":\"research\"}\n",
    )
    .await;

    assert_eq!(out[0]["request_id"], "d2");
    assert_eq!(out[0]["event"]["type"], "error");
    assert_eq!(out[0]["event"]["kind"], "workspace-busy");
}

#[tokio::test]
async fn unreachable_runtime_refuses_untrusted_turn() {
    let h = harness();
    h.runtime.set_available(false);
    let input = format!("{}\n", turn_line(&h, "r1", "S", "hello"));

    let out = run_lines(&h, &input).await;

    assert_eq!(out.len(), 1, "out: {out:?}");
    assert_eq!(out[0]["request_id"], "r1");
    assert_eq!(out[0]["event"]["type"], "error");
    assert_eq!(out[0]["event"]["kind"], "container-unavailable");
    assert_eq!(h.runtime.count("create"), 0);
    assert!(h
        .sessions
        .history("S", 10)
        .await
        .expect("history")
        .is_empty());
}
