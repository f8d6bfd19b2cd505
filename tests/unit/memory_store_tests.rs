//! Unit tests for the in-memory stores.

use std::path::PathBuf;

use parachute_sandbox::config::WorkspaceEntry;
use parachute_sandbox::models::session::{
    HistoryMessage, Session, SessionUpdate, TrustLevel, RESUME_REFERENCE_KEY,
};
use parachute_sandbox::AppError;
use parachute_sandbox::store::memory::MemorySessionStore;
use parachute_sandbox::store::workspaces::ConfigWorkspaces;
use parachute_sandbox::store::{SessionStore, WorkspaceStore};

#[tokio::test]
async fn sessions_upsert_and_get() {
    let store = MemorySessionStore::new();
    assert!(store.get("s1").await.expect("get").is_none());

    let mut session = Session::new("s1".into(), None, PathBuf::from("/tmp"));
    store.upsert(session.clone()).await.expect("insert");
    session.workspace_id = Some("w".into());
    store.upsert(session).await.expect("replace");

    let loaded = store.get("s1").await.expect("get").expect("present");
    assert_eq!(loaded.workspace_id.as_deref(), Some("w"));
}

#[tokio::test]
async fn field_updates_leave_other_fields_alone() {
    let store = MemorySessionStore::new();
    store
        .upsert(Session::new("s1".into(), None, PathBuf::from("/tmp")))
        .await
        .expect("insert");

    assert!(store
        .set_metadata("s1", RESUME_REFERENCE_KEY, "engine-1")
        .await
        .expect("metadata"));
    assert!(store
        .update(
            "s1",
            SessionUpdate {
                trust_level: Some(TrustLevel::Untrusted),
                workspace_id: Some("w".into()),
                working_directory: Some(PathBuf::from("/srv/w")),
            },
        )
        .await
        .expect("update"));
    assert!(store
        .set_metadata("s1", "label", "kept")
        .await
        .expect("metadata"));

    let loaded = store.get("s1").await.expect("get").expect("present");
    assert_eq!(loaded.resume_reference(), Some("engine-1"));
    assert_eq!(loaded.metadata.get("label").map(String::as_str), Some("kept"));
    assert_eq!(loaded.trust_level, Some(TrustLevel::Untrusted));
    assert_eq!(loaded.workspace_id.as_deref(), Some("w"));
    assert_eq!(loaded.working_directory, PathBuf::from("/srv/w"));
}

#[tokio::test]
async fn update_never_moves_a_bound_workspace() {
    let store = MemorySessionStore::new();
    store
        .upsert(Session::new("s1".into(), Some("w".into()), PathBuf::from("/tmp")))
        .await
        .expect("insert");

    let update = SessionUpdate {
        workspace_id: Some("other".into()),
        ..SessionUpdate::default()
    };
    assert!(store.update("s1", update).await.expect("update"));

    let loaded = store.get("s1").await.expect("get").expect("present");
    assert_eq!(loaded.workspace_id.as_deref(), Some("w"));
}

#[tokio::test]
async fn field_updates_on_unknown_session_report_false() {
    let store = MemorySessionStore::new();
    assert!(!store
        .update("nope", SessionUpdate::default())
        .await
        .expect("update"));
    assert!(!store
        .set_metadata("nope", RESUME_REFERENCE_KEY, "x")
        .await
        .expect("metadata"));
    let err = store
        .set_metadata("nope", "bad\"key", "x")
        .await
        .expect_err("quoted key");
    assert!(matches!(err, AppError::InvalidInput(_)), "got {err:?}");
}

#[tokio::test]
async fn history_returns_tail_in_order() {
    let store = MemorySessionStore::new();
    for i in 0..4 {
        store
            .append_message("s1", HistoryMessage::new("user", format!("m{i}")))
            .await
            .expect("append");
    }

    let tail = store.history("s1", 2).await.expect("history");
    assert_eq!(
        tail,
        vec![HistoryMessage::new("user", "m2"), HistoryMessage::new("user", "m3")]
    );
    assert!(store.history("unknown", 5).await.expect("history").is_empty());
}

#[tokio::test]
async fn config_workspaces_lookup_and_delete() {
    let registry = ConfigWorkspaces::new(vec![
        WorkspaceEntry {
            slug: "a".into(),
            directory: "/srv/a".into(),
            default_trust: None,
        },
        WorkspaceEntry {
            slug: "b".into(),
            directory: "/srv/b".into(),
            default_trust: None,
        },
    ]);

    assert_eq!(
        registry.get("a").await.expect("get").expect("a").directory,
        PathBuf::from("/srv/a")
    );
    assert!(registry.delete("a").await.expect("delete"));
    assert!(!registry.delete("a").await.expect("delete again"));
    assert!(registry.get("a").await.expect("get").is_none());

    let remaining: Vec<String> = registry
        .list()
        .await
        .expect("list")
        .into_iter()
        .map(|w| w.slug)
        .collect();
    assert_eq!(remaining, vec!["b"]);
}
