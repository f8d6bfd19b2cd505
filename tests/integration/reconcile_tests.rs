//! Integration tests for startup reconciliation and orphan pruning.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use parachute_sandbox::container::reconcile::spawn_prune_task;
use parachute_sandbox::models::container::ContainerStatus;

use super::test_helpers::{harness, CONTAINER, SLUG};

#[tokio::test]
async fn running_container_is_stopped_and_adopted() {
    let h = harness();
    h.runtime.insert_managed(CONTAINER, Some(SLUG), true);

    let report = h.manager.reconcile().await.expect("reconcile");

    assert_eq!(report.adopted, vec![SLUG.to_owned()]);
    assert!(report.removed.is_empty());
    let snapshot = h.manager.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].status, ContainerStatus::Stopped);
    assert_eq!(h.runtime.count("stop"), 1);
    let container = h.runtime.container(CONTAINER).expect("kept");
    assert!(!container.running, "adopted container must not keep running");
}

#[tokio::test]
async fn stopped_container_is_adopted_without_stop() {
    let h = harness();
    h.runtime.insert_managed(CONTAINER, Some(SLUG), false);

    let report = h.manager.reconcile().await.expect("reconcile");

    assert_eq!(report.adopted, vec![SLUG.to_owned()]);
    assert_eq!(h.runtime.count("stop"), 0);
    assert_eq!(h.manager.snapshot().await[0].status, ContainerStatus::Stopped);
}

#[tokio::test]
async fn adopted_container_is_restarted_without_create() {
    let h = harness();
    h.runtime.insert_managed(CONTAINER, Some(SLUG), true);
    h.manager.reconcile().await.expect("reconcile");

    h.manager.ensure_running(SLUG).await.expect("running");

    assert_eq!(h.runtime.count("create"), 0);
    assert_eq!(h.runtime.count("start"), 1);
    assert!(h.runtime.container(CONTAINER).expect("kept").running);
    assert_eq!(h.manager.snapshot().await[0].status, ContainerStatus::Running);
}

#[tokio::test]
async fn stop_all_covers_containers_tracked_as_stopped() {
    let h = harness();
    h.runtime.insert_managed(CONTAINER, Some(SLUG), false);
    h.manager.reconcile().await.expect("reconcile");

    h.manager.stop_all().await;

    assert_eq!(h.runtime.count("stop"), 1);
    assert!(!h.runtime.container(CONTAINER).expect("kept").running);
}

#[tokio::test]
async fn orphaned_containers_are_removed() {
    let h = harness();
    h.runtime
        .insert_managed("parachute-ws-deleted", Some("deleted"), true);
    h.runtime.insert_managed("parachute-ws-unlabelled", None, false);
    // Labelled for a known workspace but not under the name we would give it.
    h.runtime
        .insert_managed("impostor", Some(SLUG), false);

    let report = h.manager.reconcile().await.expect("reconcile");

    assert!(report.adopted.is_empty());
    assert_eq!(report.removed.len(), 3, "removed: {:?}", report.removed);
    assert!(h.runtime.container_names().is_empty());
    assert!(h.manager.snapshot().await.is_empty());
}

#[tokio::test]
async fn prune_removes_containers_and_storage_of_deleted_workspaces() {
    let h = harness();
    h.runtime
        .insert_managed("parachute-ws-deleted", Some("deleted"), false);
    h.manager.storage().ensure("deleted").expect("orphan storage");
    h.manager.storage().ensure(SLUG).expect("live storage");

    let report = h.manager.prune_orphans().await.expect("prune");

    assert_eq!(report.containers, vec!["parachute-ws-deleted".to_owned()]);
    assert_eq!(report.storage, vec!["deleted".to_owned()]);
    assert!(h
        .manager
        .storage()
        .workspace_dir(SLUG)
        .expect("slug")
        .is_dir());
    assert!(!h
        .manager
        .storage()
        .workspace_dir("deleted")
        .expect("slug")
        .exists());
}

#[tokio::test]
async fn prune_with_nothing_orphaned_is_empty() {
    let h = harness();
    h.manager.ensure_running(SLUG).await.expect("running");

    let report = h.manager.prune_orphans().await.expect("prune");

    assert!(report.is_empty(), "report: {report:?}");
    assert!(h.runtime.container(CONTAINER).is_some());
}

#[tokio::test]
async fn prune_task_stops_on_cancel() {
    let h = harness();
    let cancel = CancellationToken::new();
    let handle = spawn_prune_task(
        std::sync::Arc::clone(&h.manager),
        Duration::from_secs(3600),
        cancel.clone(),
    );

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("prune task should exit promptly")
        .expect("prune task should not panic");
}

#[tokio::test]
async fn orchestrator_start_reconciles_and_shutdown_stops_tasks() {
    let h = harness();
    h.runtime.insert_managed(CONTAINER, Some(SLUG), true);

    let handles = h.orchestrator.start().await;
    assert_eq!(h.manager.snapshot().await.len(), 1);

    h.manager.ensure_running(SLUG).await.expect("running");
    h.orchestrator.shutdown().await;
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("background task exits on shutdown")
            .expect("background task should not panic");
    }
    assert!(!h.runtime.container(CONTAINER).expect("kept").running);
}
