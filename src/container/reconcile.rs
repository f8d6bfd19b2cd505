//! Startup reconciliation and periodic orphan pruning.
//!
//! Containers carrying the managed label survive restarts of this process.
//! On startup they are matched against the workspace registry: known ones
//! are stopped if still running and adopted, the rest are removed. A background task repeats
//! the orphan sweep for containers and storage whose workspace was deleted
//! out from under us.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::manager::ContainerManager;
use super::spec::container_name;
use crate::models::container::{ContainerStatus, WorkspaceContainer};
use crate::runtime::LABEL_MANAGED;
use crate::Result;

/// What a startup reconcile did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Slugs adopted as tracked-but-stopped.
    pub adopted: Vec<String>,
    /// Container names removed as orphans.
    pub removed: Vec<String>,
}

/// What a prune pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Container names removed.
    pub containers: Vec<String>,
    /// Slugs whose storage was deleted.
    pub storage: Vec<String>,
}

impl PruneReport {
    /// Whether nothing was removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.storage.is_empty()
    }
}

impl ContainerManager {
    async fn known_slugs(&self) -> Result<HashSet<String>> {
        Ok(self
            .workspaces
            .list()
            .await?
            .into_iter()
            .map(|w| w.slug)
            .collect())
    }

    /// Adopt or remove managed containers left by a previous process.
    ///
    /// Adopted containers are tracked as stopped, so one still running is
    /// stopped first; the next turn restarts it.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime listing, a stop, or the registry
    /// fails.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let known = self.known_slugs().await?;
        let listed = self.runtime.list_by_label(LABEL_MANAGED, "true").await?;
        let mut report = ReconcileReport::default();

        for container in listed {
            let adoptable = container.workspace.as_deref().filter(|slug| {
                known.contains(*slug) && container.name == container_name(&self.config, slug)
            });

            if let Some(slug) = adoptable {
                if container.state == "running" {
                    self.runtime
                        .stop(&container.name, self.config.stop_timeout())
                        .await?;
                    info!(slug, container = %container.name, "stopped container left running by a previous process");
                }
                let mut tracked = self.tracked.lock().await;
                tracked.entry(slug.to_owned()).or_insert_with(|| {
                    WorkspaceContainer::new(
                        slug.to_owned(),
                        container.name.clone(),
                        ContainerStatus::Stopped,
                    )
                });
                report.adopted.push(slug.to_owned());
                continue;
            }

            warn!(
                container = %container.name,
                workspace = ?container.workspace,
                "removing orphaned managed container"
            );
            if let Err(err) = self.runtime.stop(&container.name, self.config.stop_timeout()).await {
                warn!(container = %container.name, %err, "orphan stop failed");
            }
            self.runtime.remove(&container.name, true).await?;
            report.removed.push(container.name);
        }

        info!(
            adopted = report.adopted.len(),
            removed = report.removed.len(),
            "startup reconcile complete"
        );
        Ok(report)
    }

    /// Remove containers and storage whose workspace no longer exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime listing or the registry fails.
    /// Individual removal failures are logged and skipped.
    pub async fn prune_orphans(&self) -> Result<PruneReport> {
        let known = self.known_slugs().await?;
        let mut report = PruneReport::default();

        for container in self.runtime.list_by_label(LABEL_MANAGED, "true").await? {
            let slug = container.workspace.clone().unwrap_or_default();
            if known.contains(&slug) {
                continue;
            }
            if self.guard.active_execs(&slug) > 0 {
                continue;
            }
            let _lifecycle = self.guard.lock_lifecycle(&slug).await;
            match self.runtime.remove(&container.name, true).await {
                Ok(()) => {
                    self.tracked.lock().await.remove(&slug);
                    self.timers.lock().await.remove(&slug);
                    report.containers.push(container.name);
                }
                Err(err) => warn!(container = %container.name, %err, "orphan removal failed"),
            }
        }

        for slug in self.storage.list_slugs()? {
            if known.contains(&slug) {
                continue;
            }
            match self.storage.remove(&slug) {
                Ok(true) => report.storage.push(slug),
                Ok(false) => {}
                Err(err) => warn!(slug, %err, "orphan storage removal failed"),
            }
        }

        if !report.is_empty() {
            info!(
                containers = report.containers.len(),
                storage = report.storage.len(),
                "orphan prune complete"
            );
        }
        Ok(report)
    }
}

/// Spawn the periodic orphan prune task.
///
/// The first pass runs one `interval` after startup; reconcile already
/// covered the startup state.
#[must_use]
pub fn spawn_prune_task(
    manager: Arc<ContainerManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("prune task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = manager.prune_orphans().await {
                        error!(%err, "orphan prune failed");
                    }
                }
            }
        }
    })
}
