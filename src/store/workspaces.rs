//! Workspace registry seeded from `[[workspace]]` config entries.

use tokio::sync::RwLock;
use tracing::info;

use super::WorkspaceStore;
use crate::config::WorkspaceEntry;
use crate::{BoxFuture, Result};

/// [`WorkspaceStore`] backed by the configured workspace list.
///
/// Deletions last for the lifetime of the process; the config file is not
/// rewritten.
pub struct ConfigWorkspaces {
    entries: RwLock<Vec<WorkspaceEntry>>,
}

impl ConfigWorkspaces {
    /// Registry over `entries`.
    #[must_use]
    pub fn new(entries: Vec<WorkspaceEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

impl WorkspaceStore for ConfigWorkspaces {
    fn get(&self, slug: &str) -> BoxFuture<'_, Result<Option<WorkspaceEntry>>> {
        let slug = slug.to_owned();
        Box::pin(async move {
            Ok(self
                .entries
                .read()
                .await
                .iter()
                .find(|w| w.slug == slug)
                .cloned())
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<WorkspaceEntry>>> {
        Box::pin(async move { Ok(self.entries.read().await.clone()) })
    }

    fn delete(&self, slug: &str) -> BoxFuture<'_, Result<bool>> {
        let slug = slug.to_owned();
        Box::pin(async move {
            let mut entries = self.entries.write().await;
            let before = entries.len();
            entries.retain(|w| w.slug != slug);
            let removed = entries.len() != before;
            if removed {
                info!(slug, "workspace record deleted");
            }
            Ok(removed)
        })
    }
}
