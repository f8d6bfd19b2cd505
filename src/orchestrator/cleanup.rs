//! Workspace deletion.

use tracing::{info, info_span, Instrument};

use crate::config::validate_slug;
use crate::container::ContainerManager;
use crate::store::WorkspaceStore;
use crate::{AppError, Result};

/// What a workspace deletion removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletionReport {
    /// Storage existed and was deleted.
    pub storage_removed: bool,
    /// The workspace record existed and was deleted.
    pub record_removed: bool,
}

/// Delete a workspace: its container, its engine storage, then its record.
///
/// Refused while turns are in flight; new turns for the slug are refused
/// until the deletion completes. Storage is removed without following
/// symlinks.
///
/// # Errors
///
/// - `AppError::InvalidInput` for a malformed slug.
/// - `AppError::WorkspaceBusy` if turns are executing.
/// - `AppError::ContainerUnavailable` / `AppError::Runtime` if the container
///   cannot be removed.
/// - `AppError::PathViolation` if the storage directory is a symlink.
pub async fn delete_workspace(
    manager: &ContainerManager,
    workspaces: &dyn WorkspaceStore,
    slug: &str,
) -> Result<DeletionReport> {
    validate_slug(slug)?;
    let _retired = manager.guard().retire(slug)?;

    async {
        manager.stop_container(slug, true).await?;
        let storage_removed = manager.storage().remove(slug)?;
        let record_removed = workspaces.delete(slug).await?;

        info!(storage_removed, record_removed, "workspace deleted");
        Ok::<_, AppError>(DeletionReport {
            storage_removed,
            record_removed,
        })
    }
    .instrument(info_span!("delete_workspace", slug))
    .await
}
