//! Per-workspace engine storage on the host.
//!
//! Layout under the storage root:
//!
//! ```text
//! {root}/{slug}/engine/   mounted at {home}/.claude inside the container
//! ```
//!
//! The engine's transcripts live below `engine/`, so they survive container
//! recreation. Directories are created owner-only.

pub mod path_safety;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::validate_slug;
use crate::{AppError, Result};

use self::path_safety::{lookup_no_follow, remove_tree_no_follow, Lookup};

/// Name of the engine state directory inside a workspace's storage.
pub const ENGINE_DIR: &str = "engine";

/// Host-side storage root for all workspace containers.
#[derive(Debug, Clone)]
pub struct WorkspaceStorage {
    root: PathBuf,
}

impl WorkspaceStorage {
    /// Storage rooted at `root` (created lazily).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything for `slug`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for a malformed slug.
    pub fn workspace_dir(&self, slug: &str) -> Result<PathBuf> {
        validate_slug(slug)?;
        Ok(self.root.join(slug))
    }

    /// Engine state directory for `slug` (the container's `.claude` mount).
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for a malformed slug.
    pub fn engine_dir(&self, slug: &str) -> Result<PathBuf> {
        Ok(self.workspace_dir(slug)?.join(ENGINE_DIR))
    }

    /// Create the engine state directory for `slug` if needed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::PathViolation` if any existing component is a
    /// symlink, or `AppError::Io` if creation fails.
    pub fn ensure(&self, slug: &str) -> Result<PathBuf> {
        validate_slug(slug)?;
        create_private_dir(&self.root)?;

        let relative = Path::new(slug).join(ENGINE_DIR);
        if lookup_no_follow(&self.root, &relative)? == Lookup::Missing {
            create_private_dir(&self.root.join(slug))?;
            create_private_dir(&self.root.join(&relative))?;
        }
        Ok(self.root.join(relative))
    }

    /// Delete all storage for `slug`. Returns `false` if none existed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::PathViolation` if the workspace directory is a
    /// symlink, or `AppError::Io` if removal fails.
    pub fn remove(&self, slug: &str) -> Result<bool> {
        let dir = self.workspace_dir(slug)?;
        let removed = remove_tree_no_follow(&dir)?;
        if removed {
            info!(slug, path = %dir.display(), "workspace storage removed");
        }
        Ok(removed)
    }

    /// Slugs that currently have storage on disk.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the root cannot be read.
    pub fn list_slugs(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut slugs = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if validate_slug(&name).is_ok() {
                slugs.push(name);
            } else {
                warn!(entry = %name, "ignoring unexpected entry in storage root");
            }
        }
        slugs.sort();
        Ok(slugs)
    }
}

fn create_private_dir(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(path)
        .map_err(|err| AppError::Io(format!("failed to create {}: {err}", path.display())))
}
