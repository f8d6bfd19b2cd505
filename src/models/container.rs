//! Workspace container record tracked by the container manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Observed lifecycle status of a workspace container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    /// Being created or started.
    Starting,
    /// Running and ready for execs.
    Running,
    /// Exists but is not running.
    Stopped,
}

/// In-memory record of the single container serving a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceContainer {
    /// Workspace slug.
    pub slug: String,
    /// Container name used with the runtime.
    pub container_ref: String,
    /// Last known status.
    pub status: ContainerStatus,
    /// When this process first tracked the container.
    pub created_at: DateTime<Utc>,
    /// Last exec completion or lifecycle touch.
    pub last_activity_at: DateTime<Utc>,
}

impl WorkspaceContainer {
    /// Track a container in the given status.
    #[must_use]
    pub fn new(slug: String, container_ref: String, status: ContainerStatus) -> Self {
        let now = Utc::now();
        Self {
            slug,
            container_ref,
            status,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Record activity now.
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}
