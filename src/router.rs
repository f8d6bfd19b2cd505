//! Execution routing.
//!
//! Trusted turns run on the host. Untrusted turns run in their workspace's
//! container and nowhere else: if the container runtime is unreachable the
//! turn fails with `container-unavailable`. There is no host fallback.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use tracing::{error, info};

use crate::container::{ContainerManager, SandboxExecutor};
use crate::models::session::TrustLevel;
use crate::models::turn::TrustDecision;
use crate::runtime::direct::DirectRuntime;
use crate::runtime::TurnExecutor;
use crate::{AppError, Result};

/// Where a turn executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// On the host, in the session's working directory.
    Direct,
    /// In the container of workspace `slug`.
    Sandbox {
        /// Workspace slug.
        slug: String,
    },
}

impl Route {
    /// Stable key for per-route bookkeeping and logs.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Direct => "host".to_owned(),
            Self::Sandbox { slug } => format!("workspace:{slug}"),
        }
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Picks the runtime for each turn.
pub struct ExecutionRouter {
    manager: Arc<ContainerManager>,
    direct: Arc<DirectRuntime>,
}

impl ExecutionRouter {
    /// Router over the container manager and the host runtime.
    #[must_use]
    pub fn new(manager: Arc<ContainerManager>, direct: Arc<DirectRuntime>) -> Self {
        Self { manager, direct }
    }

    /// Decide where a turn with `decision` runs.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidInput` if an untrusted turn names no workspace.
    /// - `AppError::ContainerUnavailable` if an untrusted turn cannot reach
    ///   the container runtime.
    pub async fn route(&self, decision: &TrustDecision, workspace_id: Option<&str>) -> Result<Route> {
        match decision.effective_trust {
            TrustLevel::Trusted => {
                info!(source = ?decision.source, "routing turn to host");
                Ok(Route::Direct)
            }
            TrustLevel::Untrusted => {
                let slug = workspace_id.ok_or_else(|| {
                    AppError::InvalidInput("untrusted turn requires a workspace".into())
                })?;
                if !self.manager.runtime_available().await {
                    error!(slug, "container runtime unreachable, refusing untrusted turn");
                    return Err(AppError::ContainerUnavailable(format!(
                        "cannot run untrusted turn for {slug}: container runtime unreachable"
                    )));
                }
                info!(slug, source = ?decision.source, "routing turn to workspace container");
                Ok(Route::Sandbox {
                    slug: slug.to_owned(),
                })
            }
        }
    }

    /// Executor for `route`.
    #[must_use]
    pub fn executor(&self, route: &Route) -> Arc<dyn TurnExecutor> {
        match route {
            Route::Direct => Arc::clone(&self.direct) as Arc<dyn TurnExecutor>,
            Route::Sandbox { slug } => {
                Arc::new(SandboxExecutor::new(Arc::clone(&self.manager), slug.clone()))
            }
        }
    }
}
