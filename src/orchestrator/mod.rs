//! Turn orchestration.
//!
//! [`TurnOrchestrator`] is the composition root: it resolves trust,
//! records trust and working directory on the session, routes the turn,
//! and hands it to session continuity. It also owns startup reconciliation,
//! background tasks, and shutdown.

pub mod cleanup;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::container::reconcile::spawn_prune_task;
use crate::container::ContainerManager;
use crate::continuity::transcript::validate_session_id;
use crate::continuity::SessionContinuity;
use crate::models::container::WorkspaceContainer;
use crate::models::event::TurnEvent;
use crate::models::session::SessionUpdate;
use crate::models::turn::{ExecutionRequest, TurnRequest};
use crate::router::ExecutionRouter;
use crate::runtime::direct::DirectRuntime;
use crate::runtime::ContainerRuntime;
use crate::storage::WorkspaceStorage;
use crate::store::{SessionStore, WorkspaceStore};
use crate::trust::{TrustInputs, TrustResolver};
use crate::{AppError, Result};

use self::cleanup::DeletionReport;

/// Runs turns end to end.
pub struct TurnOrchestrator {
    sessions: Arc<dyn SessionStore>,
    workspaces: Arc<dyn WorkspaceStore>,
    manager: Arc<ContainerManager>,
    router: ExecutionRouter,
    continuity: Arc<SessionContinuity>,
    trust: TrustResolver,
    prune_interval: std::time::Duration,
}

impl TurnOrchestrator {
    /// Wire every component from `config`.
    #[must_use]
    pub fn new(
        config: &GlobalConfig,
        runtime: Arc<dyn ContainerRuntime>,
        sessions: Arc<dyn SessionStore>,
        workspaces: Arc<dyn WorkspaceStore>,
    ) -> Self {
        let storage = WorkspaceStorage::new(config.sandbox_storage_root());
        let manager = Arc::new(ContainerManager::new(
            runtime,
            config.container.clone(),
            config.engine.agent_type.clone(),
            storage.clone(),
            Arc::clone(&workspaces),
        ));
        Self::with_manager(config, manager, sessions, workspaces)
    }

    /// Wire around an already-built container manager.
    #[must_use]
    pub fn with_manager(
        config: &GlobalConfig,
        manager: Arc<ContainerManager>,
        sessions: Arc<dyn SessionStore>,
        workspaces: Arc<dyn WorkspaceStore>,
    ) -> Self {
        let direct = Arc::new(DirectRuntime::new(
            config.engine.clone(),
            config.container.exec_timeout(),
        ));
        let continuity = Arc::new(SessionContinuity::new(
            Arc::clone(&sessions),
            manager.storage().clone(),
            config.container.workdir.clone(),
            config.engine.history_turn_limit,
        ));
        Self {
            router: ExecutionRouter::new(Arc::clone(&manager), direct),
            sessions,
            workspaces,
            manager,
            continuity,
            trust: TrustResolver::new(config.default_trust),
            prune_interval: config.container.prune_interval(),
        }
    }

    /// The container manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<ContainerManager> {
        &self.manager
    }

    /// Run one turn, generating a request id.
    ///
    /// # Errors
    ///
    /// See [`submit_turn_with_id`](Self::submit_turn_with_id).
    pub async fn submit_turn(&self, request: TurnRequest) -> Result<mpsc::Receiver<TurnEvent>> {
        self.submit_turn_with_id(request, uuid::Uuid::new_v4().to_string())
            .await
    }

    /// Run one turn. Events stream on the returned receiver; the last one is
    /// `done` or `error`.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidInput` for an unusable session id, or an untrusted
    ///   turn without a workspace.
    /// - `AppError::NotFound` for an unknown session.
    /// - `AppError::ContainerUnavailable` for an untrusted turn when the
    ///   container runtime is unreachable.
    pub async fn submit_turn_with_id(
        &self,
        request: TurnRequest,
        request_id: String,
    ) -> Result<mpsc::Receiver<TurnEvent>> {
        let span = info_span!(
            "submit_turn",
            session_id = %request.session_id,
            request_id = %request_id
        );
        self.submit_inner(request, request_id).instrument(span).await
    }

    async fn submit_inner(
        &self,
        request: TurnRequest,
        request_id: String,
    ) -> Result<mpsc::Receiver<TurnEvent>> {
        validate_session_id(&request.session_id)?;
        let session = self
            .sessions
            .get(&request.session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("unknown session: {}", request.session_id)))?;

        let workspace_id = request
            .workspace_id
            .clone()
            .or_else(|| session.workspace_id.clone());
        let workspace_default = match workspace_id.as_deref() {
            Some(slug) => self
                .workspaces
                .get(slug)
                .await?
                .and_then(|w| w.default_trust),
            None => None,
        };

        let decision = self.trust.resolve(TrustInputs {
            turn_override: request.trust_override,
            session: session.trust_level,
            workspace: workspace_default,
        });
        info!(
            trust = %decision.effective_trust,
            source = ?decision.source,
            "trust resolved"
        );

        // Write only the fields this turn owns.
        let update = SessionUpdate {
            trust_level: request
                .trust_override
                .filter(|level| session.trust_level != Some(*level)),
            workspace_id: workspace_id
                .clone()
                .filter(|_| session.workspace_id.is_none()),
            working_directory: (session.working_directory != request.working_directory)
                .then(|| request.working_directory.clone()),
        };
        if !update.is_empty() {
            self.sessions.update(&session.id, update).await?;
        }

        let route = self.router.route(&decision, workspace_id.as_deref()).await?;
        let executor = self.router.executor(&route);
        let exec_request = ExecutionRequest {
            message: request.message,
            session_id: request.session_id,
            resume_session_id: None,
            working_directory: request.working_directory,
            capability_config: request.capability_config,
            request_id,
        };
        self.continuity.run_turn(executor, route, exec_request).await
    }

    /// Delete a workspace's container, storage and record.
    ///
    /// # Errors
    ///
    /// See [`cleanup::delete_workspace`].
    pub async fn delete_workspace(&self, slug: &str) -> Result<DeletionReport> {
        cleanup::delete_workspace(&self.manager, self.workspaces.as_ref(), slug).await
    }

    /// Tracked containers.
    pub async fn status(&self) -> Vec<WorkspaceContainer> {
        self.manager.snapshot().await
    }

    /// Reconcile with the runtime and start background tasks.
    ///
    /// An unreachable runtime is logged, not fatal: trusted turns still work
    /// and untrusted ones fail individually.
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        if self.manager.runtime_available().await {
            if let Err(err) = self.manager.reconcile().await {
                warn!(%err, "startup reconcile failed");
            }
        } else {
            warn!("container runtime unreachable at startup, untrusted turns will fail");
        }

        let mut handles = Vec::new();
        if let Some(handle) = self.manager.spawn_idle_consumer().await {
            handles.push(handle);
        }
        handles.push(spawn_prune_task(
            Arc::clone(&self.manager),
            self.prune_interval,
            self.manager.cancel_token(),
        ));
        handles
    }

    /// Stop all containers and background tasks.
    pub async fn shutdown(&self) {
        info!("stopping workspace containers");
        self.manager.shutdown().await;
    }
}
