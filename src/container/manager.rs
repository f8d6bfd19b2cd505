//! Workspace container lifecycle and exec dispatch.
//!
//! One long-lived container per workspace, created lazily on the first
//! untrusted turn and reused for every later turn in that workspace. The
//! manager is the only component that issues runtime commands.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::guard::ConcurrencyGuard;
use super::idle::{IdleEvent, IdleTimer, IdleTimerHandle};
use super::spec::{build_create_spec, container_name};
use crate::config::{validate_slug, ContainerConfig, WorkspaceEntry};
use crate::models::container::{ContainerStatus, WorkspaceContainer};
use crate::models::event::TurnEvent;
use crate::models::turn::ExecutionRequest;
use crate::protocol::reader::TurnSink;
use crate::protocol::{EngineRequest, ENV_AGENT_TYPE, ENV_REQUEST_ID, ENV_SESSION_ID};
use crate::runtime::{
    drive_invocation, report_incomplete, ContainerRuntime, ExecSpec, TurnExecutor,
    EVENT_CHANNEL_CAPACITY,
};
use crate::storage::WorkspaceStorage;
use crate::store::WorkspaceStore;
use crate::{AppError, BoxFuture, Result};

const IDLE_CHANNEL_CAPACITY: usize = 64;

enum ExecAttempt {
    Finished,
    /// The container was not running and nothing reached the consumer.
    ContainerGone(String),
}

/// Owns every workspace container this process manages.
pub struct ContainerManager {
    pub(super) runtime: Arc<dyn ContainerRuntime>,
    pub(super) config: ContainerConfig,
    pub(super) storage: WorkspaceStorage,
    pub(super) workspaces: Arc<dyn WorkspaceStore>,
    pub(super) guard: ConcurrencyGuard,
    pub(super) tracked: Mutex<HashMap<String, WorkspaceContainer>>,
    pub(super) timers: Mutex<HashMap<String, IdleTimerHandle>>,
    agent_type: String,
    user: Option<String>,
    idle_tx: mpsc::Sender<IdleEvent>,
    idle_rx: Mutex<Option<mpsc::Receiver<IdleEvent>>>,
    cancel: CancellationToken,
}

impl ContainerManager {
    /// Manager issuing commands through `runtime`.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: ContainerConfig,
        agent_type: impl Into<String>,
        storage: WorkspaceStorage,
        workspaces: Arc<dyn WorkspaceStore>,
    ) -> Self {
        let (idle_tx, idle_rx) = mpsc::channel(IDLE_CHANNEL_CAPACITY);
        let max_execs = usize::try_from(config.max_concurrent_execs).unwrap_or(usize::MAX);
        Self {
            runtime,
            guard: ConcurrencyGuard::new(max_execs),
            config,
            storage,
            workspaces,
            tracked: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            agent_type: agent_type.into(),
            user: super::spec::host_user(),
            idle_tx,
            idle_rx: Mutex::new(Some(idle_rx)),
            cancel: CancellationToken::new(),
        }
    }

    /// Override the `uid:gid` containers run as (`None` uses the image default).
    #[must_use]
    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    /// Whether the container runtime is reachable.
    pub async fn runtime_available(&self) -> bool {
        self.runtime.is_available().await
    }

    /// Per-workspace storage.
    #[must_use]
    pub fn storage(&self) -> &WorkspaceStorage {
        &self.storage
    }

    /// Concurrency guard shared with workspace deletion.
    #[must_use]
    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    /// Container settings.
    #[must_use]
    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Turns executing (or queued) in `slug`.
    #[must_use]
    pub fn active_execs(&self, slug: &str) -> usize {
        self.guard.active_execs(slug)
    }

    /// Tracked containers, sorted by slug.
    pub async fn snapshot(&self) -> Vec<WorkspaceContainer> {
        let mut all: Vec<_> = self.tracked.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.slug.cmp(&b.slug));
        all
    }

    /// Ensure the container for `slug` exists and is running.
    ///
    /// Creates it on first use, starts it if it was stopped, and recreates
    /// it if it exited unexpectedly. Returns the container name.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidInput` for a malformed slug.
    /// - `AppError::NotFound` if the workspace is unknown.
    /// - `AppError::ContainerUnavailable` if the runtime is unreachable.
    /// - `AppError::Runtime` if a lifecycle command fails.
    pub async fn ensure_running(&self, slug: &str) -> Result<String> {
        validate_slug(slug)?;
        if let Some(name) = self.running_ref(slug).await {
            self.reset_idle(slug).await;
            return Ok(name);
        }

        let _lifecycle = self.guard.lock_lifecycle(slug).await;
        // Another caller may have brought it up while we waited.
        if let Some(name) = self.running_ref(slug).await {
            self.reset_idle(slug).await;
            return Ok(name);
        }
        self.ensure_locked(slug).await
    }

    async fn running_ref(&self, slug: &str) -> Option<String> {
        self.tracked
            .lock()
            .await
            .get(slug)
            .filter(|c| c.status == ContainerStatus::Running)
            .map(|c| c.container_ref.clone())
    }

    /// Bring the container up. Caller holds the lifecycle lock.
    async fn ensure_locked(&self, slug: &str) -> Result<String> {
        let name = container_name(&self.config, slug);
        let workspace = self
            .workspaces
            .get(slug)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("unknown workspace: {slug}")))?;
        if !workspace.directory.is_dir() {
            return Err(AppError::NotFound(format!(
                "workspace directory missing: {}",
                workspace.directory.display()
            )));
        }

        if let Err(err) = self.bring_up(slug, &name, &workspace).await {
            self.tracked.lock().await.remove(slug);
            return Err(err);
        }

        self.set_status(slug, &name, ContainerStatus::Running).await;
        self.reset_idle(slug).await;
        Ok(name)
    }

    async fn bring_up(&self, slug: &str, name: &str, workspace: &WorkspaceEntry) -> Result<()> {
        let state = self.runtime.inspect(name).await?;
        self.set_status(slug, name, ContainerStatus::Starting).await;

        match state {
            None => self.create(slug, workspace).await,
            Some(state) if state.running => {
                debug!(slug, container = name, "adopting running container");
                Ok(())
            }
            Some(state) if state.is_restartable() => {
                if let Err(err) = self.runtime.start(name).await {
                    warn!(slug, container = name, %err, "start failed, recreating");
                    self.runtime.remove(name, true).await?;
                    return self.create(slug, workspace).await;
                }
                info!(slug, container = name, "workspace container restarted");
                Ok(())
            }
            Some(state) => {
                warn!(
                    slug,
                    container = name,
                    status = %state.status,
                    exit_code = ?state.exit_code,
                    "container exited unexpectedly, recreating"
                );
                self.runtime.remove(name, true).await?;
                self.create(slug, workspace).await
            }
        }
    }

    async fn create(&self, slug: &str, workspace: &WorkspaceEntry) -> Result<()> {
        let engine_dir = self.storage.ensure(slug)?;
        let spec = build_create_spec(
            &self.config,
            slug,
            &workspace.directory,
            &engine_dir,
            self.user.clone(),
        );
        self.runtime.create(spec).await?;
        info!(slug, image = %self.config.image, "workspace container created");
        Ok(())
    }

    async fn set_status(&self, slug: &str, name: &str, status: ContainerStatus) {
        let mut tracked = self.tracked.lock().await;
        let entry = tracked.entry(slug.to_owned()).or_insert_with(|| {
            WorkspaceContainer::new(slug.to_owned(), name.to_owned(), status)
        });
        entry.container_ref = name.to_owned();
        entry.status = status;
        entry.touch();
    }

    /// Replace the dead container for `slug` with a fresh one.
    ///
    /// Several execs can find the same container dead; the first to take
    /// the lifecycle lock rebuilds it and the rest reuse the replacement
    /// rather than removing it again.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be inspected, removed or
    /// brought back up.
    pub async fn recover_container(&self, slug: &str) -> Result<String> {
        validate_slug(slug)?;
        let _lifecycle = self.guard.lock_lifecycle(slug).await;
        let name = container_name(&self.config, slug);
        if self.running_ref(slug).await.is_some() {
            let alive = self
                .runtime
                .inspect(&name)
                .await?
                .is_some_and(|state| state.running);
            if alive {
                debug!(slug, container = %name, "container already recovered");
                self.reset_idle(slug).await;
                return Ok(name);
            }
        }
        self.runtime.remove(&name, true).await?;
        self.tracked.lock().await.remove(slug);
        self.ensure_locked(slug).await
    }

    /// Restart the idle window for `slug`, starting a timer if needed.
    pub async fn reset_idle(&self, slug: &str) {
        let mut timers = self.timers.lock().await;
        if let Some(timer) = timers.get(slug).filter(|t| !t.is_finished()) {
            timer.reset();
            return;
        }
        let timer = IdleTimer::new(
            slug.to_owned(),
            self.config.idle_timeout(),
            self.idle_tx.clone(),
            self.cancel.child_token(),
        )
        .spawn();
        timers.insert(slug.to_owned(), timer);
    }

    /// Run one message through the engine inside the workspace container.
    ///
    /// Waits for an exec slot, ensures the container runs, then streams the
    /// engine's events. A container found dead before any event was
    /// delivered is recreated and the exec retried once.
    ///
    /// # Errors
    ///
    /// Returns an error if no slot can be taken or the container cannot be
    /// brought up. Failures after dispatch arrive as `error` events.
    pub async fn exec_message(
        self: &Arc<Self>,
        slug: &str,
        request: ExecutionRequest,
    ) -> Result<mpsc::Receiver<TurnEvent>> {
        validate_slug(slug)?;
        let permit = self.guard.acquire_exec(slug).await?;
        let container = self.ensure_running(slug).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let this = Arc::clone(self);
        let slug = slug.to_owned();
        let span = info_span!(
            "sandbox_turn",
            slug = %slug,
            session_id = %request.session_id,
            request_id = %request.request_id
        );

        tokio::spawn(
            async move {
                let mut sink = TurnSink::new(tx);
                this.run_exec(&slug, container, &request, &mut sink).await;
                drop(permit);
                this.record_activity(&slug).await;
            }
            .instrument(span),
        );

        Ok(rx)
    }

    async fn run_exec(
        &self,
        slug: &str,
        mut container: String,
        request: &ExecutionRequest,
        sink: &mut TurnSink,
    ) {
        let wire = EngineRequest::from(request);
        for attempt in 0..2 {
            match self.exec_once(slug, &container, request, &wire, sink).await {
                Ok(ExecAttempt::Finished) => return,
                Ok(ExecAttempt::ContainerGone(reason)) if attempt == 0 => {
                    warn!(container = %container, %reason, "container not running, recreating and retrying exec");
                    match self.recover_container(slug).await {
                        Ok(name) => container = name,
                        Err(err) => {
                            error!(%err, "container recreation failed");
                            sink.send(TurnEvent::from_error(&err)).await;
                            return;
                        }
                    }
                }
                Ok(ExecAttempt::ContainerGone(reason)) => {
                    let err = AppError::ContainerCrashed(reason);
                    error!(%err, "exec retry failed");
                    sink.send(TurnEvent::from_error(&err)).await;
                    return;
                }
                Err(err) => {
                    error!(%err, "exec failed");
                    sink.send(TurnEvent::from_error(&err)).await;
                    return;
                }
            }
        }
    }

    async fn exec_once(
        &self,
        slug: &str,
        container: &str,
        request: &ExecutionRequest,
        wire: &EngineRequest,
        sink: &mut TurnSink,
    ) -> Result<ExecAttempt> {
        let spec = ExecSpec {
            container: container.to_owned(),
            command: self.config.engine_command.clone(),
            env: vec![
                (ENV_SESSION_ID.to_owned(), request.session_id.clone()),
                (ENV_AGENT_TYPE.to_owned(), self.agent_type.clone()),
                (ENV_REQUEST_ID.to_owned(), request.request_id.clone()),
            ],
            workdir: Some(self.config.workdir.clone()),
        };

        let process = match self.runtime.exec(spec).await {
            Ok(process) => process,
            Err(err) => {
                if self.container_gone(slug, container).await {
                    return Ok(ExecAttempt::ContainerGone(err.to_string()));
                }
                return Err(err);
            }
        };

        let (outcome, exit) = drive_invocation(
            &request.request_id,
            process,
            wire,
            sink,
            self.config.exec_timeout(),
        )
        .await?;

        let interrupted = !outcome.saw_done && !outcome.timed_out && !outcome.consumer_gone;
        if interrupted && !exit.success() && self.container_gone(slug, container).await {
            let reason = format!(
                "{container} stopped during exec (exit {:?}): {}",
                exit.code,
                exit.stderr.trim()
            );
            if outcome.forwarded == 0 {
                return Ok(ExecAttempt::ContainerGone(reason));
            }
            let err = AppError::ContainerCrashed(reason);
            sink.send(TurnEvent::from_error(&err)).await;
            return Ok(ExecAttempt::Finished);
        }

        report_incomplete(&outcome, &exit, sink).await;
        Ok(ExecAttempt::Finished)
    }

    /// Whether `container` is confirmed not running; marks it stopped if so.
    async fn container_gone(&self, slug: &str, container: &str) -> bool {
        let gone = match self.runtime.inspect(container).await {
            Ok(Some(state)) => !state.running,
            Ok(None) => true,
            Err(err) => {
                warn!(container, %err, "cannot inspect container after exec failure");
                false
            }
        };
        if gone {
            if let Some(entry) = self.tracked.lock().await.get_mut(slug) {
                entry.status = ContainerStatus::Stopped;
            }
        }
        gone
    }

    async fn record_activity(&self, slug: &str) {
        let running = {
            let mut tracked = self.tracked.lock().await;
            tracked.get_mut(slug).is_some_and(|entry| {
                entry.touch();
                entry.status == ContainerStatus::Running
            })
        };
        if running {
            self.reset_idle(slug).await;
        }
    }

    /// Stop the container for `slug`, optionally removing it.
    ///
    /// Stopping keeps the container for a fast restart; removing also drops
    /// tracking. Missing containers are not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ContainerUnavailable` or `AppError::Runtime` if the
    /// runtime command fails.
    pub async fn stop_container(&self, slug: &str, remove: bool) -> Result<()> {
        validate_slug(slug)?;
        let _lifecycle = self.guard.lock_lifecycle(slug).await;
        self.stop_locked(slug, remove).await
    }

    pub(super) async fn stop_locked(&self, slug: &str, remove: bool) -> Result<()> {
        let name = container_name(&self.config, slug);
        self.timers.lock().await.remove(slug);

        let stopped = self.runtime.stop(&name, self.config.stop_timeout()).await;
        if remove {
            if let Err(err) = &stopped {
                warn!(slug, %err, "graceful stop failed, forcing removal");
            }
            self.runtime.remove(&name, true).await?;
            self.tracked.lock().await.remove(slug);
            info!(slug, container = %name, "workspace container removed");
            return Ok(());
        }

        stopped?;
        if let Some(entry) = self.tracked.lock().await.get_mut(slug) {
            entry.status = ContainerStatus::Stopped;
            entry.touch();
        }
        info!(slug, container = %name, "workspace container stopped");
        Ok(())
    }

    /// Stop `slug` unless a turn is in flight.
    ///
    /// The tracked status is flipped to stopped before the busy check, so a
    /// turn arriving concurrently waits on the lifecycle lock instead of
    /// exec'ing into a container that is going away.
    async fn stop_if_idle(&self, slug: &str) -> Result<bool> {
        let lifecycle = self.guard.lock_lifecycle(slug).await;
        {
            let mut tracked = self.tracked.lock().await;
            match tracked.get_mut(slug) {
                Some(entry) if entry.status == ContainerStatus::Running => {
                    entry.status = ContainerStatus::Stopped;
                }
                _ => return Ok(false),
            }
        }

        if self.guard.active_execs(slug) > 0 {
            if let Some(entry) = self.tracked.lock().await.get_mut(slug) {
                entry.status = ContainerStatus::Running;
            }
            drop(lifecycle);
            debug!(slug, "idle expiry skipped, execs in flight");
            self.reset_idle(slug).await;
            return Ok(false);
        }

        self.stop_locked(slug, false).await?;
        Ok(true)
    }

    /// Stop every tracked container, whatever its cached status. Used on
    /// shutdown.
    pub async fn stop_all(&self) {
        let slugs: Vec<String> = self.tracked.lock().await.keys().cloned().collect();

        for slug in slugs {
            if let Err(err) = self.stop_container(&slug, false).await {
                warn!(slug, %err, "failed to stop container during shutdown");
            }
        }
    }

    /// Spawn the idle-expiry consumer. Returns `None` if already started.
    pub async fn spawn_idle_consumer(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.idle_rx.lock().await.take()?;
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();

        Some(tokio::spawn(
            async move {
                loop {
                    let event = tokio::select! {
                        () = cancel.cancelled() => break,
                        event = rx.recv() => event,
                    };
                    let Some(IdleEvent::Expired { slug }) = event else {
                        break;
                    };
                    match this.stop_if_idle(&slug).await {
                        Ok(true) => info!(slug, "idle container stopped"),
                        Ok(false) => {}
                        Err(err) => warn!(slug, %err, "idle stop failed"),
                    }
                }
                debug!("idle consumer exiting");
            }
            .instrument(info_span!("idle_consumer")),
        ))
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); background tasks
    /// watch it.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop all containers and end background tasks.
    pub async fn shutdown(&self) {
        self.stop_all().await;
        self.cancel.cancel();
        self.timers.lock().await.clear();
    }
}

/// [`TurnExecutor`] running turns inside one workspace's container.
pub struct SandboxExecutor {
    manager: Arc<ContainerManager>,
    slug: String,
}

impl SandboxExecutor {
    /// Executor for `slug`.
    #[must_use]
    pub fn new(manager: Arc<ContainerManager>, slug: impl Into<String>) -> Self {
        Self {
            manager,
            slug: slug.into(),
        }
    }
}

impl TurnExecutor for SandboxExecutor {
    fn execute(&self, request: ExecutionRequest) -> BoxFuture<'_, Result<mpsc::Receiver<TurnEvent>>> {
        Box::pin(async move { self.manager.exec_message(&self.slug, request).await })
    }
}
