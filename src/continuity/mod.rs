//! Session continuity across turns.
//!
//! Before each turn the engine's own transcript is looked up. If it exists the
//! engine is told to resume it; otherwise prior messages from the session
//! store are injected into the message; with neither the turn starts fresh.
//! A resume the engine rejects is reported to the caller and retried once
//! with history injection, so a turn never silently loses its context.

pub mod history;
pub mod transcript;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::{debug, info, info_span, warn, Instrument};

use self::history::inject_history;
use self::transcript::find_transcript;
use crate::models::event::TurnEvent;
use crate::models::session::{HistoryMessage, RESUME_REFERENCE_KEY};
use crate::models::turn::ExecutionRequest;
use crate::router::Route;
use crate::runtime::{TurnExecutor, EVENT_CHANNEL_CAPACITY};
use crate::storage::WorkspaceStorage;
use crate::store::SessionStore;
use crate::{AppError, Result};

/// How a turn picks up prior context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePlan {
    /// Resume the engine transcript with this id.
    Resume {
        /// Engine session id to resume.
        session_id: String,
    },
    /// Prefix the message with prior messages.
    InjectHistory {
        /// Messages to inject, oldest first.
        history: Vec<HistoryMessage>,
    },
    /// No prior context exists.
    Fresh,
}

impl ResumePlan {
    /// Short tag for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Resume { .. } => "resume",
            Self::InjectHistory { .. } => "inject-history",
            Self::Fresh => "fresh",
        }
    }
}

type TurnKey = (String, String);

/// Resume planning and the resume-failure fallback.
pub struct SessionContinuity {
    sessions: Arc<dyn SessionStore>,
    storage: WorkspaceStorage,
    container_workdir: String,
    history_limit: usize,
    first_turn_locks: StdMutex<HashMap<TurnKey, Arc<Mutex<()>>>>,
}

impl SessionContinuity {
    /// Continuity over `sessions`, probing transcripts in `storage`.
    ///
    /// `container_workdir` is the workspace mount point inside containers,
    /// which determines the engine's project directory name.
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        storage: WorkspaceStorage,
        container_workdir: impl Into<String>,
        history_limit: usize,
    ) -> Self {
        Self {
            sessions,
            storage,
            container_workdir: container_workdir.into(),
            history_limit,
            first_turn_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Decide how the next turn of `session_id` picks up prior context.
    ///
    /// # Errors
    ///
    /// Returns an error if the session store fails or the session id cannot
    /// name a transcript.
    pub async fn plan(&self, route: &Route, session_id: &str) -> Result<ResumePlan> {
        if let Some(resume_id) = self.lookup_transcript(route, session_id).await? {
            return Ok(ResumePlan::Resume {
                session_id: resume_id,
            });
        }

        let history = self
            .sessions
            .history(session_id, self.history_limit)
            .await?;
        if history.is_empty() {
            Ok(ResumePlan::Fresh)
        } else {
            Ok(ResumePlan::InjectHistory { history })
        }
    }

    async fn lookup_transcript(&self, route: &Route, session_id: &str) -> Result<Option<String>> {
        match route {
            Route::Sandbox { slug } => {
                let engine_dir = self.storage.engine_dir(slug)?;
                match find_transcript(&engine_dir, &self.container_workdir, session_id) {
                    Ok(found) => Ok(found.map(|_| session_id.to_owned())),
                    Err(AppError::PathViolation(msg)) => {
                        warn!(slug, session_id, reason = %msg, "transcript unusable, ignoring");
                        Ok(None)
                    }
                    Err(err) => Err(err),
                }
            }
            Route::Direct => Ok(self
                .sessions
                .get(session_id)
                .await?
                .and_then(|s| s.resume_reference().map(str::to_owned))),
        }
    }

    async fn lock_first_turn(&self, route: &Route, session_id: &str) -> OwnedMutexGuard<()> {
        let key = (route.key(), session_id.to_owned());
        let lock = {
            let mut locks = self
                .first_turn_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }

    fn apply_plan(&self, base: &ExecutionRequest, plan: &ResumePlan) -> ExecutionRequest {
        let mut request = base.clone();
        match plan {
            ResumePlan::Resume { session_id } => {
                request.resume_session_id = Some(session_id.clone());
            }
            ResumePlan::InjectHistory { history } => {
                request.resume_session_id = None;
                request.message = inject_history(history, &base.message, self.history_limit);
            }
            ResumePlan::Fresh => request.resume_session_id = None,
        }
        request
    }

    /// Run one turn with continuity applied.
    ///
    /// Turns without a transcript to resume are serialized per session, so
    /// two concurrent first turns cannot both start fresh transcripts.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails or the executor cannot start the
    /// invocation. Later failures arrive as `error` events.
    pub async fn run_turn(
        self: &Arc<Self>,
        executor: Arc<dyn TurnExecutor>,
        route: Route,
        base: ExecutionRequest,
    ) -> Result<mpsc::Receiver<TurnEvent>> {
        let session_id = base.session_id.clone();
        let mut plan = self.plan(&route, &session_id).await?;

        let first_turn = if matches!(plan, ResumePlan::Resume { .. }) {
            None
        } else {
            let guard = self.lock_first_turn(&route, &session_id).await;
            // The turn we waited on may have created the transcript.
            plan = self.plan(&route, &session_id).await?;
            Some(guard)
        };

        info!(session_id, plan = plan.label(), route = %route.key(), "continuity plan");
        let request = self.apply_plan(&base, &plan);
        let resuming = matches!(plan, ResumePlan::Resume { .. });
        let inner = executor.execute(request).await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let this = Arc::clone(self);
        let span = info_span!("continuity", session_id = %session_id);
        tokio::spawn(
            async move {
                let _first_turn = first_turn;
                if resuming {
                    this.forward_resumed(executor, base, inner, &tx).await;
                } else {
                    this.forward(&base.session_id, None, inner, &tx, false).await;
                }
            }
            .instrument(span),
        );
        Ok(rx)
    }

    /// Forward a resumed invocation, falling back to history injection if
    /// the engine rejects the resume before producing output.
    async fn forward_resumed(
        &self,
        executor: Arc<dyn TurnExecutor>,
        base: ExecutionRequest,
        mut inner: mpsc::Receiver<TurnEvent>,
        tx: &mpsc::Sender<TurnEvent>,
    ) {
        let mut held = Vec::new();
        while let Some(event) = inner.recv().await {
            match event {
                TurnEvent::ResumeFailed { reason } => {
                    warn!(session_id = %base.session_id, %reason, "engine rejected resume, falling back to history");
                    let _ = tx.send(TurnEvent::ResumeFailed { reason: reason.clone() }).await;
                    // Let the failed invocation finish and release its slot.
                    while inner.recv().await.is_some() {}
                    self.retry_with_history(executor, base, reason, tx).await;
                    return;
                }
                TurnEvent::SessionStart { .. } => held.push(event),
                other => {
                    for early in held.drain(..) {
                        let _ = tx.send(early).await;
                    }
                    self.forward(&base.session_id, Some(other), inner, tx, false)
                        .await;
                    return;
                }
            }
        }
        for early in held {
            let _ = tx.send(early).await;
        }
        report_cut_short(&base.session_id, tx).await;
    }

    async fn retry_with_history(
        &self,
        executor: Arc<dyn TurnExecutor>,
        base: ExecutionRequest,
        reason: String,
        tx: &mpsc::Sender<TurnEvent>,
    ) {
        let history = match self
            .sessions
            .history(&base.session_id, self.history_limit)
            .await
        {
            Ok(history) => history,
            Err(err) => {
                let _ = tx.send(TurnEvent::from_error(&err)).await;
                return;
            }
        };

        if history.is_empty() {
            let err = AppError::ResumeFailed(format!(
                "transcript unusable and no stored history to rebuild context: {reason}"
            ));
            let _ = tx.send(TurnEvent::from_error(&err)).await;
            return;
        }

        let request = self.apply_plan(&base, &ResumePlan::InjectHistory { history });
        match executor.execute(request).await {
            Ok(inner) => self.forward(&base.session_id, None, inner, tx, true).await,
            Err(err) => {
                let _ = tx.send(TurnEvent::from_error(&err)).await;
            }
        }
    }

    /// Forward `first` (if any) and then the rest of `inner`.
    ///
    /// The caller always sees a terminal event: a stream that closes without
    /// `done` or `error` is closed with an `engine` error.
    async fn forward(
        &self,
        session_id: &str,
        first: Option<TurnEvent>,
        mut inner: mpsc::Receiver<TurnEvent>,
        tx: &mpsc::Sender<TurnEvent>,
        degraded: bool,
    ) {
        let mut pending = first;
        let mut terminal = false;
        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => match inner.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };
            terminal = event.is_terminal();
            self.forward_one(session_id, event, tx, degraded).await;
        }
        if !terminal {
            report_cut_short(session_id, tx).await;
        }
    }

    async fn forward_one(
        &self,
        session_id: &str,
        event: TurnEvent,
        tx: &mpsc::Sender<TurnEvent>,
        degraded: bool,
    ) {
        let event = match event {
            TurnEvent::Done {
                session_id: resolved,
                ..
            } => {
                if let Err(err) = self.record_resume_reference(session_id, &resolved).await {
                    warn!(%err, "failed to record resume reference");
                }
                TurnEvent::Done {
                    session_id: resolved,
                    degraded,
                }
            }
            other => other,
        };
        if tx.send(event).await.is_err() {
            debug!("turn consumer gone");
        }
    }

    /// Store the engine's resolved session id on the caller session.
    async fn record_resume_reference(&self, session_id: &str, engine_session_id: &str) -> Result<()> {
        self.sessions
            .set_metadata(session_id, RESUME_REFERENCE_KEY, engine_session_id)
            .await
            .map(|_| ())
    }
}

async fn report_cut_short(session_id: &str, tx: &mpsc::Sender<TurnEvent>) {
    warn!(session_id, "engine stream closed without done or error");
    let err = AppError::Engine("turn ended without a result".into());
    let _ = tx.send(TurnEvent::from_error(&err)).await;
}
