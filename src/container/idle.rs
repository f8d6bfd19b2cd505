//! Per-workspace idle timer.
//!
//! Each running container gets an [`IdleTimer`] that fires once after the
//! idle window passes without a [`reset`](IdleTimerHandle::reset). Expiry is
//! delivered on an mpsc channel; the container manager decides whether the
//! container can actually be stopped. After firing, the timer re-arms on
//! the next reset.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// Events emitted by idle timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleEvent {
    /// The workspace saw no exec activity for the idle window.
    Expired {
        /// Workspace slug.
        slug: String,
    },
}

/// Builder for a per-workspace idle timer.
pub struct IdleTimer {
    slug: String,
    idle_window: Duration,
    event_tx: mpsc::Sender<IdleEvent>,
    cancel: CancellationToken,
}

impl IdleTimer {
    /// Construct a timer (not started).
    #[must_use]
    pub fn new(
        slug: String,
        idle_window: Duration,
        event_tx: mpsc::Sender<IdleEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            slug,
            idle_window,
            event_tx,
            cancel,
        }
    }

    /// Spawn the timer task.
    #[must_use]
    pub fn spawn(self) -> IdleTimerHandle {
        let reset_notify = Arc::new(Notify::new());
        let cancel = self.cancel.clone();

        let join_handle = tokio::spawn(
            Self::run(
                self.slug.clone(),
                self.idle_window,
                self.event_tx,
                self.cancel,
                Arc::clone(&reset_notify),
            )
            .instrument(info_span!("idle_timer", slug = %self.slug)),
        );

        IdleTimerHandle {
            reset_notify,
            join_handle: Some(join_handle),
            cancel,
        }
    }

    async fn run(
        slug: String,
        idle_window: Duration,
        event_tx: mpsc::Sender<IdleEvent>,
        cancel: CancellationToken,
        reset_notify: Arc<Notify>,
    ) {
        loop {
            let fired = tokio::select! {
                () = cancel.cancelled() => {
                    debug!("idle timer cancelled");
                    return;
                }
                () = tokio::time::sleep(idle_window) => true,
                () = reset_notify.notified() => false,
            };

            if !fired {
                continue;
            }

            info!(idle_secs = idle_window.as_secs(), "workspace idle window elapsed");
            if event_tx
                .send(IdleEvent::Expired { slug: slug.clone() })
                .await
                .is_err()
            {
                return;
            }

            // Disarmed until the next reset.
            tokio::select! {
                () = cancel.cancelled() => return,
                () = reset_notify.notified() => {}
            }
        }
    }
}

/// Control handle for a running idle timer. Cancels the task on drop.
pub struct IdleTimerHandle {
    reset_notify: Arc<Notify>,
    join_handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl IdleTimerHandle {
    /// Restart the idle window (and re-arm a timer that already fired).
    pub fn reset(&self) {
        self.reset_notify.notify_one();
    }

    /// Whether the timer task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join_handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for IdleTimerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            handle.abort();
        }
    }
}
