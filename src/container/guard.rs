//! Per-workspace concurrency control.
//!
//! Two independent mechanisms per slug:
//! - a lifecycle lock serializing create/start/stop/remove, so two callers
//!   never race to create the same container;
//! - a counting semaphore bounding concurrent execs.
//!
//! An active-exec counter backs the busy check used by workspace deletion.
//! A slug being deleted is *retired*: new execs are refused until the
//! deletion finishes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::{AppError, Result};

#[derive(Default)]
struct SlugState {
    lifecycle: HashMap<String, Arc<AsyncMutex<()>>>,
    semaphores: HashMap<String, Arc<Semaphore>>,
    active: HashMap<String, Arc<AtomicUsize>>,
    retired: HashSet<String>,
}

/// Lifecycle locks, exec semaphores and in-flight counters keyed by slug.
pub struct ConcurrencyGuard {
    max_execs: usize,
    state: Arc<Mutex<SlugState>>,
}

impl ConcurrencyGuard {
    /// Guard allowing `max_execs` concurrent execs per workspace.
    #[must_use]
    pub fn new(max_execs: usize) -> Self {
        Self {
            max_execs: max_execs.max(1),
            state: Arc::new(Mutex::new(SlugState::default())),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, SlugState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the lifecycle lock for `slug`.
    pub async fn lock_lifecycle(&self, slug: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut state = self.lock_state();
            Arc::clone(state.lifecycle.entry(slug.to_owned()).or_default())
        };
        lock.lock_owned().await
    }

    /// Acquire an exec slot for `slug`, waiting while all slots are taken.
    ///
    /// The caller counts as active from the moment it starts waiting.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the workspace is being deleted.
    pub async fn acquire_exec(&self, slug: &str) -> Result<ExecPermit> {
        let (semaphore, counter) = {
            let mut state = self.lock_state();
            if state.retired.contains(slug) {
                return Err(AppError::NotFound(format!(
                    "workspace {slug} is being deleted"
                )));
            }
            let semaphore = Arc::clone(
                state
                    .semaphores
                    .entry(slug.to_owned())
                    .or_insert_with(|| Arc::new(Semaphore::new(self.max_execs))),
            );
            let counter = Arc::clone(state.active.entry(slug.to_owned()).or_default());
            counter.fetch_add(1, Ordering::SeqCst);
            (semaphore, counter)
        };

        let active = ActiveExec { counter };
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| AppError::NotFound(format!("workspace {slug} is closed")))?;
        debug!(slug, "exec slot acquired");

        Ok(ExecPermit {
            _permit: permit,
            _active: active,
        })
    }

    /// Turns currently executing (or waiting for a slot) in `slug`.
    #[must_use]
    pub fn active_execs(&self, slug: &str) -> usize {
        self.lock_state()
            .active
            .get(slug)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    /// Mark `slug` as being deleted, refusing if turns are in flight.
    ///
    /// The returned guard lifts the mark when dropped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::WorkspaceBusy` if execs are active, or if another
    /// deletion of the same slug is in progress.
    pub fn retire(&self, slug: &str) -> Result<RetiredSlug> {
        let mut state = self.lock_state();
        let active = state
            .active
            .get(slug)
            .map_or(0, |c| c.load(Ordering::SeqCst));
        if active > 0 {
            return Err(AppError::WorkspaceBusy(format!(
                "{slug} has {active} turn(s) in flight"
            )));
        }
        if !state.retired.insert(slug.to_owned()) {
            return Err(AppError::WorkspaceBusy(format!(
                "{slug} is already being deleted"
            )));
        }
        state.semaphores.remove(slug);
        state.active.remove(slug);
        Ok(RetiredSlug {
            slug: slug.to_owned(),
            state: Arc::clone(&self.state),
        })
    }
}

struct ActiveExec {
    counter: Arc<AtomicUsize>,
}

impl Drop for ActiveExec {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An exec slot. Releases the slot and the active count on drop.
pub struct ExecPermit {
    _permit: OwnedSemaphorePermit,
    _active: ActiveExec,
}

/// Deletion mark on a slug; cleared on drop.
pub struct RetiredSlug {
    slug: String,
    state: Arc<Mutex<SlugState>>,
}

impl Drop for RetiredSlug {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.retired.remove(&self.slug);
    }
}
