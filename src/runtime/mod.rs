//! Execution runtimes.
//!
//! [`ContainerRuntime`] is the single seam through which container lifecycle
//! commands are issued; only the container manager calls it. [`TurnExecutor`]
//! abstracts "run one engine invocation and stream its events", implemented
//! by the host [`direct::DirectRuntime`] and by the container manager's
//! sandbox executor.

pub mod direct;
pub mod docker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::models::event::TurnEvent;
use crate::models::turn::ExecutionRequest;
use crate::protocol::reader::{pump_events, EventReader, PumpOutcome, TurnSink};
use crate::protocol::writer::write_request;
use crate::protocol::EngineRequest;
use crate::{AppError, BoxFuture, Result};

/// Label marking containers owned by this engine.
pub const LABEL_MANAGED: &str = "parachute.managed";
/// Label carrying the workspace slug a container serves.
pub const LABEL_WORKSPACE: &str = "parachute.workspace";

/// Maximum stderr bytes retained from one invocation.
const STDERR_CAP: usize = 16 * 1024;

/// Exit codes produced by a deliberate `stop` of the keep-alive entrypoint.
const CLEAN_STOP_CODES: &[i64] = &[0, 137, 143];

/// Runtime-reported state of one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    /// Raw status string (`running`, `exited`, `created`, ...).
    pub status: String,
    /// Whether the container is running.
    pub running: bool,
    /// Exit code of the last run, if it exited.
    pub exit_code: Option<i64>,
    /// The kernel killed the last run for exceeding its memory limit.
    pub oom_killed: bool,
}

impl ContainerState {
    /// Whether a non-running container stopped the way `stop` leaves it
    /// (or was never started) and can simply be started again.
    ///
    /// An OOM kill also exits 137 but is a crash, not a clean stop.
    #[must_use]
    pub fn is_restartable(&self) -> bool {
        if self.running || self.oom_killed {
            return false;
        }
        match self.status.as_str() {
            "created" => true,
            "exited" => self
                .exit_code
                .is_some_and(|code| CLEAN_STOP_CODES.contains(&code)),
            _ => false,
        }
    }
}

/// A bind mount from the host into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host path.
    pub host: PathBuf,
    /// Path inside the container.
    pub container: String,
    /// Mount read-only.
    pub read_only: bool,
}

/// Everything needed to create a detached workspace container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Labels applied at creation.
    pub labels: Vec<(String, String)>,
    /// Bind mounts.
    pub mounts: Vec<Mount>,
    /// Static environment (never per-session identity).
    pub env: Vec<(String, String)>,
    /// Restart policy (`on-failure`).
    pub restart_policy: String,
    /// Default working directory.
    pub workdir: String,
    /// `uid:gid` to run as, if any.
    pub user: Option<String>,
    /// Keep-alive command; the container idles until execs arrive.
    pub command: Vec<String>,
}

/// A container found by a label query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedContainer {
    /// Container name.
    pub name: String,
    /// Raw state (`running`, `exited`, ...).
    pub state: String,
    /// Value of [`LABEL_WORKSPACE`], when present.
    pub workspace: Option<String>,
}

/// One exec invocation into a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    /// Target container.
    pub container: String,
    /// Command and arguments.
    pub command: Vec<String>,
    /// Per-call environment.
    pub env: Vec<(String, String)>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
}

/// How an invocation ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecExit {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Captured stderr (truncated).
    pub stderr: String,
}

impl ExecExit {
    /// Whether the process exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Streams of a started invocation.
pub struct ExecProcess {
    /// Engine stdin.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Engine stdout.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves when the invocation exits. Dropping it does not kill it.
    pub completion: BoxFuture<'static, Result<ExecExit>>,
}

/// Opaque container runtime API: create-detached, start, stop, exec, remove,
/// list-by-label, plus state inspection and a reachability check.
pub trait ContainerRuntime: Send + Sync {
    /// Whether the runtime daemon is reachable.
    fn is_available(&self) -> BoxFuture<'_, bool>;

    /// Current state of `name`, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ContainerUnavailable`] if the runtime is unreachable
    /// or [`AppError::Runtime`] if the query fails.
    fn inspect(&self, name: &str) -> BoxFuture<'_, Result<Option<ContainerState>>>;

    /// Create and start a detached container.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Runtime`] if creation fails.
    fn create(&self, spec: CreateSpec) -> BoxFuture<'_, Result<()>>;

    /// Start an existing container.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Runtime`] if the start fails.
    fn start(&self, name: &str) -> BoxFuture<'_, Result<()>>;

    /// Stop gracefully, killing after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Runtime`] if the stop fails.
    fn stop(&self, name: &str, timeout: Duration) -> BoxFuture<'_, Result<()>>;

    /// Remove a container. Removing a missing container is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Runtime`] if removal fails.
    fn remove(&self, name: &str, force: bool) -> BoxFuture<'_, Result<()>>;

    /// All containers carrying `label=value`, running or not.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Runtime`] if the listing fails.
    fn list_by_label(&self, label: &str, value: &str) -> BoxFuture<'_, Result<Vec<ListedContainer>>>;

    /// Start an exec into a running container.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Runtime`] if the exec cannot be started.
    fn exec(&self, spec: ExecSpec) -> BoxFuture<'_, Result<ExecProcess>>;
}

/// Runs one engine invocation and streams its events.
pub trait TurnExecutor: Send + Sync {
    /// Start the invocation. Events arrive incrementally on the receiver;
    /// the last one is `done` or `error`.
    ///
    /// # Errors
    ///
    /// Returns an error if the invocation cannot be started at all.
    fn execute(&self, request: ExecutionRequest) -> BoxFuture<'_, Result<mpsc::Receiver<TurnEvent>>>;
}

/// Capacity of per-turn event channels.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Drain `stderr` into a bounded string on a background task.
pub(crate) fn capture_stderr<R>(label: String, stderr: R) -> JoinHandle<String>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut captured = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(label = %label, line = %line, "engine stderr");
            if captured.len() < STDERR_CAP {
                captured.push_str(&line);
                captured.push('\n');
            }
        }
        captured
    })
}

/// Feed `request` to a started invocation and pump its events into `sink`.
///
/// The request write and the output pump run concurrently so a chatty engine
/// never blocks on a full pipe. A failed write is logged; whatever the engine
/// printed before exiting is still delivered. Returns only once the
/// invocation exited, even when the deadline already closed `sink`.
///
/// # Errors
///
/// Returns an I/O error from the output stream or from waiting on the
/// process.
pub(crate) async fn drive_invocation(
    label: &str,
    process: ExecProcess,
    request: &EngineRequest,
    sink: &mut TurnSink,
    deadline: Duration,
) -> Result<(PumpOutcome, ExecExit)> {
    let ExecProcess {
        stdin,
        stdout,
        completion,
    } = process;
    let mut reader = EventReader::new(label, stdout);

    let (written, pumped) = tokio::join!(
        write_request(stdin, request),
        pump_events(&mut reader, sink, deadline)
    );
    if let Err(err) = written {
        warn!(label, %err, "engine request not delivered");
    }
    let outcome = pumped?;
    let exit = completion.await?;
    debug!(label, code = ?exit.code, forwarded = outcome.forwarded, "invocation finished");
    Ok((outcome, exit))
}

/// Report an invocation that ended without a `done` event.
///
/// No-op when the turn completed, timed out (already reported) or the
/// consumer is gone.
pub(crate) async fn report_incomplete(
    outcome: &PumpOutcome,
    exit: &ExecExit,
    sink: &TurnSink,
) {
    if outcome.saw_done || outcome.timed_out || outcome.consumer_gone {
        return;
    }
    let code = exit
        .code
        .map_or_else(|| "signal".to_owned(), |c| c.to_string());
    let detail = exit.stderr.lines().last().unwrap_or_default();
    let err = AppError::Engine(format!(
        "engine exited ({code}) without completing the turn: {detail}"
    ));
    sink.send(TurnEvent::from_error(&err)).await;
}

/// Parse `docker ps` label output (`k=v,k2=v2`) into a map.
#[must_use]
pub fn parse_labels(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let k = k.trim();
            (!k.is_empty()).then(|| (k.to_owned(), v.trim().to_owned()))
        })
        .collect()
}
