//! Host execution for trusted turns.
//!
//! Spawns the engine CLI on the host with:
//! - `env_clear()` + a safe variable allowlist, so secrets held by this
//!   process never reach the engine.
//! - The session's working directory used verbatim as the child's cwd.
//! - `kill_on_drop(false)`: once dispatched, an invocation runs to
//!   completion even if the caller disconnects.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, Instrument};

use super::{
    capture_stderr, drive_invocation, report_incomplete, ExecExit, ExecProcess, TurnExecutor,
    EVENT_CHANNEL_CAPACITY,
};
use crate::config::EngineConfig;
use crate::models::event::TurnEvent;
use crate::models::turn::ExecutionRequest;
use crate::protocol::reader::TurnSink;
use crate::protocol::{EngineRequest, ENV_AGENT_TYPE, ENV_REQUEST_ID, ENV_SESSION_ID};
use crate::{AppError, BoxFuture, Result};

/// Environment variables inherited by a host engine process.
///
/// Everything else is stripped before launch.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "TERM",
    "TMPDIR",
    "RUST_LOG",
    "ANTHROPIC_API_KEY",
    "CLAUDE_CODE_OAUTH_TOKEN",
];

/// Host engine launcher.
#[derive(Debug, Clone)]
pub struct DirectRuntime {
    engine: EngineConfig,
    exec_timeout: Duration,
}

impl DirectRuntime {
    /// Launcher for `engine.host_cli` with the given per-turn deadline.
    #[must_use]
    pub fn new(engine: EngineConfig, exec_timeout: Duration) -> Self {
        Self {
            engine,
            exec_timeout,
        }
    }

    /// Spawn the engine for `request`.
    ///
    /// # Errors
    ///
    /// - [`AppError::InvalidInput`] if the working directory is not absolute.
    /// - [`AppError::NotFound`] if it does not exist.
    /// - [`AppError::Engine`] if the process cannot be spawned.
    pub fn spawn(&self, request: &ExecutionRequest) -> Result<ExecProcess> {
        let cwd = &request.working_directory;
        check_working_directory(cwd)?;

        let mut cmd = Command::new(&self.engine.host_cli);
        cmd.args(&self.engine.host_cli_args);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.env(ENV_SESSION_ID, &request.session_id)
            .env(ENV_AGENT_TYPE, &self.engine.agent_type)
            .env(ENV_REQUEST_ID, &request.request_id);

        cmd.current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Engine(format!("failed to spawn engine: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Engine("failed to capture engine stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Engine("failed to capture engine stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Engine("failed to capture engine stderr".into()))?;

        info!(
            session_id = %request.session_id,
            pid = child.id(),
            cwd = %cwd.display(),
            "host engine spawned"
        );

        let stderr_task = capture_stderr(request.request_id.clone(), stderr);
        let completion = Box::pin(async move {
            let status = child.wait().await?;
            let stderr = stderr_task.await.unwrap_or_default();
            Ok::<_, AppError>(ExecExit {
                code: status.code(),
                stderr,
            })
        });

        Ok(ExecProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            completion,
        })
    }
}

fn check_working_directory(cwd: &Path) -> Result<()> {
    if !cwd.is_absolute() {
        return Err(AppError::InvalidInput(format!(
            "working directory must be absolute: {}",
            cwd.display()
        )));
    }
    if !cwd.is_dir() {
        return Err(AppError::NotFound(format!(
            "working directory does not exist: {}",
            cwd.display()
        )));
    }
    Ok(())
}

impl TurnExecutor for DirectRuntime {
    fn execute(&self, request: ExecutionRequest) -> BoxFuture<'_, Result<mpsc::Receiver<TurnEvent>>> {
        Box::pin(async move {
            let process = self.spawn(&request)?;
            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
            let deadline = self.exec_timeout;
            let span = info_span!(
                "direct_turn",
                session_id = %request.session_id,
                request_id = %request.request_id
            );

            tokio::spawn(
                async move {
                    let wire = EngineRequest::from(&request);
                    let mut sink = TurnSink::new(tx);
                    match drive_invocation(&request.request_id, process, &wire, &mut sink, deadline).await {
                        Ok((outcome, exit)) => report_incomplete(&outcome, &exit, &sink).await,
                        Err(err) => {
                            error!(%err, "host engine invocation failed");
                            sink.send(TurnEvent::from_error(&err)).await;
                        }
                    }
                }
                .instrument(span),
            );

            Ok(rx)
        })
    }
}
