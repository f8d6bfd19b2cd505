//! Container runtime backed by the `docker` (or compatible) CLI.
//!
//! Every operation shells out via `tokio::process::Command` and inspects
//! the exit status and stderr. A CLI that cannot be spawned at all, or a
//! daemon that refuses the connection, is reported as
//! [`AppError::ContainerUnavailable`].

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info};

use super::{
    capture_stderr, ContainerRuntime, ContainerState, CreateSpec, ExecExit, ExecProcess,
    ExecSpec, ListedContainer, LABEL_WORKSPACE,
};
use crate::{AppError, BoxFuture, Result};

/// Deadline for the `version` reachability check.
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// stderr fragments indicating the daemon itself is unreachable.
const UNREACHABLE_MARKERS: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "Is the docker daemon running",
    "error during connect",
];

/// `docker`-CLI runtime.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    bin: String,
}

impl CliRuntime {
    /// Runtime invoking `bin` (`docker`, `podman`).
    #[must_use]
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Run a CLI command to completion, returning stdout on success.
    async fn run(&self, op: &str, args: &[String]) -> Result<String> {
        debug!(op, ?args, "runtime command");
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|err| AppError::ContainerUnavailable(format!("{} {op}: {err}", self.bin)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_failure(op, stderr.trim()))
    }
}

fn classify_failure(op: &str, stderr: &str) -> AppError {
    if UNREACHABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
        AppError::ContainerUnavailable(format!("{op}: {stderr}"))
    } else {
        AppError::Runtime(format!("{op} failed: {stderr}"))
    }
}

fn is_missing(err: &AppError) -> bool {
    matches!(err, AppError::Runtime(msg) if msg.contains("No such"))
}

/// Build the `docker run` argument list for `spec`.
#[must_use]
pub fn create_args(spec: &CreateSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_owned(),
        "-d".to_owned(),
        "--init".to_owned(),
        "--name".to_owned(),
        spec.name.clone(),
        "--restart".to_owned(),
        spec.restart_policy.clone(),
        "-w".to_owned(),
        spec.workdir.clone(),
    ];
    for (key, value) in &spec.labels {
        args.push("--label".to_owned());
        args.push(format!("{key}={value}"));
    }
    for mount in &spec.mounts {
        let mut volume = format!("{}:{}", mount.host.display(), mount.container);
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.push("-v".to_owned());
        args.push(volume);
    }
    for (key, value) in &spec.env {
        args.push("-e".to_owned());
        args.push(format!("{key}={value}"));
    }
    if let Some(user) = &spec.user {
        args.push("--user".to_owned());
        args.push(user.clone());
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Build the `docker exec` argument list for `spec`.
#[must_use]
pub fn exec_args(spec: &ExecSpec) -> Vec<String> {
    let mut args = vec!["exec".to_owned(), "-i".to_owned()];
    for (key, value) in &spec.env {
        args.push("-e".to_owned());
        args.push(format!("{key}={value}"));
    }
    if let Some(dir) = &spec.workdir {
        args.push("-w".to_owned());
        args.push(dir.clone());
    }
    args.push(spec.container.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Parse `inspect` output of the form `status|running|exit_code|oom_killed`.
///
/// A missing OOM column reads as not OOM-killed.
#[must_use]
pub fn parse_inspect(raw: &str) -> Option<ContainerState> {
    let mut parts = raw.trim().split('|');
    let status = parts.next()?.trim().to_owned();
    let running = parts.next()?.trim() == "true";
    let exit_code = parts.next().and_then(|c| c.trim().parse::<i64>().ok());
    let oom_killed = parts.next().is_some_and(|o| o.trim() == "true");
    Some(ContainerState {
        status,
        running,
        exit_code,
        oom_killed,
    })
}

/// Parse `ps` output lines of the form `name\tstate\tworkspace`.
#[must_use]
pub fn parse_listing(raw: &str) -> Vec<ListedContainer> {
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let name = cols.next()?.trim().to_owned();
            let state = cols.next().unwrap_or_default().trim().to_owned();
            let workspace = cols
                .next()
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map(str::to_owned);
            Some(ListedContainer {
                name,
                state,
                workspace,
            })
        })
        .collect()
}

impl ContainerRuntime for CliRuntime {
    fn is_available(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let version = self
                .command()
                .args(["version", "--format", "{{.Server.Version}}"])
                .output();
            match tokio::time::timeout(VERSION_TIMEOUT, version).await {
                Ok(Ok(output)) => output.status.success(),
                Ok(Err(err)) => {
                    debug!(bin = %self.bin, %err, "runtime cli not spawnable");
                    false
                }
                Err(_) => false,
            }
        })
    }

    fn inspect(&self, name: &str) -> BoxFuture<'_, Result<Option<ContainerState>>> {
        let name = name.to_owned();
        Box::pin(async move {
            let args = vec![
                "inspect".to_owned(),
                "--type".to_owned(),
                "container".to_owned(),
                "--format".to_owned(),
                "{{.State.Status}}|{{.State.Running}}|{{.State.ExitCode}}|{{.State.OOMKilled}}"
                    .to_owned(),
                name.clone(),
            ];
            match self.run("inspect", &args).await {
                Ok(out) => parse_inspect(&out)
                    .map(Some)
                    .ok_or_else(|| AppError::Runtime(format!("unparseable inspect output for {name}"))),
                Err(err) if is_missing(&err) => Ok(None),
                Err(err) => Err(err),
            }
        })
    }

    fn create(&self, spec: CreateSpec) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let args = create_args(&spec);
            let id = self.run("create", &args).await?;
            info!(container = %spec.name, id = id.trim(), "container created");
            Ok(())
        })
    }

    fn start(&self, name: &str) -> BoxFuture<'_, Result<()>> {
        let name = name.to_owned();
        Box::pin(async move {
            self.run("start", &["start".to_owned(), name]).await?;
            Ok(())
        })
    }

    fn stop(&self, name: &str, timeout: Duration) -> BoxFuture<'_, Result<()>> {
        let name = name.to_owned();
        Box::pin(async move {
            let args = vec![
                "stop".to_owned(),
                "-t".to_owned(),
                timeout.as_secs().to_string(),
                name,
            ];
            match self.run("stop", &args).await {
                Err(err) if is_missing(&err) => Ok(()),
                other => other.map(|_| ()),
            }
        })
    }

    fn remove(&self, name: &str, force: bool) -> BoxFuture<'_, Result<()>> {
        let name = name.to_owned();
        Box::pin(async move {
            let mut args = vec!["rm".to_owned()];
            if force {
                args.push("-f".to_owned());
            }
            args.push(name);
            match self.run("rm", &args).await {
                Err(err) if is_missing(&err) => Ok(()),
                other => other.map(|_| ()),
            }
        })
    }

    fn list_by_label(&self, label: &str, value: &str) -> BoxFuture<'_, Result<Vec<ListedContainer>>> {
        let filter = format!("label={label}={value}");
        Box::pin(async move {
            let args = vec![
                "ps".to_owned(),
                "-a".to_owned(),
                "--filter".to_owned(),
                filter,
                "--format".to_owned(),
                format!("{{{{.Names}}}}\t{{{{.State}}}}\t{{{{.Label \"{LABEL_WORKSPACE}\"}}}}"),
            ];
            let out = self.run("ps", &args).await?;
            Ok(parse_listing(&out))
        })
    }

    fn exec(&self, spec: ExecSpec) -> BoxFuture<'_, Result<ExecProcess>> {
        Box::pin(async move {
            let args = exec_args(&spec);
            let mut child = Command::new(&self.bin)
                .args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(false)
                .spawn()
                .map_err(|err| AppError::ContainerUnavailable(format!("{} exec: {err}", self.bin)))?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| AppError::Runtime("failed to capture exec stdin".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| AppError::Runtime("failed to capture exec stdout".into()))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| AppError::Runtime("failed to capture exec stderr".into()))?;

            let stderr_task = capture_stderr(spec.container.clone(), stderr);
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
        })
    }
}
