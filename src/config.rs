//! Global configuration parsing and validation.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::models::session::TrustLevel;
use crate::{AppError, Result};

/// Container runtime and lifecycle settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ContainerConfig {
    /// Runtime CLI binary (`docker`, `podman`).
    #[serde(default = "default_runtime_bin")]
    pub runtime_bin: String,
    /// Image the workspace containers are created from.
    #[serde(default = "default_image")]
    pub image: String,
    /// Prefix for container names; the slug is appended.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// `HOME` inside the container.
    #[serde(default = "default_home_dir")]
    pub home_dir: String,
    /// Mount point of the workspace directory inside the container.
    #[serde(default = "default_workdir")]
    pub workdir: String,
    /// Engine command exec'd into the container per turn.
    #[serde(default = "default_engine_command")]
    pub engine_command: Vec<String>,
    /// Idle window before a container is stopped.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// Concurrent execs allowed per workspace.
    #[serde(default = "default_max_concurrent_execs")]
    pub max_concurrent_execs: u32,
    /// Grace period for `stop` before the runtime kills the container.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,
    /// Deadline for one turn's output.
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_seconds: u64,
    /// Interval between orphan prune passes.
    #[serde(default = "default_prune_interval")]
    pub prune_interval_seconds: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime_bin: default_runtime_bin(),
            image: default_image(),
            name_prefix: default_name_prefix(),
            home_dir: default_home_dir(),
            workdir: default_workdir(),
            engine_command: default_engine_command(),
            idle_timeout_seconds: default_idle_timeout(),
            max_concurrent_execs: default_max_concurrent_execs(),
            stop_timeout_seconds: default_stop_timeout(),
            exec_timeout_seconds: default_exec_timeout(),
            prune_interval_seconds: default_prune_interval(),
        }
    }
}

impl ContainerConfig {
    /// Idle window as a [`Duration`].
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    /// Stop grace period as a [`Duration`].
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }

    /// Exec deadline as a [`Duration`].
    #[must_use]
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_seconds)
    }

    /// Prune interval as a [`Duration`].
    #[must_use]
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_seconds)
    }
}

fn default_runtime_bin() -> String {
    "docker".into()
}

fn default_image() -> String {
    "parachute-sandbox:latest".into()
}

fn default_name_prefix() -> String {
    "parachute-ws-".into()
}

fn default_home_dir() -> String {
    "/home/sandbox".into()
}

fn default_workdir() -> String {
    "/workspace".into()
}

fn default_engine_command() -> Vec<String> {
    vec!["parachute-agent".into()]
}

fn default_idle_timeout() -> u64 {
    900
}

fn default_max_concurrent_execs() -> u32 {
    3
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_exec_timeout() -> u64 {
    1800
}

fn default_prune_interval() -> u64 {
    1800
}

/// Agent engine settings for host and container invocations.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Host engine binary for trusted turns.
    #[serde(default = "default_host_cli")]
    pub host_cli: String,
    /// Extra arguments for the host engine.
    #[serde(default)]
    pub host_cli_args: Vec<String>,
    /// Agent type passed per exec.
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    /// Maximum prior messages injected when native resume is unavailable.
    #[serde(default = "default_history_turn_limit")]
    pub history_turn_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host_cli: default_host_cli(),
            host_cli_args: Vec::new(),
            agent_type: default_agent_type(),
            history_turn_limit: default_history_turn_limit(),
        }
    }
}

fn default_host_cli() -> String {
    "parachute-agent".into()
}

fn default_agent_type() -> String {
    "claude".into()
}

fn default_history_turn_limit() -> usize {
    40
}

fn default_trust() -> TrustLevel {
    TrustLevel::Trusted
}

/// A configured workspace (`[[workspace]]` entry).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkspaceEntry {
    /// Stable workspace identifier; also names its container.
    pub slug: String,
    /// Host directory mounted read-write into the container.
    pub directory: PathBuf,
    /// Trust applied when neither the turn nor the session sets one.
    #[serde(default)]
    pub default_trust: Option<TrustLevel>,
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root for engine-private storage and the session database.
    pub data_dir: PathBuf,
    /// Built-in trust default.
    #[serde(default = "default_trust")]
    pub default_trust: TrustLevel,
    /// Container lifecycle settings.
    #[serde(default)]
    pub container: ContainerConfig,
    /// Engine invocation settings.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Known workspaces.
    #[serde(default, rename = "workspace")]
    pub workspaces: Vec<WorkspaceEntry>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a configured workspace by slug.
    #[must_use]
    pub fn workspace(&self, slug: &str) -> Option<&WorkspaceEntry> {
        self.workspaces.iter().find(|w| w.slug == slug)
    }

    /// Directory holding per-workspace engine storage.
    #[must_use]
    pub fn sandbox_storage_root(&self) -> PathBuf {
        self.data_dir.join("sandbox")
    }

    /// Path of the `SQLite` session database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("sessions.db")
    }

    fn validate(&mut self) -> Result<()> {
        if self.container.max_concurrent_execs == 0 {
            return Err(AppError::Config(
                "container.max_concurrent_execs must be greater than zero".into(),
            ));
        }

        if self.container.idle_timeout_seconds == 0 {
            return Err(AppError::Config(
                "container.idle_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.container.engine_command.is_empty() {
            return Err(AppError::Config(
                "container.engine_command must not be empty".into(),
            ));
        }

        let mut seen = HashSet::new();
        for entry in &self.workspaces {
            validate_slug(&entry.slug).map_err(|err| AppError::Config(err.to_string()))?;
            if !seen.insert(entry.slug.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate workspace slug: {}",
                    entry.slug
                )));
            }
        }

        fs::create_dir_all(&self.data_dir)
            .map_err(|err| AppError::Config(format!("data_dir not creatable: {err}")))?;
        self.data_dir = self
            .data_dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("data_dir invalid: {err}")))?;

        Ok(())
    }
}

/// Validate a workspace slug for use in container names and storage paths.
///
/// # Errors
///
/// Returns `AppError::InvalidInput` if the slug is empty, too long, or
/// contains characters outside `[a-z0-9_-]`.
pub fn validate_slug(slug: &str) -> Result<()> {
    static SLUG: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = SLUG.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,62}$").ok());

    let valid = pattern.as_ref().is_some_and(|re| re.is_match(slug));
    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!("invalid workspace slug: {slug:?}")))
    }
}
