//! Container naming and creation parameters.

use std::path::Path;

use crate::config::ContainerConfig;
use crate::runtime::{CreateSpec, Mount, LABEL_MANAGED, LABEL_WORKSPACE};

/// Keep-alive command; execs do the real work.
pub const KEEP_ALIVE: &[&str] = &["sleep", "infinity"];

/// Container restart policy.
pub const RESTART_POLICY: &str = "on-failure";

/// Container name for `slug`.
#[must_use]
pub fn container_name(config: &ContainerConfig, slug: &str) -> String {
    format!("{}{slug}", config.name_prefix)
}

/// Mount point of the engine state directory inside the container.
#[must_use]
pub fn engine_state_mount(config: &ContainerConfig) -> String {
    format!("{}/.claude", config.home_dir.trim_end_matches('/'))
}

/// Creation parameters for the workspace container of `slug`.
///
/// The workspace directory is mounted read-write at the configured workdir
/// and the engine state directory at `{home}/.claude`. Identity (session,
/// request) is never baked in here; it is passed per exec.
#[must_use]
pub fn build_create_spec(
    config: &ContainerConfig,
    slug: &str,
    workspace_dir: &Path,
    engine_dir: &Path,
    user: Option<String>,
) -> CreateSpec {
    CreateSpec {
        name: container_name(config, slug),
        image: config.image.clone(),
        labels: vec![
            (LABEL_WORKSPACE.to_owned(), slug.to_owned()),
            (LABEL_MANAGED.to_owned(), "true".to_owned()),
        ],
        mounts: vec![
            Mount {
                host: workspace_dir.to_path_buf(),
                container: config.workdir.clone(),
                read_only: false,
            },
            Mount {
                host: engine_dir.to_path_buf(),
                container: engine_state_mount(config),
                read_only: false,
            },
        ],
        env: vec![("HOME".to_owned(), config.home_dir.clone())],
        restart_policy: RESTART_POLICY.to_owned(),
        workdir: config.workdir.clone(),
        user,
        command: KEEP_ALIVE.iter().map(|s| (*s).to_owned()).collect(),
    }
}

/// `uid:gid` of this process, so files written into the workspace mount stay
/// owned by the host user.
#[cfg(unix)]
#[must_use]
pub fn host_user() -> Option<String> {
    let uid = nix::unistd::getuid();
    let gid = nix::unistd::getgid();
    Some(format!("{uid}:{gid}"))
}

/// Not applicable off unix.
#[cfg(not(unix))]
#[must_use]
pub fn host_user() -> Option<String> {
    None
}
