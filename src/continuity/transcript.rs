//! Locating engine transcripts in workspace storage.
//!
//! The engine keeps one transcript per session under its state directory:
//!
//! ```text
//! {engine_dir}/projects/{encoded workdir}/{session_id}.jsonl
//! ```
//!
//! where the working directory is encoded by replacing every character
//! outside `[A-Za-z0-9]` with `-` (`/workspace` becomes `-workspace`).

use std::path::{Path, PathBuf};

use crate::storage::path_safety::{lookup_no_follow, Lookup};
use crate::{AppError, Result};

/// Directory under the engine state dir holding per-project transcripts.
pub const PROJECTS_DIR: &str = "projects";

/// Transcript file extension.
pub const TRANSCRIPT_EXT: &str = "jsonl";

/// Encode a container working directory as the engine's project directory.
#[must_use]
pub fn encode_project_dir(workdir: &str) -> String {
    workdir
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Reject session ids that cannot safely name a file.
///
/// # Errors
///
/// Returns `AppError::InvalidInput` if the id is empty, longer than 128
/// bytes, `.`/`..`, or contains characters outside `[A-Za-z0-9._-]`.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id != "."
        && session_id != ".."
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "session id not usable as transcript name: {session_id:?}"
        )))
    }
}

/// Transcript path relative to the engine state directory.
///
/// # Errors
///
/// Returns `AppError::InvalidInput` for an unsafe session id.
pub fn relative_transcript_path(workdir: &str, session_id: &str) -> Result<PathBuf> {
    validate_session_id(session_id)?;
    Ok(Path::new(PROJECTS_DIR)
        .join(encode_project_dir(workdir))
        .join(format!("{session_id}.{TRANSCRIPT_EXT}")))
}

/// Host path of the transcript for `session_id`, if it exists as a regular
/// file reached without any symlink.
///
/// # Errors
///
/// - `AppError::InvalidInput` for an unsafe session id.
/// - `AppError::PathViolation` if a path component is a symlink.
/// - `AppError::Io` on other filesystem failures.
pub fn find_transcript(engine_dir: &Path, workdir: &str, session_id: &str) -> Result<Option<PathBuf>> {
    let relative = relative_transcript_path(workdir, session_id)?;
    match lookup_no_follow(engine_dir, &relative)? {
        Lookup::Missing => Ok(None),
        Lookup::Present => {
            let path = engine_dir.join(relative);
            let meta = std::fs::symlink_metadata(&path)?;
            Ok(meta.is_file().then_some(path))
        }
    }
}
