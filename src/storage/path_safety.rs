//! Path validation and symlink-safe traversal.
//!
//! Everything under the sandbox storage root is writable from inside
//! containers, so any path there may have been replaced by a symlink.
//! Lookups walk component by component with `symlink_metadata` and removal
//! never descends through a link.

use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::{AppError, Result};

/// Join `relative` onto `root`, rejecting absolute paths and `..` traversal.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if `relative` is absolute or escapes
/// `root`.
pub fn join_within(root: &Path, relative: impl AsRef<Path>) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in relative.as_ref().components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(AppError::PathViolation(
                        "path attempts to escape storage root".into(),
                    ));
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::PathViolation(format!(
                    "absolute path not allowed: {}",
                    relative.as_ref().display()
                )));
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    Ok(root.join(normalized))
}

/// Outcome of a symlink-safe lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Every component exists and none is a symlink.
    Present,
    /// Some component does not exist.
    Missing,
}

/// Check `relative` under `root` without following symlinks.
///
/// `root` itself is trusted; every component below it is examined with
/// `symlink_metadata`.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if any component below `root` is a
/// symlink, or `AppError::Io` on other metadata failures.
pub fn lookup_no_follow(root: &Path, relative: impl AsRef<Path>) -> Result<Lookup> {
    let relative = relative.as_ref();
    join_within(root, relative)?;

    let mut current = root.to_path_buf();
    for component in relative.components() {
        let Component::Normal(part) = component else {
            continue;
        };
        current.push(part);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(AppError::PathViolation(format!(
                    "symlink in storage path: {}",
                    current.display()
                )));
            }
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Lookup::Missing),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(Lookup::Present)
}

/// Recursively delete `path` without ever following a symlink.
///
/// A symlink at `path` itself is refused. Symlinks found inside the tree are
/// unlinked, never traversed. Returns `false` if `path` did not exist.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if `path` is a symlink, or `AppError::Io`
/// if a removal fails.
pub fn remove_tree_no_follow(path: &Path) -> Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };

    if meta.file_type().is_symlink() {
        return Err(AppError::PathViolation(format!(
            "refusing to delete through symlink: {}",
            path.display()
        )));
    }

    if meta.is_dir() {
        remove_dir_contents(path)?;
        fs::remove_dir(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}

fn remove_dir_contents(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let kind = entry.file_type()?;
        if kind.is_dir() {
            remove_dir_contents(&path)?;
            fs::remove_dir(&path)?;
        } else {
            // Files and symlinks alike: unlink the entry itself.
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}
