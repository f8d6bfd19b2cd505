//! Storage seams for sessions and workspaces.
//!
//! Both are owned outside this engine; it only reads them and writes the
//! few fields it is responsible for (trust, working directory, resume
//! reference). The traits return boxed futures so they stay object safe.

pub mod memory;
pub mod workspaces;

use crate::config::WorkspaceEntry;
use crate::models::session::{HistoryMessage, Session, SessionUpdate};
use crate::{BoxFuture, Result};

/// Session persistence consulted per turn.
pub trait SessionStore: Send + Sync {
    /// Fetch a session by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on storage failure.
    fn get(&self, id: &str) -> BoxFuture<'_, Result<Option<Session>>>;

    /// Insert or replace a session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on storage failure.
    fn upsert(&self, session: Session) -> BoxFuture<'_, Result<()>>;

    /// Apply `update` to the stored record without touching other fields.
    /// Returns `false` if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on storage failure.
    fn update(&self, id: &str, update: SessionUpdate) -> BoxFuture<'_, Result<bool>>;

    /// Set one metadata entry, leaving the other keys as stored. Returns
    /// `false` if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for an empty or quoted key, or
    /// `AppError::Db` on storage failure.
    fn set_metadata(&self, id: &str, key: &str, value: &str) -> BoxFuture<'_, Result<bool>>;

    /// The most recent `limit` messages of a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on storage failure.
    fn history(&self, id: &str, limit: usize) -> BoxFuture<'_, Result<Vec<HistoryMessage>>>;

    /// Append one message to a session's history.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` on storage failure.
    fn append_message(&self, id: &str, message: HistoryMessage) -> BoxFuture<'_, Result<()>>;
}

/// Workspace registry.
pub trait WorkspaceStore: Send + Sync {
    /// Look up a workspace by slug.
    ///
    /// # Errors
    ///
    /// Returns an error on registry failure.
    fn get(&self, slug: &str) -> BoxFuture<'_, Result<Option<WorkspaceEntry>>>;

    /// All known workspaces.
    ///
    /// # Errors
    ///
    /// Returns an error on registry failure.
    fn list(&self) -> BoxFuture<'_, Result<Vec<WorkspaceEntry>>>;

    /// Remove a workspace record. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns an error on registry failure.
    fn delete(&self, slug: &str) -> BoxFuture<'_, Result<bool>>;
}

/// Reject metadata keys that cannot be addressed as a single JSON object
/// member.
pub(crate) fn validate_metadata_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('"') || key.contains('\\') {
        return Err(crate::AppError::InvalidInput(format!(
            "invalid metadata key: {key:?}"
        )));
    }
    Ok(())
}
