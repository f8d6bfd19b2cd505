//! Session repository for `SQLite` persistence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::session::{HistoryMessage, Session, SessionUpdate, TrustLevel};
use crate::store::{validate_metadata_key, SessionStore};
use crate::{AppError, BoxFuture, Result};

use super::db::Database;

/// `SQLite`-backed [`SessionStore`].
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    trust_level: Option<String>,
    workspace_id: Option<String>,
    working_directory: String,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        let trust_level = self
            .trust_level
            .as_deref()
            .map(str::parse::<TrustLevel>)
            .transpose()
            .map_err(|e| AppError::Db(format!("invalid trust_level: {e}")))?;
        let metadata: HashMap<String, String> = serde_json::from_str(&self.metadata)
            .map_err(|e| AppError::Db(format!("invalid metadata: {e}")))?;

        Ok(Session {
            id: self.id,
            trust_level,
            workspace_id: self.workspace_id,
            working_directory: PathBuf::from(self.working_directory),
            metadata,
            created_at: parse_ts(&self.created_at, "created_at")?,
            updated_at: parse_ts(&self.updated_at, "updated_at")?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    role: String,
    content: String,
}

fn parse_ts(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Retrieve a session by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or the row is corrupt.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, trust_level, workspace_id, working_directory, metadata, created_at, updated_at
             FROM session WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// Insert or replace a session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn save(&self, session: &Session) -> Result<()> {
        let metadata = serde_json::to_string(&session.metadata)
            .map_err(|e| AppError::Db(format!("failed to encode metadata: {e}")))?;

        sqlx::query(
            "INSERT INTO session (id, trust_level, workspace_id, working_directory, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                trust_level = excluded.trust_level,
                workspace_id = excluded.workspace_id,
                working_directory = excluded.working_directory,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at",
        )
        .bind(&session.id)
        .bind(session.trust_level.map(TrustLevel::as_str))
        .bind(&session.workspace_id)
        .bind(session.working_directory.to_string_lossy().into_owned())
        .bind(&metadata)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Apply `update` in a single statement; untouched columns keep whatever
    /// a concurrent writer stored.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn apply_update(&self, id: &str, update: &SessionUpdate) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE session SET
                trust_level = COALESCE(?2, trust_level),
                workspace_id = COALESCE(workspace_id, ?3),
                working_directory = COALESCE(?4, working_directory),
                updated_at = ?5
             WHERE id = ?1",
        )
        .bind(id)
        .bind(update.trust_level.map(TrustLevel::as_str))
        .bind(&update.workspace_id)
        .bind(
            update
                .working_directory
                .as_ref()
                .map(|d| d.to_string_lossy().into_owned()),
        )
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set one key of the metadata JSON object in place.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for an unaddressable key or
    /// `AppError::Db` if the write fails.
    pub async fn put_metadata(&self, id: &str, key: &str, value: &str) -> Result<bool> {
        validate_metadata_key(key)?;
        let result = sqlx::query(
            "UPDATE session SET
                metadata = json_set(metadata, ?2, ?3),
                updated_at = ?4
             WHERE id = ?1",
        )
        .bind(id)
        .bind(format!("$.\"{key}\""))
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// The most recent `limit` messages of a session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn recent_messages(&self, id: &str, limit: usize) -> Result<Vec<HistoryMessage>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT role, content FROM session_message
             WHERE session_id = ?1
             ORDER BY seq DESC
             LIMIT ?2",
        )
        .bind(id)
        .bind(limit)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.reverse();
        Ok(rows
            .into_iter()
            .map(|r| HistoryMessage::new(r.role, r.content))
            .collect())
    }

    /// Append one message to a session's history.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn append(&self, id: &str, message: &HistoryMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO session_message (session_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }
}

impl SessionStore for SessionRepo {
    fn get(&self, id: &str) -> BoxFuture<'_, Result<Option<Session>>> {
        let id = id.to_owned();
        Box::pin(async move { self.get_by_id(&id).await })
    }

    fn upsert(&self, session: Session) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.save(&session).await })
    }

    fn update(&self, id: &str, update: SessionUpdate) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_owned();
        Box::pin(async move { self.apply_update(&id, &update).await })
    }

    fn set_metadata(&self, id: &str, key: &str, value: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_owned();
        let key = key.to_owned();
        let value = value.to_owned();
        Box::pin(async move { self.put_metadata(&id, &key, &value).await })
    }

    fn history(&self, id: &str, limit: usize) -> BoxFuture<'_, Result<Vec<HistoryMessage>>> {
        let id = id.to_owned();
        Box::pin(async move { self.recent_messages(&id, limit).await })
    }

    fn append_message(&self, id: &str, message: HistoryMessage) -> BoxFuture<'_, Result<()>> {
        let id = id.to_owned();
        Box::pin(async move { self.append(&id, &message).await })
    }
}
