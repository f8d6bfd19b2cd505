//! In-memory session store.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::RwLock;

use super::SessionStore;
use crate::models::session::{HistoryMessage, Session, SessionUpdate};
use crate::{BoxFuture, Result};

/// Process-local [`SessionStore`].
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    history: RwLock<HashMap<String, Vec<HistoryMessage>>>,
}

impl MemorySessionStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, id: &str) -> BoxFuture<'_, Result<Option<Session>>> {
        let id = id.to_owned();
        Box::pin(async move { Ok(self.sessions.read().await.get(&id).cloned()) })
    }

    fn upsert(&self, session: Session) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.sessions
                .write()
                .await
                .insert(session.id.clone(), session);
            Ok(())
        })
    }

    fn update(&self, id: &str, update: SessionUpdate) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_owned();
        Box::pin(async move {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(&id) else {
                return Ok(false);
            };
            update.apply(session);
            Ok(true)
        })
    }

    fn set_metadata(&self, id: &str, key: &str, value: &str) -> BoxFuture<'_, Result<bool>> {
        let id = id.to_owned();
        let key = key.to_owned();
        let value = value.to_owned();
        Box::pin(async move {
            super::validate_metadata_key(&key)?;
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(&id) else {
                return Ok(false);
            };
            session.metadata.insert(key, value);
            session.updated_at = Utc::now();
            Ok(true)
        })
    }

    fn history(&self, id: &str, limit: usize) -> BoxFuture<'_, Result<Vec<HistoryMessage>>> {
        let id = id.to_owned();
        Box::pin(async move {
            let history = self.history.read().await;
            let messages = history.get(&id).map_or(&[][..], Vec::as_slice);
            let skip = messages.len().saturating_sub(limit);
            Ok(messages[skip..].to_vec())
        })
    }

    fn append_message(&self, id: &str, message: HistoryMessage) -> BoxFuture<'_, Result<()>> {
        let id = id.to_owned();
        Box::pin(async move {
            self.history
                .write()
                .await
                .entry(id)
                .or_default()
                .push(message);
            Ok(())
        })
    }
}
