//! Session model as seen by the sandbox engine.
//!
//! Sessions are owned by the external session store. This engine only reads
//! them and updates trust, working directory and the resume reference.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AppError;

/// Metadata key under which the last resolved engine session id is stored.
pub const RESUME_REFERENCE_KEY: &str = "resume_session_id";

/// Where a turn is allowed to execute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Direct execution on the host.
    Trusted,
    /// Execution inside the workspace container.
    Untrusted,
}

impl TrustLevel {
    /// Wire/storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Untrusted => "untrusted",
        }
    }
}

impl Display for TrustLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustLevel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trusted" | "full" => Ok(Self::Trusted),
            "untrusted" | "sandboxed" | "vault" => Ok(Self::Untrusted),
            other => Err(AppError::InvalidInput(format!("unknown trust level: {other}"))),
        }
    }
}

/// Session record fields the engine consults per turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Opaque, stable identifier. Also the engine transcript identity.
    pub id: String,
    /// Stored trust level, if one was ever set.
    pub trust_level: Option<TrustLevel>,
    /// Workspace this session belongs to.
    pub workspace_id: Option<String>,
    /// Absolute working directory on the host.
    pub working_directory: PathBuf,
    /// Free-form key/value metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Construct a session with no stored trust and empty metadata.
    #[must_use]
    pub fn new(id: String, workspace_id: Option<String>, working_directory: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id,
            trust_level: None,
            workspace_id,
            working_directory,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Engine session id recorded after the last completed turn, if any.
    #[must_use]
    pub fn resume_reference(&self) -> Option<&str> {
        self.metadata.get(RESUME_REFERENCE_KEY).map(String::as_str)
    }
}

/// Session fields a turn may change, applied in place by the store.
///
/// `None` leaves the stored value alone. `workspace_id` only fills a session
/// that has none; an existing binding is never moved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    /// New stored trust level.
    pub trust_level: Option<TrustLevel>,
    /// Workspace to bind an unbound session to.
    pub workspace_id: Option<String>,
    /// New working directory.
    pub working_directory: Option<PathBuf>,
}

impl SessionUpdate {
    /// Whether applying this would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trust_level.is_none() && self.workspace_id.is_none() && self.working_directory.is_none()
    }

    /// Apply to an in-memory record.
    pub fn apply(&self, session: &mut Session) {
        if let Some(level) = self.trust_level {
            session.trust_level = Some(level);
        }
        if session.workspace_id.is_none() {
            session.workspace_id.clone_from(&self.workspace_id);
        }
        if let Some(dir) = &self.working_directory {
            session.working_directory.clone_from(dir);
        }
        session.updated_at = Utc::now();
    }
}

/// One prior message reconstructed from the session store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryMessage {
    /// `user` or `assistant`.
    pub role: String,
    /// Plain text content.
    pub content: String,
}

impl HistoryMessage {
    /// Convenience constructor.
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}
