//! Typed turn events shared by the engine wire format and the caller stream.

use serde::{Deserialize, Serialize};

use crate::AppError;

/// One event in a turn's response stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TurnEvent {
    /// Engine opened (or resumed) its transcript.
    SessionStart {
        /// Transcript identity.
        session_id: String,
        /// Whether an existing transcript was resumed.
        #[serde(default)]
        resumed: bool,
    },
    /// Incremental assistant text.
    TextDelta {
        /// Text fragment.
        text: String,
    },
    /// Engine invoked a tool.
    ToolUse {
        /// Tool name.
        name: String,
        /// Tool input payload.
        #[serde(default)]
        input: serde_json::Value,
    },
    /// Engine could not resume the requested transcript.
    ResumeFailed {
        /// Engine-supplied reason.
        #[serde(default)]
        reason: String,
    },
    /// Turn-level failure.
    Error {
        /// Stable error tag (see [`AppError::kind`]).
        kind: String,
        /// Human-readable message.
        message: String,
    },
    /// Terminal event carrying the resolved session identity.
    Done {
        /// Resolved session id.
        session_id: String,
        /// True when the turn degraded to history injection.
        #[serde(default)]
        degraded: bool,
    },
}

impl TurnEvent {
    /// Build an `error` event from an application error.
    #[must_use]
    pub fn from_error(err: &AppError) -> Self {
        Self::Error {
            kind: err.kind().to_owned(),
            message: err.to_string(),
        }
    }

    /// Whether this event ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
