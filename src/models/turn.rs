//! Turn requests and trust decisions.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::session::TrustLevel;

/// A caller's request to run one turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnRequest {
    /// Caller session identifier.
    pub session_id: String,
    /// Workspace the session runs in, if any.
    #[serde(default)]
    pub workspace_id: Option<String>,
    /// Explicit per-turn trust override.
    #[serde(default)]
    pub trust_override: Option<TrustLevel>,
    /// Absolute host working directory.
    pub working_directory: PathBuf,
    /// User message for this turn.
    pub message: String,
    /// Opaque capability configuration passed through to the engine.
    #[serde(default)]
    pub capability_config: serde_json::Value,
}

/// Where the effective trust level came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrustSource {
    /// Per-turn override.
    Override,
    /// Value stored on the session.
    Session,
    /// Workspace default.
    Workspace,
    /// Built-in default.
    Default,
}

/// Result of trust resolution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustDecision {
    /// Trust level the turn runs with.
    pub effective_trust: TrustLevel,
    /// Which input decided it.
    pub source: TrustSource,
}

/// Request handed to a runtime for one engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    /// Message actually sent to the engine (may carry injected history).
    pub message: String,
    /// Caller session id, used as the engine's transcript identity.
    pub session_id: String,
    /// Set when the engine should resume an existing transcript.
    pub resume_session_id: Option<String>,
    /// Host working directory.
    pub working_directory: PathBuf,
    /// Opaque capability configuration.
    pub capability_config: serde_json::Value,
    /// Correlation id for logs and exec environment.
    pub request_id: String,
}
