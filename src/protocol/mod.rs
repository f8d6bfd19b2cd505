//! Agent engine wire protocol.
//!
//! The engine is invoked once per turn. It reads a single NDJSON request on
//! stdin and answers with NDJSON [`TurnEvent`](crate::models::event::TurnEvent)s
//! on stdout, terminated by a `done` event. The same framing is used for
//! host (direct) and in-container invocations.
//!
//! Submodules:
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based framing with a line cap.
//! - `reader`: parses stdout lines into events and pumps them to a consumer.
//! - `writer`: serializes the request line onto stdin.

pub mod codec;
pub mod reader;
pub mod writer;

use serde::{Deserialize, Serialize};

/// Request line written to the engine's stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineRequest {
    /// Message for this turn, possibly prefixed with injected history.
    pub message: String,
    /// Transcript to resume, when native resume applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    /// Opaque capability configuration.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub capabilities: serde_json::Value,
}

/// Environment variable carrying the transcript identity.
pub const ENV_SESSION_ID: &str = "PARACHUTE_SESSION_ID";
/// Environment variable carrying the agent type.
pub const ENV_AGENT_TYPE: &str = "PARACHUTE_AGENT_TYPE";
/// Environment variable carrying the request correlation id.
pub const ENV_REQUEST_ID: &str = "PARACHUTE_REQUEST_ID";

impl From<&crate::models::turn::ExecutionRequest> for EngineRequest {
    fn from(request: &crate::models::turn::ExecutionRequest) -> Self {
        Self {
            message: request.message.clone(),
            resume_session_id: request.resume_session_id.clone(),
            capabilities: request.capability_config.clone(),
        }
    }
}
