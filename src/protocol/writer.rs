//! Engine request writer.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::EngineRequest;
use crate::{AppError, Result};

/// Serialize `request` as one NDJSON line onto `stdin`, then close it.
///
/// Closing stdin signals end-of-request to the engine.
///
/// # Errors
///
/// Returns [`AppError::Engine`] if serialization or the write fails (for
/// example because the engine process already exited).
pub async fn write_request<W>(mut stdin: W, request: &EngineRequest) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(request)
        .map_err(|e| AppError::Engine(format!("failed to serialise request: {e}")))?;
    bytes.push(b'\n');

    stdin
        .write_all(&bytes)
        .await
        .map_err(|e| AppError::Engine(format!("write failed: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| AppError::Engine(format!("flush failed: {e}")))?;
    stdin
        .shutdown()
        .await
        .map_err(|e| AppError::Engine(format!("close failed: {e}")))?;

    debug!(
        resume = request.resume_session_id.is_some(),
        bytes = bytes.len(),
        "engine request written"
    );
    Ok(())
}
