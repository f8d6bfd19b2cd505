//! Line-delimited JSON front end over stdin/stdout.
//!
//! Each input line is either a turn:
//!
//! ```json
//! {"request_id":"r1","session_id":"s1","workspace_id":"acme","working_directory":"/src/acme","message":"hi"}
//! ```
//!
//! or a control operation: `{"op":"delete_workspace","slug":"acme"}`,
//! `{"op":"status"}`. Every output line carries the `request_id` it
//! answers; turn events arrive as `{"request_id":..,"event":{..}}`.
//!
//! This front end acts as the session owner: unknown sessions are created
//! on their first turn and completed turns are appended to history.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::event::TurnEvent;
use crate::models::session::{HistoryMessage, Session};
use crate::models::turn::TurnRequest;
use crate::orchestrator::TurnOrchestrator;
use crate::store::SessionStore;
use crate::{AppError, Result};

const OUTPUT_CAPACITY: usize = 256;

/// Control operations.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlOp {
    /// Delete a workspace.
    DeleteWorkspace {
        /// Correlation id.
        #[serde(default)]
        request_id: Option<String>,
        /// Workspace slug.
        slug: String,
    },
    /// Report tracked containers.
    Status {
        /// Correlation id.
        #[serde(default)]
        request_id: Option<String>,
    },
}

/// A turn line.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TurnLine {
    /// Correlation id; generated when absent.
    #[serde(default)]
    pub request_id: Option<String>,
    /// The turn itself.
    #[serde(flatten)]
    pub turn: TurnRequest,
}

/// One parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Run a turn.
    Turn(TurnLine),
    /// Run a control operation.
    Control(ControlOp),
}

/// Parse one input line.
///
/// # Errors
///
/// Returns `AppError::InvalidInput` for malformed JSON or missing fields.
pub fn parse_inbound(line: &str) -> Result<Inbound> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| AppError::InvalidInput(format!("malformed json: {e}")))?;
    if value.get("op").is_some() {
        serde_json::from_value(value)
            .map(Inbound::Control)
            .map_err(|e| AppError::InvalidInput(format!("invalid control op: {e}")))
    } else {
        serde_json::from_value(value)
            .map(Inbound::Turn)
            .map_err(|e| AppError::InvalidInput(format!("invalid turn: {e}")))
    }
}

/// Serve the stdio front end until EOF or cancellation.
///
/// # Errors
///
/// Returns `AppError::Io` if stdin cannot be read.
pub async fn serve_stdio(
    orchestrator: Arc<TurnOrchestrator>,
    sessions: Arc<dyn SessionStore>,
    ct: CancellationToken,
) -> Result<()> {
    serve(orchestrator, sessions, tokio::io::stdin(), tokio::io::stdout(), ct).await
}

/// Serve the line protocol over arbitrary streams.
///
/// On EOF, in-flight turns are awaited before returning.
///
/// # Errors
///
/// Returns `AppError::Io` if `input` cannot be read.
pub async fn serve<R, W>(
    orchestrator: Arc<TurnOrchestrator>,
    sessions: Arc<dyn SessionStore>,
    input: R,
    output: W,
    ct: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel::<String>(OUTPUT_CAPACITY);
    let writer = tokio::spawn(write_lines(output, out_rx));

    let mut lines = BufReader::new(input).lines();
    let mut turns = JoinSet::new();
    info!("stdio front end ready");

    loop {
        let line = tokio::select! {
            () = ct.cancelled() => {
                info!("stdio front end cancelled");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            debug!("stdin closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_inbound(&line) {
            Ok(Inbound::Turn(turn)) => {
                let request_id = turn
                    .request_id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                turns.spawn(run_turn(
                    Arc::clone(&orchestrator),
                    Arc::clone(&sessions),
                    turn.turn,
                    request_id,
                    out_tx.clone(),
                ));
            }
            Ok(Inbound::Control(op)) => {
                let reply = run_control(&orchestrator, op).await;
                let _ = out_tx.send(reply).await;
            }
            Err(err) => {
                warn!(%err, "rejecting input line");
                let _ = out_tx.send(event_line("", &TurnEvent::from_error(&err))).await;
            }
        }
    }

    if !ct.is_cancelled() {
        while turns.join_next().await.is_some() {}
    }
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn write_lines<W>(mut output: W, mut rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        if let Err(err) = output.write_all(line.as_bytes()).await {
            warn!(%err, "stdout write failed");
            return;
        }
        let _ = output.flush().await;
    }
}

fn event_line(request_id: &str, event: &TurnEvent) -> String {
    json!({ "request_id": request_id, "event": event }).to_string()
}

async fn run_control(orchestrator: &TurnOrchestrator, op: ControlOp) -> String {
    match op {
        ControlOp::DeleteWorkspace { request_id, slug } => {
            let request_id = request_id.unwrap_or_default();
            match orchestrator.delete_workspace(&slug).await {
                Ok(report) => json!({
                    "request_id": request_id,
                    "deleted": slug,
                    "storage_removed": report.storage_removed,
                    "record_removed": report.record_removed,
                })
                .to_string(),
                Err(err) => event_line(&request_id, &TurnEvent::from_error(&err)),
            }
        }
        ControlOp::Status { request_id } => {
            let containers = orchestrator.status().await;
            json!({
                "request_id": request_id.unwrap_or_default(),
                "containers": containers,
            })
            .to_string()
        }
    }
}

async fn ensure_session(sessions: &dyn SessionStore, turn: &TurnRequest) -> Result<()> {
    if sessions.get(&turn.session_id).await?.is_none() {
        let session = Session::new(
            turn.session_id.clone(),
            turn.workspace_id.clone(),
            turn.working_directory.clone(),
        );
        sessions.upsert(session).await?;
        info!(session_id = %turn.session_id, "session created");
    }
    Ok(())
}

async fn run_turn(
    orchestrator: Arc<TurnOrchestrator>,
    sessions: Arc<dyn SessionStore>,
    turn: TurnRequest,
    request_id: String,
    out: mpsc::Sender<String>,
) {
    let session_id = turn.session_id.clone();
    let message = turn.message.clone();

    let started = match ensure_session(sessions.as_ref(), &turn).await {
        Ok(()) => orchestrator.submit_turn_with_id(turn, request_id.clone()).await,
        Err(err) => Err(err),
    };
    let mut rx = match started {
        Ok(rx) => rx,
        Err(err) => {
            if err.is_fatal_trust_boundary() {
                error!(%err, session_id, "untrusted turn refused, no sandbox available");
            } else {
                warn!(%err, session_id, "turn rejected");
            }
            let _ = out
                .send(event_line(&request_id, &TurnEvent::from_error(&err)))
                .await;
            return;
        }
    };

    let mut reply = String::new();
    let mut completed = false;
    while let Some(event) = rx.recv().await {
        match &event {
            TurnEvent::TextDelta { text } => reply.push_str(text),
            TurnEvent::Done { .. } => completed = true,
            _ => {}
        }
        let _ = out.send(event_line(&request_id, &event)).await;
    }

    if completed {
        for entry in [
            HistoryMessage::new("user", message),
            HistoryMessage::new("assistant", reply),
        ] {
            if let Err(err) = sessions.append_message(&session_id, entry).await {
                warn!(%err, session_id, "failed to record history");
            }
        }
    }
}
