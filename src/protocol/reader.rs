//! Engine event reader.
//!
//! Reads NDJSON lines from an engine's stdout, parses each into a
//! [`TurnEvent`], and pumps events to the turn consumer incrementally.
//!
//! # Known event types
//!
//! | `type`          | Maps to                        |
//! |-----------------|--------------------------------|
//! | `session-start` | [`TurnEvent::SessionStart`]    |
//! | `text-delta`    | [`TurnEvent::TextDelta`]       |
//! | `tool-use`      | [`TurnEvent::ToolUse`]         |
//! | `resume-failed` | [`TurnEvent::ResumeFailed`]    |
//! | `error`         | [`TurnEvent::Error`]           |
//! | `done`          | [`TurnEvent::Done`]            |
//! | *(any other)*   | Skipped; logged at `DEBUG`     |

use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use super::codec::EngineCodec;
use crate::models::event::TurnEvent;
use crate::{AppError, Result};

const KNOWN_TYPES: &[&str] = &[
    "session-start",
    "text-delta",
    "tool-use",
    "resume-failed",
    "error",
    "done",
];

/// Parse a single NDJSON line from an engine stream.
///
/// - `Ok(Some(event))` — a recognised, complete event.
/// - `Ok(None)` — blank line or unknown `type` (skipped).
///
/// # Errors
///
/// - [`AppError::Engine`]`("malformed json: …")` — not valid JSON or no `type`.
/// - [`AppError::Engine`]`("invalid event: …")` — known type with bad fields.
pub fn parse_event_line(line: &str) -> Result<Option<TurnEvent>> {
    if line.trim().is_empty() {
        return Ok(None);
    }

    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| AppError::Engine(format!("malformed json: {e}")))?;

    let Some(kind) = value.get("type").and_then(serde_json::Value::as_str) else {
        return Err(AppError::Engine("malformed json: missing `type`".into()));
    };

    if !KNOWN_TYPES.contains(&kind) {
        debug!(event_type = kind, "engine reader: skipping unknown event type");
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| AppError::Engine(format!("invalid event: {e}")))
}

/// Incremental event reader over an engine's stdout.
pub struct EventReader<R> {
    framed: FramedRead<R, EngineCodec>,
    label: String,
}

impl<R> EventReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap `stdout`; `label` identifies the invocation in logs.
    pub fn new(label: impl Into<String>, stdout: R) -> Self {
        Self {
            framed: FramedRead::new(stdout, EngineCodec::new()),
            label: label.into(),
        }
    }

    /// Next recognised event, `None` on EOF.
    ///
    /// Over-long, malformed and unknown lines are logged and skipped; they do
    /// not end the stream.
    ///
    /// # Errors
    ///
    /// Returns the underlying error on a non-recoverable I/O failure.
    pub async fn next_event(&mut self) -> Option<Result<TurnEvent>> {
        let mut after_framing_error = false;
        loop {
            let item = match self.framed.next().await {
                Some(item) => item,
                // FramedRead pauses with a single `None` after a decode error.
                None if after_framing_error => {
                    after_framing_error = false;
                    continue;
                }
                None => return None,
            };
            after_framing_error = false;
            match item {
                Err(AppError::Engine(ref msg)) => {
                    warn!(label = %self.label, error = msg.as_str(), "engine reader: framing error, skipping");
                    after_framing_error = true;
                }
                Err(err) => return Some(Err(err)),
                Ok(line) => match parse_event_line(&line) {
                    Ok(Some(event)) => return Some(Ok(event)),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(label = %self.label, error = %err, raw_line = %line, "engine reader: parse error, skipping line");
                    }
                },
            }
        }
    }
}

/// What happened while pumping one invocation's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpOutcome {
    /// Events delivered to the consumer.
    pub forwarded: usize,
    /// A `done` event was seen.
    pub saw_done: bool,
    /// The consumer hung up; later output was drained and discarded.
    pub consumer_gone: bool,
    /// The deadline elapsed before the engine finished.
    pub timed_out: bool,
}

/// Caller-facing end of one turn's event channel.
///
/// Closing the sink drops the sender so the caller's stream ends, while the
/// invocation behind it can keep running and be drained.
#[derive(Debug)]
pub struct TurnSink {
    tx: Option<mpsc::Sender<TurnEvent>>,
}

impl TurnSink {
    /// Sink delivering into `tx`.
    #[must_use]
    pub fn new(tx: mpsc::Sender<TurnEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Deliver `event`; `false` if the sink is closed or the caller hung up.
    pub async fn send(&self, event: TurnEvent) -> bool {
        match &self.tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Stop delivering. The caller sees end-of-stream once this was the last
    /// sender.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Whether [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

/// Forward events from `reader` into `sink` until EOF.
///
/// Output is always drained to EOF so the engine never blocks on a full pipe,
/// even after the consumer disconnected or the deadline passed. When
/// `deadline` elapses an `exec-timeout` error event is sent once and the sink
/// is closed, ending the caller's stream; the engine itself is left to run.
///
/// # Errors
///
/// Returns an I/O error from the underlying stream.
pub async fn pump_events<R>(
    reader: &mut EventReader<R>,
    sink: &mut TurnSink,
    deadline: Duration,
) -> Result<PumpOutcome>
where
    R: AsyncRead + Unpin,
{
    let mut outcome = PumpOutcome::default();
    let label = reader.label.clone();
    let timer = tokio::time::sleep(deadline);
    tokio::pin!(timer);

    loop {
        let next = tokio::select! {
            biased;
            next = reader.next_event() => next,
            () = &mut timer, if !outcome.timed_out => {
                outcome.timed_out = true;
                warn!(label = %label, ?deadline, "engine exceeded exec deadline");
                if !outcome.consumer_gone {
                    let err = AppError::ExecTimeout(format!("no completion within {deadline:?}"));
                    sink.send(TurnEvent::from_error(&err)).await;
                }
                sink.close();
                continue;
            }
        };

        let event = match next {
            None => break,
            Some(Err(err)) => return Err(err),
            Some(Ok(event)) => event,
        };

        if matches!(event, TurnEvent::Done { .. }) {
            outcome.saw_done = true;
        }

        if outcome.consumer_gone || outcome.timed_out {
            continue;
        }

        if sink.send(event).await {
            outcome.forwarded += 1;
        } else {
            debug!(label = %label, "engine reader: consumer gone, draining");
            outcome.consumer_gone = true;
        }
    }

    Ok(outcome)
}
