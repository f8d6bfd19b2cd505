//! Inbound framing for engine stdout.
//!
//! Engines print one JSON event per line. Anything running inside a sandbox
//! controls that output, so a line is capped before it is buffered in full:
//! past the cap the decoder reports a framing error, drops bytes up to the
//! next newline and resumes with the following event.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Longest event line accepted from an engine: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Decoder splitting engine stdout into event lines.
///
/// The request direction is a single line written by
/// [`write_request`](super::writer::write_request) and needs no codec.
#[derive(Debug)]
pub struct EngineCodec {
    lines: LinesCodec,
    max_line: usize,
}

impl EngineCodec {
    /// Decoder capped at [`MAX_LINE_BYTES`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }

    /// Decoder capped at `max_line` bytes per event.
    #[must_use]
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line),
            max_line,
        }
    }

    /// The per-line cap.
    #[must_use]
    pub fn max_line(&self) -> usize {
        self.max_line
    }

    fn framing_error(&self, err: LinesCodecError) -> AppError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => AppError::Engine(format!(
                "line too long: event exceeded {} bytes",
                self.max_line
            )),
            LinesCodecError::Io(err) => AppError::Io(err.to_string()),
        }
    }
}

impl Default for EngineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EngineCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        self.lines.decode(src).map_err(|err| self.framing_error(err))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        self.lines
            .decode_eof(src)
            .map_err(|err| self.framing_error(err))
    }
}
