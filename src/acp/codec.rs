//! NDJSON codec for ACP agent streams.
//!
//! Two layers:
//!
//! - [`AcpCodec`] wraps [`tokio_util::codec::LinesCodec`] with a fixed
//!   [`MAX_LINE_BYTES`] limit so an unterminated or hostile line from the
//!   agent cannot exhaust memory.
//! - [`MessageCodec`] sits on top and turns every non-empty line into a
//!   [`Frame`]: either a classified [`Message`] or a per-line
//!   [`AppError::TransportParse`].
//!
//! Per-line failures are yielded as *items*, never as decoder errors, because
//! a decoder error terminates a [`tokio_util::codec::FramedRead`] stream.
//! Only genuine I/O failures surface through `Decoder::Error`.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::acp::message::Message;
use crate::{AppError, Result};

/// Maximum line length accepted by the ACP codec: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded line: a message, or the reason that line was dropped.
pub type Frame = std::result::Result<Message, AppError>;

/// Line framing for bidirectional ACP agent streams.
///
/// Inbound lines longer than [`MAX_LINE_BYTES`] return
/// [`AppError::TransportParse`]`("line too long: …")`; the codec discards the
/// remainder of that line and resumes at the next newline. Lines that are
/// not valid UTF-8 are also consumed and reported as `TransportParse`.
#[derive(Debug)]
pub struct AcpCodec(LinesCodec);

impl AcpCodec {
    /// Create a new `AcpCodec` with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for AcpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AcpCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

impl Encoder<String> for AcpCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        // LinesCodec::encode does not enforce a max line length;
        // the limit applies only to decoding.
        self.0.encode(item, dst).map_err(map_codec_error)
    }
}

/// Message-level codec: line framing plus JSON classification.
///
/// Partial trailing bytes stay buffered in the caller's `BytesMut` across
/// reads, so the decoded sequence does not depend on chunk boundaries.
/// Empty and whitespace-only lines are skipped.
#[derive(Debug, Default)]
pub struct MessageCodec {
    lines: AcpCodec,
}

impl MessageCodec {
    /// Create a new `MessageCodec`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_frame(
        &mut self,
        src: &mut BytesMut,
        eof: bool,
    ) -> std::result::Result<Option<Frame>, AppError> {
        loop {
            let line = if eof {
                self.lines.decode_eof(src)
            } else {
                self.lines.decode(src)
            };
            match line {
                Ok(None) => return Ok(None),
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => return Ok(Some(Message::parse_line(&line))),
                Err(err @ AppError::TransportParse(_)) => return Ok(Some(Err(err))),
                Err(err) => return Err(err),
            }
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.next_frame(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.next_frame(src, true)
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = AppError;

    /// Encode `item` as one compact `\n`-terminated JSON line.
    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<()> {
        let line = serde_json::to_string(&item.to_value())
            .map_err(|e| AppError::Acp(format!("failed to serialise outbound message: {e}")))?;
        self.lines.encode(line, dst)
    }
}

// ── Private helper ────────────────────────────────────────────────────────────

/// Map a [`LinesCodecError`] to an [`AppError`].
///
/// `InvalidData` is what `LinesCodec` reports for a non-UTF-8 line after it
/// has already consumed that line, so it is a per-line failure.
fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::TransportParse(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) if io_err.kind() == std::io::ErrorKind::InvalidData => {
            AppError::TransportParse(format!("invalid utf-8: {io_err}"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
