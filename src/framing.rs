//! Delimiter-based framing of the raw serial byte stream.
//!
//! Scanners send one message per scan, terminated by a single delimiter byte
//! (carriage return by default). [`FrameAssembler`] accumulates bytes until the
//! delimiter arrives and then hands out the trimmed payload as a [`Frame`].
//!
//! Bad input never poisons the assembler: an undecodable or oversized frame is
//! reported as a [`FramingError`] and accumulation restarts with the next frame.

use thiserror::Error;
use tracing::{trace, warn};

/// Default frame boundary: carriage return.
pub const DEFAULT_DELIMITER: u8 = b'\r';

/// Default cap on buffered bytes for a single frame.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4096;

/// A complete, trimmed, non-empty message extracted from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: String,
}

impl Frame {
    /// The decoded payload.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Consume the frame, yielding its payload.
    pub fn into_payload(self) -> String {
        self.payload
    }
}

/// Non-fatal problems found while assembling a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// The buffered bytes were not valid UTF-8.
    #[error("discarded {len} bytes that are not valid UTF-8")]
    InvalidEncoding {
        /// Number of bytes discarded.
        len: usize,
    },

    /// No delimiter arrived within the configured frame size.
    #[error("frame exceeded {limit} bytes without a delimiter")]
    Oversized {
        /// Configured maximum frame length.
        limit: usize,
    },

    /// The payload contains a line break and cannot be stored as one log line.
    #[error("frame contains an embedded line break")]
    EmbeddedLineBreak,
}

/// Turns a byte stream into delimiter-terminated frames.
#[derive(Debug)]
pub struct FrameAssembler {
    delimiter: u8,
    max_frame_len: usize,
    buffer: Vec<u8>,
    /// Set after an oversize error; input is dropped until the next delimiter.
    discarding: bool,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_DELIMITER, DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameAssembler {
    /// Create an assembler splitting on `delimiter` and holding at most
    /// `max_frame_len` bytes of a pending frame.
    pub fn new(delimiter: u8, max_frame_len: usize) -> Self {
        Self {
            delimiter,
            max_frame_len: max_frame_len.max(1),
            buffer: Vec::with_capacity(max_frame_len.clamp(1, 256)),
            discarding: false,
        }
    }

    /// Bytes currently buffered for the pending frame.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partially assembled frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    /// Feed one byte.
    ///
    /// Returns `Some(Ok(frame))` when the byte completes a non-empty frame,
    /// `Some(Err(_))` when the pending frame had to be discarded, and `None`
    /// otherwise (including for empty frames, which are suppressed).
    pub fn feed(&mut self, byte: u8) -> Option<Result<Frame, FramingError>> {
        if byte == self.delimiter {
            if self.discarding {
                self.discarding = false;
                return None;
            }
            return self.complete();
        }

        if self.discarding {
            return None;
        }

        if self.buffer.len() >= self.max_frame_len {
            warn!(
                pending_len = self.buffer.len(),
                max_frame_len = self.max_frame_len,
                "Dropping oversized frame without delimiter"
            );
            self.buffer.clear();
            self.discarding = true;
            return Some(Err(FramingError::Oversized {
                limit: self.max_frame_len,
            }));
        }

        self.buffer.push(byte);
        None
    }

    /// Feed a chunk of bytes, collecting every outcome in stream order.
    pub fn feed_chunk(&mut self, chunk: &[u8]) -> Vec<Result<Frame, FramingError>> {
        trace!(chunk_len = chunk.len(), "Feeding chunk into FrameAssembler");
        chunk.iter().filter_map(|&byte| self.feed(byte)).collect()
    }

    fn complete(&mut self) -> Option<Result<Frame, FramingError>> {
        let bytes = std::mem::take(&mut self.buffer);
        let len = bytes.len();

        let text = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, len, "Dropping non-UTF8 frame");
                return Some(Err(FramingError::InvalidEncoding { len }));
            }
        };

        let payload = text.trim();
        if payload.is_empty() {
            return None;
        }
        if payload.contains(['\r', '\n']) {
            warn!("Dropping frame with embedded line break");
            return Some(Err(FramingError::EmbeddedLineBreak));
        }

        trace!(payload, "Framed message");
        Some(Ok(Frame {
            payload: payload.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(outcomes: Vec<Result<Frame, FramingError>>) -> Vec<String> {
        outcomes
            .into_iter()
            .filter_map(Result::ok)
            .map(Frame::into_payload)
            .collect()
    }

    #[test]
    fn split_frame_is_reassembled() {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.feed_chunk(b"AB").is_empty());
        assert!(assembler.feed_chunk(b"C12").is_empty());
        assert_eq!(frames(assembler.feed_chunk(b"3\r")), vec!["ABC123"]);
        assert_eq!(assembler.pending_len(), 0);
    }

    #[test]
    fn byte_at_a_time_matches_chunk_feeding() {
        let mut assembler = FrameAssembler::default();
        let mut out = Vec::new();
        for &b in b"ABC123\r" {
            if let Some(outcome) = assembler.feed(b) {
                out.push(outcome);
            }
        }
        assert_eq!(frames(out), vec!["ABC123"]);
    }

    #[test]
    fn empty_frames_are_suppressed() {
        let mut assembler = FrameAssembler::default();
        assert!(assembler.feed_chunk(b"\r\r").is_empty());
        assert!(assembler.feed_chunk(b"   \r").is_empty());
    }

    #[test]
    fn surrounding_whitespace_is_trimmed() {
        let mut assembler = FrameAssembler::default();
        assert_eq!(frames(assembler.feed_chunk(b"  X1 \t\r\nX2\r")), vec!["X1", "X2"]);
    }

    #[test]
    fn several_frames_in_one_chunk_keep_order() {
        let mut assembler = FrameAssembler::default();
        assert_eq!(
            frames(assembler.feed_chunk(b"A\rB\rC\rD")),
            vec!["A", "B", "C"]
        );
        assert_eq!(assembler.pending_len(), 1);
    }

    #[test]
    fn invalid_utf8_discards_only_that_frame() {
        let mut assembler = FrameAssembler::default();
        let out = assembler.feed_chunk(b"\xff\xfe\rOK\r");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Err(FramingError::InvalidEncoding { len: 2 }));
        assert_eq!(out[1].as_ref().map(Frame::payload), Ok("OK"));
    }

    #[test]
    fn multibyte_utf8_split_across_chunks_decodes() {
        let mut assembler = FrameAssembler::default();
        let bytes = "ÅÄÖ-1\r".as_bytes();
        assert!(assembler.feed_chunk(&bytes[..1]).is_empty());
        assert_eq!(frames(assembler.feed_chunk(&bytes[1..])), vec!["ÅÄÖ-1"]);
    }

    #[test]
    fn oversized_frame_reported_once_and_tail_dropped() {
        let mut assembler = FrameAssembler::new(b'\r', 4);
        let out = assembler.feed_chunk(b"ABCDEFGHIJ\rNEXT\r");
        assert_eq!(
            out,
            vec![
                Err(FramingError::Oversized { limit: 4 }),
                Ok(Frame {
                    payload: "NEXT".into()
                }),
            ]
        );
    }

    #[test]
    fn frame_at_exact_limit_is_accepted() {
        let mut assembler = FrameAssembler::new(b'\r', 4);
        assert_eq!(frames(assembler.feed_chunk(b"ABCD\r")), vec!["ABCD"]);
    }

    #[test]
    fn embedded_line_break_is_rejected() {
        let mut assembler = FrameAssembler::new(b';', 64);
        let out = assembler.feed_chunk(b"AB\nCD;");
        assert_eq!(out, vec![Err(FramingError::EmbeddedLineBreak)]);
    }

    #[test]
    fn custom_delimiter_is_not_part_of_payload() {
        let mut assembler = FrameAssembler::new(b';', 64);
        assert_eq!(frames(assembler.feed_chunk(b"A1;B2;")), vec!["A1", "B2"]);
    }

    #[test]
    fn reset_drops_partial_frame() {
        let mut assembler = FrameAssembler::default();
        assembler.feed_chunk(b"AB");
        assembler.reset();
        assert_eq!(frames(assembler.feed_chunk(b"C\r")), vec!["C"]);
    }
}
