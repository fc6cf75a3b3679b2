//! Newline-delimited JSON framing for the worker socket.
//!
//! The wire format is one UTF-8 JSON document per line: each message is
//! serialized to a single JSON document and terminated by `\n`. The decoder
//! accumulates raw socket chunks and yields complete frames; a message cut
//! short by a chunk boundary stays buffered until the rest arrives.

use serde::Serialize;
use tracing::warn;

/// Incremental decoder splitting a raw byte stream into complete frames.
///
/// Frames longer than the configured limit are discarded (including the
/// buffered prefix of a frame whose delimiter has not arrived yet); the
/// stream itself continues at the next delimiter.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_bytes: usize,
    discarding: bool,
}

impl FrameDecoder {
    /// Create a decoder that tolerates frames up to `max_frame_bytes` long.
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
            discarding: false,
        }
    }

    /// Append a chunk from the socket and return the frames it completed,
    /// in arrival order.
    ///
    /// Blank lines (worker keepalives) are skipped. A trailing `\r` is
    /// stripped so CRLF-delimited peers are tolerated.
    #[must_use]
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0_usize;

        while let Some(offset) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let mut line = &self.buf[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }

            if self.discarding {
                // Tail of a frame that already blew the size limit.
                self.discarding = false;
            } else if line.len() > self.max_frame_bytes {
                warn!(
                    frame_bytes = line.len(),
                    limit = self.max_frame_bytes,
                    "discarding oversized frame"
                );
            } else if !line.is_empty() {
                frames.push(line.to_vec());
            }

            start = end + 1;
        }

        self.buf.drain(..start);

        // No delimiter in sight and the partial frame is already too large:
        // drop the buffered prefix and skip until the next delimiter.
        if !self.discarding && self.buf.len() > self.max_frame_bytes {
            warn!(
                buffered_bytes = self.buf.len(),
                limit = self.max_frame_bytes,
                "partial frame exceeds size limit, discarding until next delimiter"
            );
            self.buf.clear();
            self.discarding = true;
        }

        frames
    }

    /// Number of bytes buffered awaiting a delimiter.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Serialize a message into its wire form: one JSON document plus the
/// record separator.
pub fn encode<M: Serialize>(message: &M) -> crate::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}
