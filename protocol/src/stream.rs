//! Stream framing for the multiplexed agent I/O channel.
//!
//! ```text
//! +-------------------+----------------+------------------+
//! | seq (8 bytes, BE) | len (4 bytes)  | payload (len B)  |
//! +-------------------+----------------+------------------+
//! ```
//!
//! `len` is the payload length (total frame length minus 12). A zero-length
//! payload is the end-of-stream sentinel for that sequence.

use crate::error::ProtocolError;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Fixed header: sequence number + payload length.
pub const STREAM_HEADER_LEN: usize = 12;

/// Writes larger than this are fragmented into multiple frames sharing one
/// sequence number.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl StreamFrame {
    pub fn new(seq: u64, payload: Vec<u8>) -> Result<Self, ProtocolError> {
        if payload.len() > u32::MAX as usize {
            return Err(ProtocolError::PayloadTooLarge);
        }
        Ok(Self { seq, payload })
    }

    /// The terminal frame for a sequence.
    pub fn end_of_stream(seq: u64) -> Self {
        Self {
            seq,
            payload: Vec::new(),
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        STREAM_HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Split `data` into frames no larger than `max_payload`, all tagged with
/// `seq`. Empty input yields no frames; end-of-stream is explicit via
/// [`StreamFrame::end_of_stream`].
pub fn fragment(seq: u64, data: &[u8], max_payload: usize) -> Vec<StreamFrame> {
    assert!(max_payload > 0);
    data.chunks(max_payload)
        .map(|chunk| StreamFrame {
            seq,
            payload: chunk.to_vec(),
        })
        .collect()
}

/// Streaming parser: accumulates channel bytes and emits whole frames.
/// Partial frames remain buffered.
#[derive(Default)]
pub struct StreamDecoder {
    buf: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<StreamFrame> {
        if self.buf.len() < STREAM_HEADER_LEN {
            return None;
        }
        let seq = u64::from_be_bytes([
            self.buf[0], self.buf[1], self.buf[2], self.buf[3], self.buf[4], self.buf[5],
            self.buf[6], self.buf[7],
        ]);
        let len = u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]])
            as usize;
        if self.buf.len() < STREAM_HEADER_LEN + len {
            return None;
        }

        let payload = self.buf[STREAM_HEADER_LEN..STREAM_HEADER_LEN + len].to_vec();
        self.buf.drain(..STREAM_HEADER_LEN + len);

        Some(StreamFrame { seq, payload })
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Write one frame to an async stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &StreamFrame,
) -> Result<(), ProtocolError> {
    writer.write_all(&frame.encode()).await?;
    Ok(())
}
