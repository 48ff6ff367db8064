//! Frame scanning over byte streams
//!
//! Devices emit frames separated by a delimiter (a newline for the text
//! protocol) or of a fixed size (the binary protocol). Transports deliver
//! bytes in arbitrary chunks, so the scanner accumulates a remainder between
//! reads and only yields complete frames.
//!
//! - [`FrameBuffer`] is the pure accumulator: push bytes, pop frames.
//! - [`FrameScanner`] drives a `FrameBuffer` from an [`AsyncRead`] source.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{trace, warn};

use crate::error::LinkError;

/// Buffer size for a single read from the source
const READ_BUFFER_SIZE: usize = 512;

/// How a byte stream is split into frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Frames end with this byte sequence (not part of the frame)
    Delimited(Vec<u8>),
    /// Frames are exactly this many bytes long
    FixedLength(usize),
}

impl Framing {
    /// Newline-terminated frames
    pub fn newline() -> Self {
        Framing::Delimited(b"\n".to_vec())
    }
}

/// Accumulates bytes and splits complete frames off the front
#[derive(Debug)]
pub struct FrameBuffer {
    framing: Framing,
    buffer: BytesMut,
    /// Where the next delimiter search starts, so rescans stay linear
    scanned: usize,
}

impl FrameBuffer {
    /// Create an empty buffer for the given framing
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE * 2),
            scanned: 0,
        }
    }

    /// Append bytes read from the source
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes retained without a complete frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop the undelimited remainder
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }

    /// Split off the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Option<Bytes> {
        match &self.framing {
            Framing::Delimited(delimiter) => {
                let delimiter_len = delimiter.len();
                if delimiter_len == 0 {
                    return None;
                }
                let pos = find_subsequence(&self.buffer[self.scanned..], delimiter)
                    .map(|pos| pos + self.scanned);
                match pos {
                    Some(pos) => {
                        let frame = self.buffer.split_to(pos).freeze();
                        self.buffer.advance(delimiter_len);
                        self.scanned = 0;
                        Some(frame)
                    }
                    None => {
                        // A delimiter may straddle the next read
                        self.scanned = self.buffer.len().saturating_sub(delimiter_len - 1);
                        None
                    }
                }
            }
            Framing::FixedLength(len) => {
                let len = *len;
                if len == 0 || self.buffer.len() < len {
                    return None;
                }
                Some(self.buffer.split_to(len).freeze())
            }
        }
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() == 1 {
        return haystack.iter().position(|b| *b == needle[0]);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Yields frames read from an async byte source
///
/// The sequence ends when the source reaches end-of-stream or a read fails.
/// Bytes after the last delimiter are discarded at that point.
pub struct FrameScanner<R> {
    source: R,
    buffer: FrameBuffer,
    finished: bool,
    failure: Option<LinkError>,
}

impl<R: AsyncRead + Unpin> FrameScanner<R> {
    /// Create a scanner over `source`
    pub fn new(source: R, framing: Framing) -> Self {
        Self {
            source,
            buffer: FrameBuffer::new(framing),
            finished: false,
            failure: None,
        }
    }

    /// Check whether the source has ended
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The read failure that ended the sequence, if any
    pub fn take_failure(&mut self) -> Option<LinkError> {
        self.failure.take()
    }

    /// Read until a complete frame is available
    ///
    /// Returns `None` once the source is exhausted or fails.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            if let Some(frame) = self.buffer.next_frame() {
                trace!(size = frame.len(), "Scanned frame");
                return Some(frame);
            }
            if self.finished {
                return None;
            }
            match self.source.read(&mut buf).await {
                Ok(0) => {
                    if self.buffer.pending() > 0 {
                        trace!(
                            discarded = self.buffer.pending(),
                            "Discarding undelimited bytes at end of stream"
                        );
                    }
                    self.finish();
                    return None;
                }
                Ok(n) => {
                    trace!(bytes = n, "Read from source");
                    self.buffer.push(&buf[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Read error, ending frame sequence");
                    self.failure = Some(LinkError::ReadError(e.to_string()));
                    self.finish();
                    return None;
                }
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.buffer.clear();
    }
}

impl<R> std::fmt::Debug for FrameScanner<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScanner")
            .field("buffer", &self.buffer)
            .field("finished", &self.finished)
            .finish()
    }
}
