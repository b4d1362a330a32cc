//! Bounded capture of a skill's stdout and stderr.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

/// Byte buffer that keeps at most `limit` bytes and silently discards the
/// rest, so a producer can be drained to EOF without unbounded growth.
#[derive(Debug, Clone)]
pub struct CappedBuffer {
    limit: usize,
    buf: Vec<u8>,
    discarded: u64,
}

impl CappedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: Vec::with_capacity(limit.min(8 * 1024)),
            discarded: 0,
        }
    }

    /// Append a chunk. Returns `true` only on the call that first drops
    /// bytes.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        let was_truncated = self.is_truncated();
        let room = self.limit.saturating_sub(self.buf.len());
        let take = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..take]);
        self.discarded += (chunk.len() - take) as u64;
        !was_truncated && self.is_truncated()
    }

    pub fn is_truncated(&self) -> bool {
        self.discarded > 0
    }

    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Lossy UTF-8 text, never longer than the limit in bytes.
    pub fn to_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if text.len() > self.limit {
            let end = text.floor_char_boundary(self.limit);
            text.truncate(end);
        }
        text
    }
}
