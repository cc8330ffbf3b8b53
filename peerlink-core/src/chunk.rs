//! Chunking: slice outbound files into fixed-size ranges, reassemble inbound chunks in arrival order.

use std::io::{self, Read, Seek, SeekFrom};

use crate::wire::MAX_FRAME_LEN;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024; // 64 KiB

/// Largest chunk whose base64 `file-chunk` message still fits in one frame, with 1 KiB
/// left for the envelope and transfer id.
pub const MAX_CHUNK_SIZE: u64 = MAX_FRAME_LEN as u64 / 4 * 3 - 1024;

/// Byte range of one chunk within a file: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    /// Bytes covered.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// Chunk size actually used for a configured one: zero means the default, and anything
/// above [`MAX_CHUNK_SIZE`] is capped.
pub fn effective_chunk_size(chunk_size: u64) -> u64 {
    match chunk_size {
        0 => DEFAULT_CHUNK_SIZE,
        n => n.min(MAX_CHUNK_SIZE),
    }
}

/// Range of the chunk starting at `offset`, or `None` once `offset` reached `total_len`.
pub fn next_range(offset: u64, total_len: u64, chunk_size: u64) -> Option<ChunkRange> {
    if offset >= total_len {
        return None;
    }
    let end = offset
        .saturating_add(effective_chunk_size(chunk_size))
        .min(total_len);
    Some(ChunkRange { start: offset, end })
}

/// Percent of `total` covered by `done`, rounded half up. An empty file counts as done.
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let done = done.min(total) as u128;
    let total = total as u128;
    ((done * 200 + total) / (total * 2)) as u8
}

/// Random-access byte source for an outbound file. Reads are issued one chunk at a
/// time, in order.
pub trait ChunkSource {
    /// Read up to `len` bytes starting at `offset`. A short read means end of source.
    fn read_slice(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read + Seek> ChunkSource for R {
    fn read_slice(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        self.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity(len);
        self.by_ref().take(len as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }
}

/// Inbound chunks for one transfer, kept in arrival order until the declared size is reached.
#[derive(Debug)]
pub struct ChunkBuffer {
    expected: u64,
    received: u64,
    chunks: Vec<Vec<u8>>,
}

/// Result of appending one chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkReceiveResult {
    /// Chunk stored; the declared size is reached and these are the reassembled bytes.
    Complete(Vec<u8>),
    /// Chunk stored; more expected.
    InProgress,
    /// Chunk would take the total past the declared size. Nothing stored.
    Overflow,
}

impl ChunkBuffer {
    pub fn new(expected: u64) -> Self {
        Self {
            expected,
            received: 0,
            chunks: Vec::new(),
        }
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Append a chunk. On completion the stored chunks are drained into one buffer.
    pub fn push(&mut self, chunk: Vec<u8>) -> ChunkReceiveResult {
        let len = chunk.len() as u64;
        let Some(total) = self.received.checked_add(len) else {
            return ChunkReceiveResult::Overflow;
        };
        if total > self.expected {
            return ChunkReceiveResult::Overflow;
        }
        self.received = total;
        self.chunks.push(chunk);
        if self.received == self.expected {
            ChunkReceiveResult::Complete(self.reassemble())
        } else {
            ChunkReceiveResult::InProgress
        }
    }

    /// Concatenate chunks in arrival order and release them.
    fn reassemble(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.received as usize);
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Drop buffered chunks without producing output.
    pub fn discard(&mut self) {
        self.chunks = Vec::new();
    }
}
