//! # Frame Chunking
//!
//! Slices audio in both directions of the relay:
//!
//! - **Inbound** ([`InboundChunker`]): client audio is split into fixed-size
//!   slices before being handed to the upstream transport. Every byte is
//!   forwarded exactly once and in order.
//! - **Outbound** ([`OutboundAccumulator`]): upstream audio arrives in small,
//!   irregular pieces and is regrouped into frames of a target size before
//!   being pushed to the client. A partial remainder is only released by an
//!   explicit [`OutboundAccumulator::flush`].

/// Splits inbound audio into slices of at most `chunk_size` bytes.
#[derive(Debug, Clone, Copy)]
pub struct InboundChunker {
    chunk_size: usize,
}

impl InboundChunker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Borrowed slices over `data`. All but the last are exactly `chunk_size` long.
    pub fn slices<'a>(&self, data: &'a [u8]) -> std::slice::Chunks<'a, u8> {
        data.chunks(self.chunk_size)
    }
}

/// Regroups outbound audio into frames of exactly `frame_size` bytes.
#[derive(Debug)]
pub struct OutboundAccumulator {
    buffer: Vec<u8>,
    frame_size: usize,
}

impl OutboundAccumulator {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            buffer: Vec::with_capacity(frame_size * 2),
            frame_size,
        }
    }

    /// Append bytes and return every complete frame now available.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_size {
            let rest = self.buffer.split_off(self.frame_size);
            frames.push(std::mem::replace(&mut self.buffer, rest));
        }
        frames
    }

    /// Release whatever is buffered, even if shorter than a frame.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Drop buffered bytes without releasing them. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
