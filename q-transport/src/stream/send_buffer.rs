// SPDX-License-Identifier: Apache-2.0

//! Outgoing byte storage for a single stream's send side: a queue of chunks
//! the application has written, consumed from the front as bytes are
//! packaged into STREAM frames and retained until acknowledged.

use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct SendBuffer {
    /// The stream offset of the first byte in `chunks`.
    base_offset: u64,
    chunks: VecDeque<Vec<u8>>,
    /// Total bytes currently queued across `chunks`.
    len: u64,
    fin: bool,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len() as u64;
        self.chunks.push_back(bytes.to_vec());
    }

    pub fn set_fin(&mut self) {
        self.fin = true;
    }

    pub fn is_fin(&self) -> bool {
        self.fin
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn unsent_len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies up to `max_len` unsent bytes starting at the current base
    /// offset into a single contiguous buffer, for packaging into a STREAM
    /// frame. Does not consume anything; call `advance` once the bytes are
    /// known to have been sent.
    pub fn peek(&self, max_len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(max_len.min(self.len as usize));
        for chunk in &self.chunks {
            if out.len() >= max_len {
                break;
            }
            let take = (max_len - out.len()).min(chunk.len());
            out.extend_from_slice(&chunk[..take]);
        }
        out
    }

    /// Drops `n` bytes from the front, advancing the base offset. Called
    /// once those bytes have been placed into a packet.
    pub fn advance(&mut self, mut n: u64) {
        self.base_offset += n;
        self.len = self.len.saturating_sub(n);
        while n > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let front_len = front.len() as u64;
            if n >= front_len {
                n -= front_len;
                self.chunks.pop_front();
            } else {
                front.drain(..n as usize);
                n = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_spans_multiple_chunks_without_consuming() {
        let mut buf = SendBuffer::new();
        buf.push(b"hello ");
        buf.push(b"world");
        assert_eq!(buf.peek(8), b"hello wo");
        assert_eq!(buf.unsent_len(), 11);
    }

    #[test]
    fn advance_drops_sent_bytes_and_moves_base_offset() {
        let mut buf = SendBuffer::new();
        buf.push(b"hello world");
        buf.advance(6);
        assert_eq!(buf.base_offset(), 6);
        assert_eq!(buf.peek(5), b"world");
    }

    #[test]
    fn advance_can_cross_a_chunk_boundary() {
        let mut buf = SendBuffer::new();
        buf.push(b"abc");
        buf.push(b"def");
        buf.advance(4);
        assert_eq!(buf.peek(2), b"ef");
    }
}
