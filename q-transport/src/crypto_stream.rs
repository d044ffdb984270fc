// SPDX-License-Identifier: Apache-2.0

//! The per-encryption-level CRYPTO stream (RFC 9000 §7, §19.6). Unlike an
//! application stream, a crypto stream has no flow-control window and no
//! sending/receiving state machine of its own: it is a single reliable,
//! ordered byte pipe the TLS session reads and writes, bounded only by a
//! buffering cap against a misbehaving peer. Crypto streams (along with the
//! HTTP/3 control and QPACK streams, once those exist) are "critical":
//! always eligible for a write tick regardless of priority (spec §4.2).

use crate::stream::{RecvBuffer, SendBuffer};

/// Refuses to buffer more than this many unreassembled bytes for a single
/// crypto stream, matching the intent of RFC 9000's CRYPTO_BUFFER_EXCEEDED.
pub const MAX_BUFFERED_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoBufferExceeded;

#[derive(Debug, Default)]
pub struct CryptoStream {
    send: SendBuffer,
    recv: RecvBuffer,
    want_read: bool,
}

impl CryptoStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.send.push(bytes);
    }

    pub fn has_unsent(&self) -> bool {
        !self.send.is_empty()
    }

    pub fn peek_send(&self, max_len: usize) -> Vec<u8> {
        self.send.peek(max_len)
    }

    pub fn send_offset(&self) -> u64 {
        self.send.base_offset()
    }

    pub fn on_data_sent(&mut self, len: u64) {
        self.send.advance(len);
    }

    /// Applies incoming CRYPTO frame bytes, rejecting the stream (and thus
    /// the connection, at the caller's discretion) if doing so would exceed
    /// the buffering cap.
    pub fn on_data(&mut self, offset: u64, bytes: &[u8]) -> Result<(), CryptoBufferExceeded> {
        let end = offset + bytes.len() as u64;
        if end.saturating_sub(self.recv.cursor()) > MAX_BUFFERED_BYTES {
            return Err(CryptoBufferExceeded);
        }
        self.recv.write_at(offset, bytes);
        if self.recv.is_readable() {
            self.want_read = true;
        }
        Ok(())
    }

    pub fn read(&mut self) -> Option<Vec<u8>> {
        let data = self.recv.pop();
        self.want_read = self.recv.is_readable();
        data
    }

    pub fn wants_read(&self) -> bool {
        self.want_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_drain_round_trips_in_order() {
        let mut cs = CryptoStream::new();
        cs.write(b"client hello");
        assert_eq!(cs.peek_send(6), b"client");
        cs.on_data_sent(6);
        assert_eq!(cs.peek_send(64), b" hello");
    }

    #[test]
    fn receive_path_reassembles_out_of_order_flights() {
        let mut cs = CryptoStream::new();
        cs.on_data(6, b"world").unwrap();
        assert!(!cs.wants_read());
        cs.on_data(0, b"hello ").unwrap();
        assert!(cs.wants_read());
        assert_eq!(cs.read().unwrap(), b"hello world");
    }

    #[test]
    fn oversized_gap_is_rejected() {
        let mut cs = CryptoStream::new();
        assert!(cs.on_data(MAX_BUFFERED_BYTES + 1, b"x").is_err());
    }
}
