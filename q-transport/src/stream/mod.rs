// SPDX-License-Identifier: Apache-2.0

//! A single stream's full state: the send/receive state machines from
//! `q-quic-core`, their flow-control windows, byte buffers, and the set of
//! service flags the connection's tick loop uses to decide what work a
//! stream still wants done.

mod recv_buffer;
mod send_buffer;
pub mod table;

pub use recv_buffer::RecvBuffer;
pub use send_buffer::SendBuffer;

use crate::flow_control::{FlowControlViolation, ReceiveWindow, Window};
use q_quic_core::{
    endpoint,
    stream::{
        state::{Receiver, Sender},
        StreamId, StreamType,
    },
    varint::VarInt,
};

/// Bits the tick loop consults to decide which streams still have work
/// pending, instead of scanning every stream's full state on every pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamFlags {
    /// The application is blocked on a read and should be woken once more
    /// data (or a reset) becomes available.
    pub want_read: bool,
    /// The application has unsent bytes queued.
    pub want_write: bool,
    /// A MAX_STREAM_DATA frame should be sent for this stream.
    pub send_max_stream_data: bool,
    /// A STREAM_DATA_BLOCKED frame should be sent for this stream.
    pub send_blocked: bool,
    /// A RESET_STREAM frame is queued for this stream.
    pub send_reset: bool,
    /// The application's on-close callback still needs to run.
    pub call_on_close: bool,
    /// Both halves have reached a terminal state and the stream's storage
    /// can be reclaimed.
    pub free: bool,
}

impl StreamFlags {
    pub fn any_send_work(&self) -> bool {
        self.want_write || self.send_max_stream_data || self.send_blocked || self.send_reset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("stream flow control violated")]
    FlowControl,
    #[error("illegal stream state transition")]
    InvalidTransition,
}

impl From<FlowControlViolation> for StreamError {
    fn from(_: FlowControlViolation) -> Self {
        StreamError::FlowControl
    }
}

/// One QUIC stream: identity, both directional state machines (a
/// unidirectional stream only drives the half matching its direction),
/// flow control, buffered bytes, and the service flags above.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    local: endpoint::Type,
    sender: Sender,
    receiver: Receiver,
    send_window: Window,
    recv_window: ReceiveWindow,
    send_buffer: SendBuffer,
    recv_buffer: RecvBuffer,
    final_size: Option<u64>,
    /// Bytes placed into STREAM frames that haven't yet been acked. Once
    /// this reaches zero and the FIN (if any) has been acked, the sending
    /// state machine can advance `DataSent -> DataRecvd` (spec §4.2).
    unacked_bytes: u64,
    fin_sent: bool,
    fin_acked: bool,
    pub flags: StreamFlags,
}

impl Stream {
    pub fn new(
        id: StreamId,
        local: endpoint::Type,
        initial_send_window: VarInt,
        initial_recv_window: VarInt,
    ) -> Self {
        Self {
            id,
            local,
            sender: Sender::default(),
            receiver: Receiver::default(),
            send_window: Window::new(initial_send_window),
            recv_window: ReceiveWindow::new(initial_recv_window),
            send_buffer: SendBuffer::new(),
            recv_buffer: RecvBuffer::new(),
            final_size: None,
            unacked_bytes: 0,
            fin_sent: false,
            fin_acked: false,
            flags: StreamFlags::default(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn stream_type(&self) -> StreamType {
        self.id.stream_type()
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    /// The byte offset the next unsent STREAM frame should carry.
    pub fn send_offset(&self) -> VarInt {
        self.send_window.consumed()
    }

    /// The current send-side flow-control ceiling, for STREAM_DATA_BLOCKED.
    pub fn send_window_max(&self) -> VarInt {
        self.send_window.max()
    }

    /// Queues application bytes for sending, opening the send half if it
    /// hasn't been already.
    pub fn write(&mut self, bytes: &[u8], fin: bool) -> Result<(), StreamError> {
        if matches!(self.sender, Sender::Ready) {
            self.sender
                .on_send_stream()
                .map_err(|_| StreamError::InvalidTransition)?;
        }
        self.send_buffer.push(bytes);
        if fin {
            self.send_buffer.set_fin();
        }
        self.flags.want_write = !self.send_buffer.is_empty() || fin;
        Ok(())
    }

    /// Copies up to `max_len` unsent bytes for packaging into a STREAM
    /// frame, honoring both the stream- and caller-supplied connection-level
    /// budget. Does not advance the send buffer or transition state; the
    /// caller does that via `on_data_sent` once the frame is actually queued
    /// into a packet.
    pub fn peek_send(&self, max_len: usize) -> (Vec<u8>, bool) {
        let available = self.send_window.available().as_u64().min(max_len as u64) as usize;
        let data = self.send_buffer.peek(available);
        let fin = self.send_buffer.is_fin() && data.len() as u64 == self.send_buffer.unsent_len();
        (data, fin)
    }

    pub fn on_data_sent(&mut self, len: u64, fin: bool) -> Result<(), StreamError> {
        self.send_buffer.advance(len);
        let new_offset = self
            .send_window
            .consumed()
            .saturating_add(VarInt::new(len).unwrap_or(VarInt::ZERO));
        self.send_window.consume_to(new_offset)?;
        self.unacked_bytes += len;
        self.flags.want_write = !self.send_buffer.is_empty();
        if fin {
            self.fin_sent = true;
            self.sender
                .on_send_fin()
                .map_err(|_| StreamError::InvalidTransition)?;
        }
        Ok(())
    }

    pub fn on_send_window_blocked(&mut self) {
        if self.send_window.is_blocked() {
            self.flags.send_blocked = true;
        }
    }

    /// Called when a STREAM frame carrying `len` bytes (and, if `fin`, the
    /// stream's FIN bit) is newly covered by an incoming ACK. Advances
    /// `DataSent -> DataRecvd` once every sent byte, FIN included, is acked.
    pub fn on_bytes_acked(&mut self, len: u64, fin: bool) -> Result<(), StreamError> {
        self.unacked_bytes = self.unacked_bytes.saturating_sub(len);
        if fin {
            self.fin_acked = true;
        }
        if self.unacked_bytes == 0 && self.fin_sent == self.fin_acked && matches!(self.sender, Sender::DataSent) {
            self.on_all_sent_data_acked()?;
        }
        Ok(())
    }

    pub fn on_all_sent_data_acked(&mut self) -> Result<(), StreamError> {
        self.sender
            .on_recv_all_acks()
            .map_err(|_| StreamError::InvalidTransition)?;
        self.update_free_flag();
        Ok(())
    }

    /// Queues a RESET_STREAM to be sent, abandoning any unsent data.
    pub fn reset(&mut self) -> Result<(), StreamError> {
        self.sender
            .on_queue_reset()
            .map_err(|_| StreamError::InvalidTransition)?;
        self.flags.send_reset = true;
        Ok(())
    }

    pub fn on_reset_sent(&mut self) -> Result<(), StreamError> {
        self.sender
            .on_send_reset()
            .map_err(|_| StreamError::InvalidTransition)?;
        self.flags.send_reset = false;
        Ok(())
    }

    pub fn on_reset_acked(&mut self) -> Result<(), StreamError> {
        self.sender
            .on_recv_reset_ack()
            .map_err(|_| StreamError::InvalidTransition)?;
        self.update_free_flag();
        Ok(())
    }

    /// Applies incoming STREAM frame bytes to the receive half, enforcing
    /// both the per-stream window and any final size the peer already
    /// announced.
    pub fn on_stream_data(
        &mut self,
        offset: u64,
        bytes: &[u8],
        fin: bool,
    ) -> Result<(), StreamError> {
        let end = offset + bytes.len() as u64;
        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(StreamError::InvalidTransition);
            }
        }
        let new_offset = VarInt::new(end).unwrap_or(VarInt::MAX);
        self.recv_window.on_bytes_received(new_offset)?;
        self.recv_buffer.write_at(offset, bytes);
        if fin {
            self.final_size = Some(end);
            if matches!(self.receiver, Receiver::Recv) {
                self.receiver
                    .on_receive_fin()
                    .map_err(|_| StreamError::InvalidTransition)?;
            }
        }
        if self.recv_buffer.is_readable() {
            self.flags.want_read = true;
        }
        self.maybe_complete_receive();
        Ok(())
    }

    fn maybe_complete_receive(&mut self) {
        if let Some(final_size) = self.final_size {
            if self.recv_buffer.cursor() == final_size && matches!(self.receiver, Receiver::SizeKnown) {
                let _ = self.receiver.on_receive_all_data();
            }
        }
    }

    pub fn read(&mut self) -> Option<Vec<u8>> {
        let data = self.recv_buffer.pop()?;
        self.recv_window.on_bytes_read(VarInt::new(self.recv_buffer.cursor()).unwrap_or(VarInt::MAX));
        self.flags.want_read = self.recv_buffer.is_readable();
        if matches!(self.receiver, Receiver::DataRecvd) && !self.recv_buffer.is_readable() {
            let _ = self.receiver.on_app_read_all_data();
            self.update_free_flag();
        }
        Some(data)
    }

    pub fn on_reset_received(&mut self) -> Result<(), StreamError> {
        self.receiver
            .on_reset()
            .map_err(|_| StreamError::InvalidTransition)?;
        self.flags.want_read = true;
        Ok(())
    }

    pub fn on_reset_delivered_to_app(&mut self) -> Result<(), StreamError> {
        self.receiver
            .on_app_read_reset()
            .map_err(|_| StreamError::InvalidTransition)?;
        self.update_free_flag();
        Ok(())
    }

    /// Raises the receive window if the application has consumed enough of
    /// it, returning the new limit for a MAX_STREAM_DATA frame.
    pub fn poll_window_update(&mut self) -> Option<VarInt> {
        let new_max = self.recv_window.advance_window()?;
        self.flags.send_max_stream_data = true;
        Some(new_max)
    }

    pub fn on_max_stream_data_sent(&mut self) {
        self.flags.send_max_stream_data = false;
    }

    pub fn on_max_stream_data_received(&mut self, new_max: VarInt) {
        if self.send_window.set_max(new_max) {
            self.flags.send_blocked = false;
        }
    }

    fn update_free_flag(&mut self) {
        let send_done = matches!(self.sender, Sender::DataRecvd | Sender::ResetRecvd);
        let recv_done = matches!(self.receiver, Receiver::DataRead | Receiver::ResetRead)
            || self.id.stream_type() == StreamType::Unidirectional
                && self.id.is_locally_initiated(self.local)
                && matches!(self.receiver, Receiver::Recv);
        if send_done && recv_done {
            self.flags.free = true;
            self.flags.call_on_close = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use q_quic_core::endpoint;

    fn stream() -> Stream {
        let id = StreamId::initial(endpoint::Type::Client, StreamType::Bidirectional);
        Stream::new(
            id,
            endpoint::Type::Client,
            VarInt::from_u32(1000),
            VarInt::from_u32(1000),
        )
    }

    #[test]
    fn write_then_peek_then_advance() {
        let mut s = stream();
        s.write(b"hello", false).unwrap();
        let (data, fin) = s.peek_send(3);
        assert_eq!(data, b"hel");
        assert!(!fin);
        s.on_data_sent(3, false).unwrap();
        let (data, fin) = s.peek_send(10);
        assert_eq!(data, b"lo");
        assert!(!fin);
        s.write(b"", true).unwrap();
        s.on_data_sent(2, true).unwrap();
        assert!(s.sender().is_data_sent());
    }

    #[test]
    fn receive_path_delivers_bytes_in_order() {
        let mut s = stream();
        s.on_stream_data(0, b"abc", false).unwrap();
        assert_eq!(s.read().unwrap(), b"abc");
        assert!(s.read().is_none());
        s.on_stream_data(3, b"def", true).unwrap();
        assert_eq!(s.read().unwrap(), b"def");
    }

    #[test]
    fn data_past_flow_control_window_is_rejected() {
        let mut s = stream();
        let big = vec![0u8; 2000];
        assert!(s.on_stream_data(0, &big, false).is_err());
    }

    #[test]
    fn reset_then_ack_completes_send_side() {
        let mut s = stream();
        s.reset().unwrap();
        assert!(s.flags.send_reset);
        s.on_reset_sent().unwrap();
        s.on_reset_acked().unwrap();
        assert!(s.sender().is_terminal());
    }
}
