// SPDX-License-Identifier: Apache-2.0

//! The outbound counterpart to `q_quic_core::frame::Frame`: owned frame
//! values the connection queues for transmission, and the [`Packet`] they
//! get assembled into. Turning a `Packet` into wire bytes under AEAD
//! protection is the (out-of-scope) encoder's job; the core only ever hands
//! the encoder this struct (§4.4, §6 "Wire format").

use bytes::Bytes;
use q_quic_core::{
    connection::id::{LocalId, StatelessResetToken},
    frame::StreamIdKind,
    packet::number::PacketNumberSpace,
    stream::StreamId,
    varint::VarInt,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckPayload {
    pub largest_acknowledged: VarInt,
    pub ack_delay: VarInt,
    pub ranges: Vec<q_quic_core::frame::AckRange>,
    pub ecn_counts: Option<q_quic_core::frame::EcnCounts>,
}

/// The owned, queueable form of every frame type the connection itself
/// originates. NEW_TOKEN and 0-RTT-specific bookkeeping are omitted: token
/// issuance is a server-policy concern the embedder drives directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    Padding { length: usize },
    Ping,
    Ack(AckPayload),
    ResetStream {
        stream_id: StreamId,
        application_error_code: VarInt,
        final_size: VarInt,
    },
    StopSending {
        stream_id: StreamId,
        application_error_code: VarInt,
    },
    Crypto {
        offset: VarInt,
        data: Bytes,
    },
    Stream {
        stream_id: StreamId,
        offset: VarInt,
        data: Bytes,
        is_fin: bool,
    },
    MaxData {
        maximum_data: VarInt,
    },
    MaxStreamData {
        stream_id: StreamId,
        maximum_stream_data: VarInt,
    },
    MaxStreams {
        stream_type: StreamIdKind,
        maximum_streams: VarInt,
    },
    DataBlocked {
        data_limit: VarInt,
    },
    StreamDataBlocked {
        stream_id: StreamId,
        stream_data_limit: VarInt,
    },
    StreamsBlocked {
        stream_type: StreamIdKind,
        stream_limit: VarInt,
    },
    NewConnectionId {
        sequence_number: VarInt,
        retire_prior_to: VarInt,
        connection_id: LocalId,
        stateless_reset_token: StatelessResetToken,
    },
    RetireConnectionId {
        sequence_number: VarInt,
    },
    PathResponse {
        data: [u8; 8],
    },
    ConnectionClose {
        error_code: VarInt,
        frame_type: Option<VarInt>,
        reason: Bytes,
        is_application_error: bool,
    },
    HandshakeDone,
}

impl OutboundFrame {
    //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2
    //# A packet is "ack-eliciting" if it contains any frame other than
    //# ACK, PADDING, or CONNECTION_CLOSE.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            OutboundFrame::Ack(_) | OutboundFrame::Padding { .. } | OutboundFrame::ConnectionClose { .. }
        )
    }

    /// Frames cheap to regenerate with fresher content on retransmission
    /// rather than resend verbatim (§4.4 "regen-size marker").
    pub fn is_regeneratable(&self) -> bool {
        matches!(self, OutboundFrame::Ack(_) | OutboundFrame::MaxData { .. })
    }
}

/// One outbound packet under assembly or already sent, tracked by sequence
/// number within its space. `regen_size` marks how many frames at the front
/// of `frames` are regeneratable (ACK, MAX_DATA): on loss, those are dropped
/// and rebuilt fresh rather than replayed, while the remainder is queued for
/// verbatim retransmission.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub space: PacketNumberSpace,
    pub number: VarInt,
    pub frames: Vec<OutboundFrame>,
    pub regen_size: usize,
    pub ack_eliciting: bool,
}

impl Packet {
    pub fn new(space: PacketNumberSpace, number: VarInt) -> Self {
        Self {
            space,
            number,
            frames: Vec::new(),
            regen_size: 0,
            ack_eliciting: false,
        }
    }

    pub fn push(&mut self, frame: OutboundFrame) {
        if frame.is_ack_eliciting() {
            self.ack_eliciting = true;
        }
        self.frames.push(frame);
    }

    /// Marks every frame queued so far as regeneratable-boundary: frames
    /// added after this point are the ones replayed verbatim on loss.
    pub fn mark_regen_boundary(&mut self) {
        self.regen_size = self.frames.len();
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// A rough byte estimate used for congestion-window accounting; the
    /// real encoded size is only known to the (out-of-scope) encoder.
    pub fn estimated_size(&self) -> usize {
        self.frames
            .iter()
            .map(|f| match f {
                OutboundFrame::Stream { data, .. } => data.len() + 16,
                OutboundFrame::Crypto { data, .. } => data.len() + 8,
                OutboundFrame::Ack(a) => 8 + a.ranges.len() * 4,
                OutboundFrame::Padding { length } => *length,
                _ => 16,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_is_ack_eliciting_but_ack_and_padding_are_not() {
        let mut p = Packet::new(PacketNumberSpace::ApplicationData, VarInt::from_u32(1));
        p.push(OutboundFrame::Padding { length: 4 });
        assert!(!p.ack_eliciting);
        p.push(OutboundFrame::Ping);
        assert!(p.ack_eliciting);
    }

    #[test]
    fn regen_boundary_separates_ack_from_retransmittable_frames() {
        let mut p = Packet::new(PacketNumberSpace::ApplicationData, VarInt::from_u32(1));
        p.push(OutboundFrame::Ack(AckPayload {
            largest_acknowledged: VarInt::ZERO,
            ack_delay: VarInt::ZERO,
            ranges: vec![],
            ecn_counts: None,
        }));
        p.mark_regen_boundary();
        p.push(OutboundFrame::Ping);
        assert_eq!(p.regen_size, 1);
        assert_eq!(p.frames.len(), 2);
    }
}
