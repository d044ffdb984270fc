// SPDX-License-Identifier: Apache-2.0

//! The parsed, in-memory representation of each QUIC frame type (RFC 9000
//! §19). Turning wire bytes into these values, and these values back into
//! wire bytes, is the job of the version-specific codec, which is out of
//! scope here: the dispatcher and its handlers only ever see a `Frame`.

use crate::{
    connection::id::{PeerId, StatelessResetToken},
    stream::StreamId,
    varint::VarInt,
};

pub mod legality;

pub type Tag = u8;

pub const STATELESS_RESET_TOKEN_LEN: usize = 16;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19
//# Each frame begins with a frame type, which is a variable-length
//# integer. The frame type determines the format and semantics of the
//# frame.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Padding {
    pub length: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ping;

/// A single contiguous ACK range, expressed as inclusive packet numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckRange {
    pub smallest: VarInt,
    pub largest: VarInt,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EcnCounts {
    pub ect0: VarInt,
    pub ect1: VarInt,
    pub ce: VarInt,
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.3
//# ACK frames are used to inform senders of packets the peer has
//# received and processed, listed newest-first as alternating
//# ACK Range / Gap entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub largest_acknowledged: VarInt,
    pub ack_delay: VarInt,
    /// Newest-first, matching the wire order.
    pub ack_ranges: Vec<AckRange>,
    pub ecn_counts: Option<EcnCounts>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetStream {
    pub stream_id: StreamId,
    pub application_error_code: VarInt,
    pub final_size: VarInt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StopSending {
    pub stream_id: StreamId,
    pub application_error_code: VarInt,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Crypto<'a> {
    pub offset: VarInt,
    pub data: &'a [u8],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewToken<'a> {
    pub token: &'a [u8],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamFrame<'a> {
    pub stream_id: StreamId,
    pub offset: VarInt,
    pub data: &'a [u8],
    pub is_fin: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxData {
    pub maximum_data: VarInt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxStreamData {
    pub stream_id: StreamId,
    pub maximum_stream_data: VarInt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamIdKind {
    Bidirectional,
    Unidirectional,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxStreams {
    pub stream_type: StreamIdKind,
    pub maximum_streams: VarInt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataBlocked {
    pub data_limit: VarInt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamDataBlocked {
    pub stream_id: StreamId,
    pub stream_data_limit: VarInt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamsBlocked {
    pub stream_type: StreamIdKind,
    pub stream_limit: VarInt,
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
//# NEW_CONNECTION_ID frames provide a peer with alternative connection
//# IDs that can be used to break linkability when migrating connections.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewConnectionId {
    pub sequence_number: VarInt,
    pub retire_prior_to: VarInt,
    pub connection_id: PeerId,
    pub stateless_reset_token: StatelessResetToken,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetireConnectionId {
    pub sequence_number: VarInt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathChallenge {
    pub data: [u8; 8],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathResponse {
    pub data: [u8; 8],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionClose<'a> {
    pub error_code: VarInt,
    /// `Some` only for the QUIC-layer (0x1c) variant.
    pub frame_type: Option<VarInt>,
    pub reason: &'a [u8],
    pub is_application_error: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeDone;

/// The union of all frame types a connection can receive, already parsed by
/// the (out-of-scope) wire decoder at the packet's encryption level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    Padding(Padding),
    Ping(Ping),
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto<'a>),
    NewToken(NewToken<'a>),
    Stream(StreamFrame<'a>),
    MaxData(MaxData),
    MaxStreamData(MaxStreamData),
    MaxStreams(MaxStreams),
    DataBlocked(DataBlocked),
    StreamDataBlocked(StreamDataBlocked),
    StreamsBlocked(StreamsBlocked),
    NewConnectionId(NewConnectionId),
    RetireConnectionId(RetireConnectionId),
    PathChallenge(PathChallenge),
    PathResponse(PathResponse),
    ConnectionClose(ConnectionClose<'a>),
    HandshakeDone(HandshakeDone),
}

impl Frame<'_> {
    //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2
    //# A packet is "ack-eliciting" if it contains any frame other than
    //# ACK, PADDING, or CONNECTION_CLOSE.
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Ack(_) | Frame::Padding(_) | Frame::ConnectionClose(_)
        )
    }

    pub fn is_connection_close(&self) -> bool {
        matches!(self, Frame::ConnectionClose(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_and_padding_are_not_ack_eliciting() {
        assert!(!Frame::Padding(Padding { length: 1 }).is_ack_eliciting());
        assert!(!Frame::Ack(Ack {
            largest_acknowledged: VarInt::ZERO,
            ack_delay: VarInt::ZERO,
            ack_ranges: vec![],
            ecn_counts: None,
        })
        .is_ack_eliciting());
    }

    #[test]
    fn ping_is_ack_eliciting() {
        assert!(Frame::Ping(Ping).is_ack_eliciting());
    }
}
