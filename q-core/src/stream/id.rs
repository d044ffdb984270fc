// SPDX-License-Identifier: Apache-2.0

//! Types and utilities around the QUIC Stream identifier (RFC 9000 §2.1).

use crate::{endpoint, stream::StreamType, varint::VarInt};

/// A stream ID is a 62-bit integer, unique for all streams on a connection.
/// Its two least significant bits encode the Stream ID Type (SIT): which
/// side initiated the stream and whether it is bidirectional.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
pub struct StreamId(VarInt);

impl From<StreamId> for VarInt {
    fn from(id: StreamId) -> Self {
        id.0
    }
}

impl From<StreamId> for u64 {
    fn from(id: StreamId) -> Self {
        id.0.as_u64()
    }
}

impl StreamId {
    #[inline]
    pub const fn from_varint(id: VarInt) -> StreamId {
        StreamId(id)
    }

    #[inline]
    pub const fn as_varint(self) -> VarInt {
        self.0
    }

    /// The first Stream ID of a given (initiator, type) class.
    ///
    /// E.g. the initial Stream ID for a server-initiated unidirectional
    /// stream is Stream ID `3`.
    #[inline]
    pub fn initial(initiator: endpoint::Type, stream_type: StreamType) -> StreamId {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
        //# 0x00 Client-Initiated, Bidirectional
        //# 0x01 Server-Initiated, Bidirectional
        //# 0x02 Client-Initiated, Unidirectional
        //# 0x03 Server-Initiated, Unidirectional
        match (
            stream_type == StreamType::Bidirectional,
            initiator == endpoint::Type::Client,
        ) {
            (true, true) => StreamId(VarInt::from_u32(0)),
            (true, false) => StreamId(VarInt::from_u32(1)),
            (false, true) => StreamId(VarInt::from_u32(2)),
            (false, false) => StreamId(VarInt::from_u32(3)),
        }
    }

    /// The n-th Stream ID of a given class; successive IDs of a class are
    /// spaced 4 apart. Returns `None` if the result would overflow a varint.
    #[inline]
    pub fn nth(initiator: endpoint::Type, stream_type: StreamType, n: u64) -> Option<StreamId> {
        let initial = Self::initial(initiator, stream_type);
        let id = VarInt::new(n.checked_mul(4)?.checked_add(initial.into())?).ok()?;
        Some(StreamId(id))
    }

    /// The next Stream ID of the same class as `self`.
    #[inline]
    pub fn next_of_type(self) -> Option<StreamId> {
        self.0
            .checked_add(VarInt::from_u32(4))
            .map(StreamId::from_varint)
    }

    #[inline]
    pub fn initiator(self) -> endpoint::Type {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
        //# The least significant bit (0x1) of the stream ID identifies the
        //# initiator: client-initiated streams have the bit set to 0.
        if Into::<u64>::into(self.0) & 0x01u64 == 0 {
            endpoint::Type::Client
        } else {
            endpoint::Type::Server
        }
    }

    #[inline]
    pub fn stream_type(self) -> StreamType {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
        //# The second least significant bit (0x2) distinguishes bidirectional
        //# streams (0) from unidirectional streams (1).
        if Into::<u64>::into(self.0) & 0x02 == 0 {
            StreamType::Bidirectional
        } else {
            StreamType::Unidirectional
        }
    }

    /// `true` if `self` was opened by `local` rather than its peer.
    #[inline]
    pub fn is_locally_initiated(self, local: endpoint::Type) -> bool {
        self.initiator() == local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::varint::MAX_VARINT_VALUE;

    #[test]
    fn initial_stream_ids() {
        for stream_type in &[StreamType::Bidirectional, StreamType::Unidirectional] {
            for initiator in &[endpoint::Type::Client, endpoint::Type::Server] {
                let id = StreamId::initial(*initiator, *stream_type);
                assert_eq!(*stream_type, id.stream_type());
                assert_eq!(*initiator, id.initiator());
            }
        }
    }

    #[test]
    fn stream_id_overflow() {
        let max_stream_id_varint = VarInt::new((1 << 62) - 1).unwrap();
        let max_increaseable = VarInt::new(max_stream_id_varint.as_u64() - 4).unwrap();
        let stream_id = StreamId::from_varint(max_increaseable);
        assert!(stream_id.next_of_type().is_some());

        for increment in 1..5u64 {
            let id_varint = VarInt::new(max_increaseable.as_u64() + increment).unwrap();
            let stream_id = StreamId::from_varint(id_varint);
            assert!(stream_id.next_of_type().is_none());
        }
    }

    #[test]
    fn nth_stream_id() {
        for stream_type in &[StreamType::Bidirectional, StreamType::Unidirectional] {
            for initiator in &[endpoint::Type::Client, endpoint::Type::Server] {
                let first = StreamId::nth(*initiator, *stream_type, 0).unwrap();
                assert_eq!(StreamId::initial(*initiator, *stream_type), first);

                for n in 1..10 {
                    let nth = StreamId::nth(*initiator, *stream_type, n).unwrap();
                    assert_eq!(n * 4, nth.as_varint().as_u64() - first.as_varint().as_u64());
                }
            }
        }
    }

    #[test]
    fn invalid_nth_stream_id() {
        for stream_type in &[StreamType::Bidirectional, StreamType::Unidirectional] {
            for initiator in &[endpoint::Type::Client, endpoint::Type::Server] {
                assert_eq!(
                    None,
                    StreamId::nth(*initiator, *stream_type, MAX_VARINT_VALUE / 2)
                );
            }
        }
    }
}
