// SPDX-License-Identifier: Apache-2.0

//! The per-encryption-level frame legality table (RFC 9000 §12.4,
//! §17.2-17.3). Receiving a frame outside its permitted level is a protocol
//! violation and aborts the connection.

use crate::{crypto::EncryptionLevel, frame::Frame};

/// `true` if `frame` is legal to receive at `level`.
pub fn is_legal(level: EncryptionLevel, frame: &Frame<'_>) -> bool {
    use Frame::*;

    let crypto_common = matches!(
        frame,
        Crypto(_) | Padding(_) | Ping(_) | Ack(_) | ConnectionClose(_)
    );

    match level {
        EncryptionLevel::Initial | EncryptionLevel::Handshake => crypto_common,
        EncryptionLevel::ZeroRtt => {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.20
            //# The HANDSHAKE_DONE frame ... MUST only be sent by a server and
            //# MUST treated as a connection error if ... received by a server
            //# or ... a client at any encryption level other than 1-RTT.
            !matches!(frame, Crypto(_))
                && !matches!(frame, ConnectionClose(c) if c.is_application_error)
                && !matches!(frame, HandshakeDone(_))
        }
        EncryptionLevel::OneRtt => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frame::*, varint::VarInt};

    #[test]
    fn stream_frame_illegal_at_initial() {
        let f = Frame::Stream(StreamFrame {
            stream_id: crate::stream::StreamId::from_varint(VarInt::ZERO),
            offset: VarInt::ZERO,
            data: &[],
            is_fin: false,
        });
        assert!(!is_legal(EncryptionLevel::Initial, &f));
        assert!(is_legal(EncryptionLevel::OneRtt, &f));
    }

    #[test]
    fn crypto_legal_everywhere_but_zero_rtt() {
        let f = Frame::Crypto(Crypto {
            offset: VarInt::ZERO,
            data: &[],
        });
        assert!(is_legal(EncryptionLevel::Initial, &f));
        assert!(is_legal(EncryptionLevel::Handshake, &f));
        assert!(is_legal(EncryptionLevel::OneRtt, &f));
        assert!(!is_legal(EncryptionLevel::ZeroRtt, &f));
    }

    #[test]
    fn ping_legal_everywhere() {
        assert!(is_legal(EncryptionLevel::Initial, &Frame::Ping(Ping)));
        assert!(is_legal(EncryptionLevel::ZeroRtt, &Frame::Ping(Ping)));
    }

    #[test]
    fn handshake_done_illegal_before_one_rtt() {
        let f = Frame::HandshakeDone(HandshakeDone);
        assert!(!is_legal(EncryptionLevel::Initial, &f));
        assert!(!is_legal(EncryptionLevel::Handshake, &f));
        assert!(!is_legal(EncryptionLevel::ZeroRtt, &f));
        assert!(is_legal(EncryptionLevel::OneRtt, &f));
    }
}
