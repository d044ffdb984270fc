// SPDX-License-Identifier: Apache-2.0

//! QUIC transport error codes (RFC 9000 §20.1), carried by CONNECTION_CLOSE
//! frames of the QUIC-layer variant.

use crate::varint::VarInt;
use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportError {
    pub code: VarInt,
    pub frame_type: Option<VarInt>,
    pub reason: &'static str,
}

impl TransportError {
    pub const fn new(code: VarInt, reason: &'static str, frame_type: Option<VarInt>) -> Self {
        Self {
            code,
            reason,
            frame_type,
        }
    }

    pub const fn with_frame_type(mut self, frame_type: VarInt) -> Self {
        self.frame_type = Some(frame_type);
        self
    }

    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "TransportError({})", self.code)
        } else {
            f.write_str(self.reason)
        }
    }
}

macro_rules! def_error {
    ($doc:expr, $name:ident, $code:expr) => {
        impl TransportError {
            #[doc = $doc]
            pub const $name: TransportError =
                TransportError::new(VarInt::from_u32($code), "", None);
        }
    };
}

def_error!(
    "The connection is being closed abruptly in the absence of any error.",
    NO_ERROR,
    0x0
);
def_error!(
    "The endpoint encountered an internal error and cannot continue.",
    INTERNAL_ERROR,
    0x1
);
def_error!(
    "The server is currently busy and does not accept new connections.",
    SERVER_BUSY,
    0x2
);
def_error!(
    "An endpoint received more data than its advertised flow-control limits permitted.",
    FLOW_CONTROL_ERROR,
    0x3
);
def_error!(
    "An endpoint received a frame for a stream ID exceeding its advertised stream limit.",
    STREAM_LIMIT_ERROR,
    0x4
);
def_error!(
    "An endpoint received a frame for a stream that was not in a state permitting that frame.",
    STREAM_STATE_ERROR,
    0x5
);
def_error!(
    "Stream data was received beyond, or contradicting, the established final size.",
    FINAL_SIZE_ERROR,
    0x6
);
def_error!(
    "An endpoint received a frame that was badly formatted.",
    FRAME_ENCODING_ERROR,
    0x7
);
def_error!(
    "An endpoint received transport parameters that were badly formatted or invalid.",
    TRANSPORT_PARAMETER_ERROR,
    0x8
);
def_error!(
    "The number of connection IDs provided exceeds the limit advertised in the transport parameters.",
    CONNECTION_ID_LIMIT_ERROR,
    0x9
);
def_error!(
    "An endpoint detected an error with protocol compliance not covered by a more specific code.",
    PROTOCOL_VIOLATION,
    0xA
);
def_error!(
    "A server received a client Initial that contained an invalid Token field.",
    INVALID_TOKEN,
    0xB
);
def_error!(
    "The application or application protocol caused the connection to be closed.",
    APPLICATION_ERROR,
    0xC
);
def_error!(
    "An endpoint has received more data in CRYPTO frames than it can buffer.",
    CRYPTO_BUFFER_EXCEEDED,
    0xD
);
def_error!(
    "An endpoint detected errors in performing key updates.",
    KEY_UPDATE_ERROR,
    0xE
);
def_error!(
    "An endpoint has reached the confidentiality or integrity limit for the AEAD in use.",
    AEAD_LIMIT_REACHED,
    0xF
);
def_error!(
    "An endpoint has determined that the network path is incapable of supporting QUIC.",
    NO_VIABLE_PATH,
    0x10
);

impl TransportError {
    /// A `TransportError` derived from a TLS alert code (RFC 9001 §4.8).
    #[inline]
    pub fn crypto_error(code: u8, reason: &'static str) -> Self {
        Self {
            code: VarInt::from_u32(0x100 | u32::from(code)),
            reason,
            frame_type: None,
        }
    }

    #[inline]
    pub const fn application_error(code: VarInt, reason: &'static str) -> Self {
        Self {
            code,
            reason,
            frame_type: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefers_reason() {
        let e = TransportError::FLOW_CONTROL_ERROR.with_reason("stream offset past max_data");
        assert_eq!(e.to_string(), "stream offset past max_data");
    }

    #[test]
    fn crypto_error_is_offset_by_0x100() {
        let e = TransportError::crypto_error(40, "handshake_failure");
        assert_eq!(e.code.as_u64(), 0x128);
    }
}
