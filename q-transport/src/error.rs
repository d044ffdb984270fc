// SPDX-License-Identifier: Apache-2.0

//! The connection-level error type: every fallible operation in this crate
//! ultimately produces either a [`TransportError`] to be sent to the peer in
//! a CONNECTION_CLOSE frame, or an internal reason the connection is being
//! torn down without one.

use crate::stream::StreamError;
use q_quic_core::transport_error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    /// The peer violated the protocol; carries the error to report back.
    #[error("transport error: {0}")]
    Transport(TransportError),
    /// The peer closed the connection, with the code and type it sent.
    #[error("peer closed the connection with code {error_code}")]
    PeerClosed {
        error_code: q_quic_core::varint::VarInt,
        is_application_error: bool,
    },
    /// The idle timer fired with no prior traffic.
    #[error("idle timeout")]
    IdleTimeout,
    /// The application closed the connection locally.
    #[error("closed by the application")]
    ApplicationClosed,
    /// The handshake could not complete (crypto session rejected it, or the
    /// handshake timer fired); the crypto session itself is out of scope
    /// here, so this only records that it happened.
    #[error("handshake failed")]
    HandshakeFailed,
    /// The embedder tore the connection down without a specific protocol
    /// reason, e.g. a forced shutdown.
    #[error("aborted")]
    Aborted,
    /// A valid stateless reset token arrived from the peer's address.
    #[error("peer sent a stateless reset")]
    PeerStatelessReset,
}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<StreamError> for ConnectionError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::FlowControl => Self::Transport(
                TransportError::FLOW_CONTROL_ERROR.with_reason("stream flow control violated"),
            ),
            StreamError::InvalidTransition => Self::Transport(
                TransportError::PROTOCOL_VIOLATION.with_reason("illegal stream state transition"),
            ),
        }
    }
}

impl From<crate::connection_id::ConnectionIdError> for ConnectionError {
    fn from(e: crate::connection_id::ConnectionIdError) -> Self {
        use crate::connection_id::ConnectionIdError::*;
        match e {
            LimitExceeded => Self::Transport(
                TransportError::CONNECTION_ID_LIMIT_ERROR.with_reason("connection ID limit exceeded"),
            ),
            InvalidRetirement => Self::Transport(
                TransportError::PROTOCOL_VIOLATION.with_reason("invalid connection ID retirement"),
            ),
            UnknownSequenceNumber => Self::Transport(
                TransportError::PROTOCOL_VIOLATION.with_reason("unknown connection ID sequence number"),
            ),
            Inconsistent => Self::Transport(
                TransportError::PROTOCOL_VIOLATION
                    .with_reason("NEW_CONNECTION_ID referenced an inconsistent sequence/id pair"),
            ),
        }
    }
}
