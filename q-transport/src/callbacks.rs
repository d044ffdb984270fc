// SPDX-License-Identifier: Apache-2.0

//! What the embedder learns about a connection's lifecycle (spec §5). The
//! core never calls into application code directly; instead it exposes
//! [`Status`] and per-stream readiness flags, and the embedder polls them on
//! its own schedule after each `tick()`.

use crate::error::ConnectionError;

/// The connection's lifecycle summary, coarser than [`ConnectionState`](crate::connection::ConnectionState)
/// since it also folds in *why* a terminal state was reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    HandshakeInProgress,
    Connected,
    HandshakeFailure,
    TimedOut,
    Reset,
    UserAborted,
    Error,
    Closed,
    GoingAway,
    PeerGoingAway,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::HandshakeInProgress | Status::Connected)
    }

    /// Classifies an already-recorded close reason into the coarser status
    /// an embedder would want to branch on.
    pub fn from_close_reason(reason: &ConnectionError) -> Self {
        match reason {
            ConnectionError::HandshakeFailed => Status::HandshakeFailure,
            ConnectionError::IdleTimeout => Status::TimedOut,
            ConnectionError::PeerStatelessReset => Status::Reset,
            ConnectionError::Aborted => Status::UserAborted,
            ConnectionError::ApplicationClosed => Status::Closed,
            ConnectionError::PeerClosed { .. } => Status::PeerGoingAway,
            ConnectionError::Transport(_) => Status::Error,
        }
    }
}
