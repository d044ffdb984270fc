// SPDX-License-Identifier: Apache-2.0

//! Connection-level service flags, the same bookkeeping idea as
//! [`crate::stream::StreamFlags`] but for work that applies to the
//! connection as a whole rather than to any single stream.

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionFlags {
    /// A HANDSHAKE_DONE frame is queued (server-only, sent once).
    pub send_handshake_done: bool,
    /// A NEW_CONNECTION_ID frame should be issued because the local pool
    /// has room below the peer's active_connection_id_limit.
    pub send_new_connection_id: bool,
    /// A connection-level MAX_DATA update is queued.
    pub send_max_data: bool,
    /// A connection-level DATA_BLOCKED should be sent.
    pub send_data_blocked: bool,
    /// A keepalive PING is due.
    pub send_ping: bool,
    /// A CONNECTION_CLOSE is queued and every other send work should be
    /// abandoned once it goes out.
    pub send_connection_close: bool,
    /// The idle timer fired; the connection should move straight to Closed
    /// without sending anything.
    pub silently_closed: bool,
}

impl ConnectionFlags {
    pub fn any_send_work(&self) -> bool {
        self.send_handshake_done
            || self.send_new_connection_id
            || self.send_max_data
            || self.send_data_blocked
            || self.send_ping
            || self.send_connection_close
    }
}
