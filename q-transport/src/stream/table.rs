// SPDX-License-Identifier: Apache-2.0

//! Owns every stream on a connection, keyed by `StreamId`, and enforces the
//! peer-facing concurrency limits (RFC 9000 §4.6 MAX_STREAMS) plus the
//! locally-initiated next-ID counters per (initiator, type) class.

use super::Stream;
use hashbrown::HashMap;
use q_quic_core::{
    endpoint,
    stream::{StreamId, StreamType},
    varint::VarInt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOpenError {
    /// Opening this stream would exceed the advertised MAX_STREAMS limit.
    LimitExceeded,
    StreamIdOverflow,
    /// The referenced peer-initiated stream ID is below the watermark but
    /// has already been reaped (both sides reached a terminal state). An
    /// ordinary outcome of a duplicate, reordered, or retransmitted
    /// datagram arriving for a stream that already finished; the frame
    /// referencing it should be ignored, not treated as a protocol error.
    AlreadyClosed,
}

/// Tracks both halves of the peer-advertised stream limit: the count we've
/// already opened and the current ceiling, indexed by stream type.
#[derive(Debug, Clone, Copy, Default)]
struct StreamLimit {
    opened: u64,
    max: u64,
}

impl StreamLimit {
    fn has_room(&self) -> bool {
        self.opened < self.max
    }

    fn set_max(&mut self, new_max: u64) {
        if new_max > self.max {
            self.max = new_max;
        }
    }
}

#[derive(Debug)]
pub struct StreamTable {
    local: endpoint::Type,
    streams: HashMap<StreamId, Stream>,
    /// Next local stream ID to hand out, per stream type.
    next_local: [StreamId; 2],
    /// Highest peer-initiated stream ID observed so far, per stream type;
    /// used to detect and auto-open skipped-over streams on arrival
    /// (RFC 9000 §2.1).
    peer_high_watermark: [Option<StreamId>; 2],
    local_limits: [StreamLimit; 2],
    peer_limits: [StreamLimit; 2],
    default_send_window: VarInt,
    default_recv_window: VarInt,
}

fn type_index(t: StreamType) -> usize {
    match t {
        StreamType::Bidirectional => 0,
        StreamType::Unidirectional => 1,
    }
}

impl StreamTable {
    pub fn new(local: endpoint::Type, default_send_window: VarInt, default_recv_window: VarInt) -> Self {
        Self {
            local,
            streams: HashMap::new(),
            next_local: [
                StreamId::initial(local, StreamType::Bidirectional),
                StreamId::initial(local, StreamType::Unidirectional),
            ],
            peer_high_watermark: [None, None],
            local_limits: [StreamLimit::default(); 2],
            peer_limits: [StreamLimit::default(); 2],
            default_send_window,
            default_recv_window,
        }
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&StreamId, &mut Stream)> {
        self.streams.iter_mut()
    }

    /// Sets the peer-advertised ceiling on how many locally-initiated
    /// streams of `stream_type` may be open at once.
    pub fn set_local_limit(&mut self, stream_type: StreamType, max_streams: u64) {
        self.local_limits[type_index(stream_type)].set_max(max_streams);
    }

    /// Sets our own advertised ceiling on peer-initiated streams.
    pub fn set_peer_limit(&mut self, stream_type: StreamType, max_streams: u64) {
        self.peer_limits[type_index(stream_type)].set_max(max_streams);
    }

    /// Opens the next locally-initiated stream of `stream_type`, subject to
    /// the peer's MAX_STREAMS limit.
    pub fn open_local(&mut self, stream_type: StreamType) -> Result<StreamId, StreamOpenError> {
        let idx = type_index(stream_type);
        if !self.local_limits[idx].has_room() {
            return Err(StreamOpenError::LimitExceeded);
        }
        let id = self.next_local[idx];
        self.next_local[idx] = id
            .next_of_type()
            .ok_or(StreamOpenError::StreamIdOverflow)?;
        self.local_limits[idx].opened += 1;
        self.streams.insert(
            id,
            Stream::new(id, self.local, self.default_send_window, self.default_recv_window),
        );
        Ok(id)
    }

    /// Looks up a peer-initiated stream, implicitly opening it (and any
    /// lower-numbered streams of the same class that haven't been seen yet)
    /// on first reference.
    pub fn open_or_get_peer(&mut self, id: StreamId) -> Result<&mut Stream, StreamOpenError> {
        let idx = type_index(id.stream_type());
        let watermark = self.peer_high_watermark[idx];
        if watermark.map(|w| id.as_varint() > w.as_varint()).unwrap_or(true) {
            let count_from = watermark
                .and_then(|w| w.next_of_type())
                .unwrap_or_else(|| StreamId::initial(id.initiator(), id.stream_type()));
            let mut cursor = count_from;
            loop {
                if !self.streams.contains_key(&cursor) {
                    if !self.peer_limits[idx].has_room() {
                        return Err(StreamOpenError::LimitExceeded);
                    }
                    self.peer_limits[idx].opened += 1;
                    self.streams.insert(
                        cursor,
                        Stream::new(cursor, self.local, self.default_send_window, self.default_recv_window),
                    );
                }
                if cursor == id {
                    break;
                }
                cursor = cursor.next_of_type().ok_or(StreamOpenError::StreamIdOverflow)?;
            }
            self.peer_high_watermark[idx] = Some(id);
        }
        // If `id` is at-or-below the watermark but absent here, it was
        // already opened, fully closed, and reaped by `reap_closed` — not a
        // bug, just a late frame for a stream that's already gone.
        self.streams.get_mut(&id).ok_or(StreamOpenError::AlreadyClosed)
    }

    /// Removes every stream whose `flags.free` bit is set, running
    /// `on_close` for each one first.
    pub fn reap_closed(&mut self, mut on_close: impl FnMut(StreamId)) {
        let freed: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.flags.free)
            .map(|(id, _)| *id)
            .collect();
        for id in freed {
            self.streams.remove(&id);
            on_close(id);
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> StreamTable {
        let mut t = StreamTable::new(
            endpoint::Type::Client,
            VarInt::from_u32(1000),
            VarInt::from_u32(1000),
        );
        t.set_local_limit(StreamType::Bidirectional, 10);
        t.set_peer_limit(StreamType::Bidirectional, 10);
        t
    }

    #[test]
    fn open_local_hands_out_successive_ids() {
        let mut t = table();
        let a = t.open_local(StreamType::Bidirectional).unwrap();
        let b = t.open_local(StreamType::Bidirectional).unwrap();
        assert_eq!(b, a.next_of_type().unwrap());
    }

    #[test]
    fn local_limit_is_enforced() {
        let mut t = table();
        t.set_local_limit(StreamType::Bidirectional, 1);
        t.open_local(StreamType::Bidirectional).unwrap();
        assert_eq!(
            t.open_local(StreamType::Bidirectional).unwrap_err(),
            StreamOpenError::LimitExceeded
        );
    }

    #[test]
    fn referencing_a_higher_peer_stream_implicitly_opens_lower_ones() {
        let mut t = table();
        let third = StreamId::nth(endpoint::Type::Server, StreamType::Bidirectional, 2).unwrap();
        t.open_or_get_peer(third).unwrap();
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn a_frame_for_an_already_reaped_peer_stream_is_reported_not_panicked() {
        let mut t = table();
        let first = StreamId::nth(endpoint::Type::Server, StreamType::Bidirectional, 0).unwrap();
        {
            let stream = t.open_or_get_peer(first).unwrap();
            stream.flags.free = true;
        }
        t.reap_closed(|_| {});
        assert!(t.get(first).is_none());

        // A duplicate/retransmitted datagram referencing the same,
        // already-reaped stream must not panic.
        assert_eq!(t.open_or_get_peer(first).unwrap_err(), StreamOpenError::AlreadyClosed);
    }
}
