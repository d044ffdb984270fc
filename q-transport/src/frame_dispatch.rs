// SPDX-License-Identifier: Apache-2.0

//! Frame-type-indexed dispatch (RFC 9000 §19, spec-wise §4.5). The wire
//! decoder has already turned packet bytes into `Frame` values and checked
//! the packet's encryption level; this module only owns what each frame
//! *means* to connection state. Every handler here is conceptually
//! infallible at its call site: an `Err` returned from [`dispatch`] is
//! caught by [`Connection::on_frame`](crate::connection::Connection::on_frame),
//! which sets the terminal flag and logs at the severity the error calls for.

use crate::{
    connection::Connection,
    error::ConnectionError,
    send::{AckedRange, SendController},
    space::SavedAck,
    stream::table::StreamOpenError,
};
use q_quic_core::{
    crypto::EncryptionLevel,
    frame::{AckRange, Frame, StreamIdKind},
    packet::number::PacketNumberSpace,
    stream::StreamType,
    time::Timestamp,
    transport_error::TransportError,
    varint::VarInt,
};

pub(crate) fn dispatch<C: SendController>(
    conn: &mut Connection<C>,
    frame: &Frame<'_>,
    level: EncryptionLevel,
    now: Timestamp,
) -> Result<(), ConnectionError> {
    match frame {
        Frame::Padding(_) => Ok(()),
        Frame::Ping(_) => Ok(()),
        Frame::Ack(ack) => on_ack(conn, level, ack, now),
        Frame::ResetStream(rs) => {
            let local = conn.local();
            let stream = if rs.stream_id.is_locally_initiated(local) {
                conn.streams.get_mut(rs.stream_id)
            } else {
                conn.streams.open_or_get_peer(rs.stream_id).ok()
            };
            if let Some(stream) = stream {
                stream.on_reset_received()?;
            }
            Ok(())
        }
        Frame::StopSending(ss) => {
            if let Some(stream) = conn.streams.get_mut(ss.stream_id) {
                stream.reset()?;
            }
            Ok(())
        }
        Frame::Crypto(c) => {
            let space = level.packet_number_space();
            conn.crypto_stream_mut(space)
                .on_data(c.offset.as_u64(), c.data)
                .map_err(|_| {
                    ConnectionError::from(
                        TransportError::CRYPTO_BUFFER_EXCEEDED
                            .with_reason("crypto stream reassembly buffer exceeded"),
                    )
                })?;
            Ok(())
        }
        Frame::NewToken(_) => Ok(()),
        Frame::Stream(sf) => {
            let local = conn.local();
            let end = sf.offset.as_u64() + sf.data.len() as u64;
            let prev_high = *conn.stream_recv_high_water.get(&sf.stream_id).unwrap_or(&0);
            if end > prev_high {
                let delta = end - prev_high;
                let new_total = conn.connection_recv_window.window.consumed().as_u64() + delta;
                conn.connection_recv_window
                    .on_bytes_received(VarInt::new(new_total).unwrap_or(VarInt::MAX))
                    .map_err(|_| {
                        ConnectionError::from(
                            TransportError::FLOW_CONTROL_ERROR
                                .with_reason("connection-level max_data exceeded"),
                        )
                    })?;
                conn.stream_recv_high_water.insert(sf.stream_id, end);
            }
            let stream = if sf.stream_id.is_locally_initiated(local) {
                conn.streams.get_mut(sf.stream_id)
            } else {
                match conn.streams.open_or_get_peer(sf.stream_id) {
                    Ok(stream) => Some(stream),
                    // A duplicate/retransmitted frame for a stream that's
                    // already finished and been reaped; nothing to apply.
                    Err(StreamOpenError::AlreadyClosed) => None,
                    Err(_) => {
                        return Err(ConnectionError::from(
                            TransportError::STREAM_LIMIT_ERROR
                                .with_reason("peer stream id exceeds advertised limit"),
                        ))
                    }
                }
            };
            if let Some(stream) = stream {
                stream.on_stream_data(sf.offset.as_u64(), sf.data, sf.is_fin)?;
            }
            Ok(())
        }
        Frame::MaxData(md) => {
            conn.connection_send_window.set_max(md.maximum_data);
            Ok(())
        }
        Frame::MaxStreamData(msd) => {
            if let Some(stream) = conn.streams.get_mut(msd.stream_id) {
                stream.on_max_stream_data_received(msd.maximum_stream_data);
            }
            Ok(())
        }
        Frame::MaxStreams(ms) => {
            let stream_type = match ms.stream_type {
                StreamIdKind::Bidirectional => StreamType::Bidirectional,
                StreamIdKind::Unidirectional => StreamType::Unidirectional,
            };
            conn.streams.set_local_limit(stream_type, ms.maximum_streams.as_u64());
            Ok(())
        }
        Frame::DataBlocked(_) | Frame::StreamDataBlocked(_) | Frame::StreamsBlocked(_) => {
            tracing::debug!("peer reported send-side blocked");
            Ok(())
        }
        Frame::NewConnectionId(ncid) => {
            conn.peer_cids
                .on_new_connection_id(
                    ncid.sequence_number,
                    ncid.retire_prior_to,
                    ncid.connection_id,
                    ncid.stateless_reset_token,
                )
                .map_err(ConnectionError::from)?;
            Ok(())
        }
        Frame::RetireConnectionId(rcid) => {
            let destination_cid = conn.current_local_cid();
            conn.local_cids
                .retire(rcid.sequence_number, &destination_cid)
                .map_err(ConnectionError::from)?;
            conn.flags.send_new_connection_id = true;
            Ok(())
        }
        Frame::PathChallenge(pc) => {
            conn.pending_path_response = Some(pc.data);
            Ok(())
        }
        Frame::PathResponse(_) => Ok(()),
        Frame::ConnectionClose(cc) => {
            conn.on_peer_close(cc.error_code, cc.is_application_error);
            Ok(())
        }
        Frame::HandshakeDone(_) => {
            if conn.state().is_handshaking() {
                conn.on_handshake_confirmed()?;
            }
            Ok(())
        }
    }
}

fn on_ack<C: SendController>(
    conn: &mut Connection<C>,
    level: EncryptionLevel,
    ack: &q_quic_core::frame::Ack,
    now: Timestamp,
) -> Result<(), ConnectionError> {
    let space = level.packet_number_space();

    if let Some(last) = conn.send_controller.last_scheduled(space) {
        if ack.largest_acknowledged > last {
            return Err(TransportError::PROTOCOL_VIOLATION
                .with_reason("ACK references a packet number never sent")
                .into());
        }
    }

    if conn
        .spaces
        .get_mut(space)
        .record_ack_processed(ack.largest_acknowledged)
        .is_err()
    {
        // stale or duplicate ACK info; nothing new to apply.
        return Ok(());
    }

    process_saved_ack(conn, space);

    //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.3
    //# a sender MAY defer processing an ACK frame with a single range when
    //# another is likely to arrive shortly, so long as loss detection is not
    //# delayed by more than the local max_ack_delay.
    if level.is_application() && ack.ack_ranges.len() == 1 {
        conn.spaces.get_mut(space).saved_ack = Some(SavedAck {
            range: ack.ack_ranges[0],
            ack_delay: ack.ack_delay,
            received_time: now,
        });
    } else {
        for range in &ack.ack_ranges {
            apply_ack_range(conn, space, *range, now);
        }
    }
    Ok(())
}

/// Applies any deferred single-range ACK left over from a previous tick,
/// independent of whether another ACK frame ever arrives to trigger it
/// (spec §4.6 step 1 "Process deferred saved-ACK, if any"). Without this, a
/// saved ACK with no follow-up ACK would sit forever and the stream(s) it
/// covers would never observe their bytes as acked.
pub(crate) fn process_saved_ack<C: SendController>(conn: &mut Connection<C>, space: PacketNumberSpace) {
    if let Some(saved) = conn.spaces.get_mut(space).saved_ack.take() {
        apply_ack_range(conn, space, saved.range, saved.received_time);
    }
}

fn apply_ack_range<C: SendController>(
    conn: &mut Connection<C>,
    space: PacketNumberSpace,
    range: AckRange,
    received_time: Timestamp,
) {
    conn.send_controller.on_ack(
        AckedRange {
            smallest: range.smallest,
            largest: range.largest,
        },
        received_time,
        space,
    );
    conn.spaces.get_mut(space).record_acked_by_peer(range.largest);

    let keys: Vec<(PacketNumberSpace, u64)> = conn
        .sent_stream_frames
        .keys()
        .filter(|(s, pn)| *s == space && *pn >= range.smallest.as_u64() && *pn <= range.largest.as_u64())
        .copied()
        .collect();
    for key in keys {
        if let Some(frames) = conn.sent_stream_frames.remove(&key) {
            for (stream_id, len, fin) in frames {
                if let Some(stream) = conn.streams.get_mut(stream_id) {
                    let _ = stream.on_bytes_acked(len, fin);
                }
            }
        }
    }
}
