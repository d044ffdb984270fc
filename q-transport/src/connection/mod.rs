// SPDX-License-Identifier: Apache-2.0

//! The per-connection state machine: the top-level [`Connection`] struct and
//! its `tick()` driving loop (RFC 9000 §10).

pub mod flags;

use crate::{
    alarm::{AlarmId, AlarmSet},
    callbacks::Status,
    config::Config,
    connection_id::{LocalIdPool, PeerIdPool},
    crypto_stream::CryptoStream,
    error::ConnectionError,
    flow_control::{ReceiveWindow, Window},
    frame_dispatch,
    packet::{AckPayload, OutboundFrame, Packet},
    send::SendController,
    space::PacketSpaceManager,
    stream::table::StreamTable,
};
use bytes::Bytes;
use core::time::Duration;
use flags::ConnectionFlags;
use hashbrown::HashMap;
use q_quic_core::{
    connection::id::{LocalId, PeerId, StatelessResetToken},
    endpoint,
    frame::Frame,
    packet::number::PacketNumberSpace,
    stream::StreamId,
    time::Timestamp,
    transport_error::TransportError,
    varint::VarInt,
};

use q_quic_core::state::{event, is};

/// How long a Closing/Draining connection lingers, retransmitting its final
/// CONNECTION_CLOSE at most once more, before the embedder may forget it.
const CLOSING_LINGER: Duration = Duration::from_millis(300);
/// Keepalive PING cadence once at least one application stream exists.
const PING_INTERVAL: Duration = Duration::from_secs(15);

fn add_saturating(now: Timestamp, d: Duration) -> Timestamp {
    now.checked_add(d)
        .unwrap_or_else(|| Timestamp::from_duration(Duration::MAX))
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-10
//# An endpoint that receives a CONNECTION_CLOSE frame MAY enter the
//# draining state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Handshaking,
    Active,
    Closing,
    Draining,
    Closed,
}

impl ConnectionState {
    is!(is_handshaking, Handshaking);
    is!(is_active, Active);
    is!(is_closing, Closing);
    is!(is_draining, Draining);
    is!(is_closed, Closed);
    is!(can_send_application_data, Active);

    event! {
        on_handshake_confirmed(Handshaking => Active);
        on_local_close(Handshaking | Active => Closing);
        on_peer_close(Handshaking | Active | Closing => Draining);
        on_closing_timer_expired(Closing | Draining => Closed);
    }
}

/// What a `tick()` call produced (spec §4.6, §6 "Exit conditions").
#[derive(Debug)]
pub enum TickResult {
    /// At least one packet is ready to hand to the encoder.
    Send(Vec<Packet>),
    /// Nothing to do until the next alarm fires; check `next_tick_time()`.
    Quiet,
    /// The connection is terminal; the embedder should remove it after
    /// sending the final packet, if any.
    Close(Option<Packet>),
}

pub struct Connection<C: SendController> {
    local: endpoint::Type,
    state: ConnectionState,
    config: Config,
    pub streams: StreamTable,
    pub spaces: PacketSpaceManager,
    pub alarms: AlarmSet,
    pub local_cids: LocalIdPool,
    pub peer_cids: PeerIdPool,
    pub connection_send_window: Window,
    pub connection_recv_window: ReceiveWindow,
    pub send_controller: C,
    pub flags: ConnectionFlags,
    close_reason: Option<ConnectionError>,
    /// The highest byte offset seen so far per stream, used to translate
    /// per-stream STREAM frame offsets into connection-level MAX_DATA
    /// consumption without double-counting retransmissions.
    pub(crate) stream_recv_high_water: HashMap<StreamId, u64>,
    /// Cumulative bytes the application has read across every stream, used
    /// to advance `connection_recv_window`'s read side the same way a
    /// stream's own window advances on `Stream::read` (spec §4.6 step 6c's
    /// connection-level MAX_DATA keepalive).
    connection_bytes_read: VarInt,
    /// Set by an incoming PATH_CHALLENGE; the embedder should send a
    /// PATH_RESPONSE carrying this data and then clear it.
    pub pending_path_response: Option<[u8; 8]>,
    /// The local (SCID) entry the peer is currently addressing us with, so
    /// a new one on an incoming short-header packet can be recognized as a
    /// switch rather than every packet's destination CID being compared
    /// against the whole pool (spec §4.3 "DCID switch").
    current_local_cid: LocalId,
    /// The `max_data` value a DATA_BLOCKED was last sent against, so a tick
    /// that remains blocked at the same limit doesn't resend it every time.
    last_data_blocked_limit: Option<VarInt>,
    /// Set by [`Connection::on_version_negotiation`] when an incoming
    /// Version Negotiation datagram named a version we also support; the
    /// embedder should restart the handshake with it and clear this by
    /// constructing a fresh `Connection` for the retry (spec §8 scenario 2).
    version_retry: Option<q_quic_core::version::Version>,
    pub(crate) crypto_streams: [CryptoStream; 3],
    /// Which STREAM frames (stream, len, fin) went out in which (space, pn),
    /// so an incoming ACK can be walked back to the streams it covers.
    pub(crate) sent_stream_frames: HashMap<(PacketNumberSpace, u64), Vec<(StreamId, u64, bool)>>,
}

impl<C: SendController> Connection<C> {
    pub fn new(
        local: endpoint::Type,
        config: Config,
        initial_local_id: LocalId,
        initial_local_token: StatelessResetToken,
        initial_peer_id: PeerId,
        initial_peer_reset_token: StatelessResetToken,
        send_controller: C,
    ) -> Self {
        let mut streams = StreamTable::new(
            local,
            config.initial_max_stream_data_bidi_remote,
            config.initial_max_stream_data_bidi_local,
        );
        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
        //# An endpoint limits the cumulative number of incoming streams a peer
        //# can open.
        //
        // These are the limits *we* advertise to the peer for streams the
        // peer initiates, independent of `local_limits` (the peer's own
        // MAX_STREAMS grant to us, raised later by an incoming frame or
        // `apply_peer_transport_parameters`).
        streams.set_peer_limit(q_quic_core::stream::StreamType::Bidirectional, config.initial_max_streams_bidi);
        streams.set_peer_limit(q_quic_core::stream::StreamType::Unidirectional, config.initial_max_streams_uni);

        Self {
            local,
            state: ConnectionState::default(),
            streams,
            spaces: PacketSpaceManager::new(),
            alarms: AlarmSet::new(),
            local_cids: LocalIdPool::new(initial_local_id, initial_local_token, config.active_connection_id_limit),
            peer_cids: PeerIdPool::new(
                initial_peer_id,
                initial_peer_reset_token,
                config.active_connection_id_limit,
            ),
            connection_send_window: Window::new(config.initial_max_data),
            connection_recv_window: ReceiveWindow::new(config.initial_max_data),
            send_controller,
            flags: ConnectionFlags::default(),
            close_reason: None,
            stream_recv_high_water: HashMap::new(),
            connection_bytes_read: VarInt::ZERO,
            pending_path_response: None,
            current_local_cid: initial_local_id,
            last_data_blocked_limit: None,
            version_retry: None,
            crypto_streams: [CryptoStream::new(), CryptoStream::new(), CryptoStream::new()],
            sent_stream_frames: HashMap::new(),
            config,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local(&self) -> endpoint::Type {
        self.local
    }

    pub fn close_reason(&self) -> Option<&ConnectionError> {
        self.close_reason.as_ref()
    }

    /// The embedder-facing lifecycle summary (spec §5, §7).
    pub fn status(&self) -> Status {
        match &self.close_reason {
            Some(reason) => Status::from_close_reason(reason),
            None if self.state.is_handshaking() => Status::HandshakeInProgress,
            None => Status::Connected,
        }
    }

    /// A client-only reaction to an incoming Version Negotiation datagram
    /// (RFC 9000 §6): picks the first of our supported versions the peer
    /// also offered, in our preference order, and records it for the
    /// embedder to retry the handshake with. Only legal while still in the
    /// initial handshake; a VN datagram arriving any later is ignored, per
    /// RFC 9000 §6.2's "MUST be ignored" once the handshake has progressed.
    pub fn on_version_negotiation(
        &mut self,
        offered: &[q_quic_core::version::Version],
    ) -> Result<(), ConnectionError> {
        if !self.state.is_handshaking() || self.local != endpoint::Type::Client {
            return Ok(());
        }
        match q_quic_core::version::negotiate(&self.config.supported_versions, offered) {
            q_quic_core::version::NegotiationOutcome::Retry(version) => {
                self.version_retry = Some(version);
                Ok(())
            }
            q_quic_core::version::NegotiationOutcome::NoCommonVersion => {
                Err(TransportError::PROTOCOL_VIOLATION
                    .with_reason("no version in common with peer's Version Negotiation")
                    .into())
            }
        }
    }

    /// `Some` once `on_version_negotiation` has chosen a retry version the
    /// embedder should restart the handshake with (spec §8 scenario 2).
    pub fn pending_version_retry(&self) -> Option<q_quic_core::version::Version> {
        self.version_retry
    }

    pub(crate) fn crypto_stream_mut(&mut self, space: PacketNumberSpace) -> &mut CryptoStream {
        &mut self.crypto_streams[space as usize]
    }

    pub fn on_handshake_confirmed(&mut self) -> Result<(), ConnectionError> {
        self.state
            .on_handshake_confirmed()
            .map_err(|_| TransportError::PROTOCOL_VIOLATION.into())?;
        self.alarms.handshake.cancel();
        if self.local == endpoint::Type::Server {
            self.flags.send_handshake_done = true;
        }
        Ok(())
    }

    /// Applies the peer's transport parameters once the crypto session has
    /// unpacked them, raising every limit this connection started out with
    /// only a conservative guess for (spec §4.6 "Handshake completion").
    /// Promotes streams a caller opened before the limits were known and,
    /// were HTTP/3 in scope, is also where its control and QPACK streams
    /// would be created.
    pub fn apply_peer_transport_parameters(&mut self, params: crate::config::PeerTransportParameters) {
        self.connection_send_window.set_max(params.initial_max_data);
        self.streams.set_local_limit(
            q_quic_core::stream::StreamType::Bidirectional,
            params.initial_max_streams_bidi,
        );
        self.streams.set_local_limit(
            q_quic_core::stream::StreamType::Unidirectional,
            params.initial_max_streams_uni,
        );
        if let Some(token) = params.stateless_reset_token {
            self.peer_cids.set_initial_reset_token(token);
        }
    }

    /// Processes one already-decrypted frame received at `level`, routing it
    /// to the matching handler if it's legal there.
    pub fn on_frame(
        &mut self,
        frame: &Frame<'_>,
        level: q_quic_core::crypto::EncryptionLevel,
        now: Timestamp,
    ) -> Result<(), ConnectionError> {
        if !q_quic_core::frame::legality::is_legal(level, frame) {
            return Err(TransportError::PROTOCOL_VIOLATION
                .with_reason("frame illegal at this encryption level")
                .into());
        }
        frame_dispatch::dispatch(self, frame, level, now)
    }

    /// The receive-side entry point: records the decoder-supplied packet
    /// metadata against the matching packet number space (arming or
    /// cancelling that space's ACK alarm), then dispatches every frame the
    /// decoder already pulled out of the datagram, in order (spec §4.6,
    /// §5 "Ordering"). Once any Handshake-level packet has gone out,
    /// Initial-level datagrams are discarded undecrypted by the caller
    /// before this is ever reached; this only re-asserts the invariant for
    /// anything that slips through.
    pub fn packet_in(
        &mut self,
        meta: q_quic_core::packet::ReceivedPacket,
        frames: &[Frame<'_>],
        now: Timestamp,
    ) -> Result<(), ConnectionError> {
        let space = meta.number.space();
        if space == PacketNumberSpace::Initial && self.spaces.is_initial_dropped() {
            return Ok(());
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-9.5
        //# An endpoint only changes the address that it sends packets to in
        //# response to the highest-numbered non-probing packet.
        if meta.level.is_application() && meta.destination_connection_id != self.current_local_cid {
            self.local_cids.mark_used(&meta.destination_connection_id);
            self.current_local_cid = meta.destination_connection_id;
            if let Some(next) = self.peer_cids.next_unused_sequence() {
                self.peer_cids.switch_active(next);
            }
            // No spare DCID to rotate to: suppress our half of the switch
            // rather than keep addressing the peer with a retired ID.
        }

        let is_ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        let schedule = self.spaces.get_mut(space).on_packet_received(
            meta.number.as_u64(),
            now,
            is_ack_eliciting,
            meta.ecn.ect0,
            meta.ecn.ect1,
            meta.ecn.ce,
            self.config.max_ack_delay,
            self.send_controller.smoothed_rtt(),
        );
        match schedule {
            crate::space::AckSchedule::Immediate => self.alarms.cancel_ack(space),
            crate::space::AckSchedule::Delayed(deadline) => self.alarms.set_ack(space, deadline),
            crate::space::AckSchedule::None => {}
        }

        if space == PacketNumberSpace::Handshake {
            self.spaces.drop_initial();
        }

        for frame in frames {
            self.on_frame(frame, meta.level, now)?;
        }
        Ok(())
    }

    /// Tears the connection down, idempotently: a repeated call while
    /// `close_reason` is already set is a no-op, matching `abort()`'s
    /// documented idempotence (spec §8). Logs at INFO for an expected,
    /// quietly-handled failure and at ERROR for everything else (spec §4.7).
    pub fn fail(&mut self, error: ConnectionError, quiet: bool) {
        if self.close_reason.is_some() {
            return;
        }
        if quiet {
            tracing::info!(?error, "connection closing");
        } else {
            tracing::error!(?error, "connection closing");
        }
        self.close_reason = Some(error);
        self.flags.send_connection_close = true;
        let _ = self.state.on_local_close();
    }

    /// Application-requested teardown with no specific protocol reason
    /// (spec §5 "Cancellation"). Calling it twice has the same effect as
    /// once.
    pub fn abort(&mut self) {
        self.fail(ConnectionError::Aborted, true);
    }

    /// Queues a locally-initiated close for a specific transport reason; the
    /// next `tick()` packages it into a CONNECTION_CLOSE frame.
    pub fn close(&mut self, error: TransportError) -> Result<(), ConnectionError> {
        self.fail(ConnectionError::Transport(error), true);
        Ok(())
    }

    pub fn on_peer_close(&mut self, error_code: q_quic_core::varint::VarInt, is_application_error: bool) {
        if self.close_reason.is_none() {
            self.close_reason = Some(ConnectionError::PeerClosed {
                error_code,
                is_application_error,
            });
        }
        let _ = self.state.on_peer_close();
    }

    pub fn next_tick_time(&self) -> Option<Timestamp> {
        self.alarms.next_expiration()
    }

    pub fn space_mut(&mut self, space: PacketNumberSpace) -> &mut crate::space::PacketNumberSpaceState {
        self.spaces.get_mut(space)
    }

    /// The local (SCID) entry the peer is currently addressing us with.
    pub(crate) fn current_local_cid(&self) -> LocalId {
        self.current_local_cid
    }

    /// Delivers the next contiguous chunk of `id`'s received bytes to the
    /// application, the sanctioned read path: besides draining the stream's
    /// own reassembly buffer, it advances the connection-level receive
    /// window's read side so `should_trigger_keepalive_max_data`/step 6c's
    /// MAX_DATA keepalive isn't permanently dead (spec §4.6 step 6c).
    pub fn read_stream(&mut self, id: StreamId) -> Option<Vec<u8>> {
        let data = self.streams.get_mut(id)?.read()?;
        self.connection_bytes_read = self.connection_bytes_read.saturating_add(
            VarInt::new(data.len() as u64).unwrap_or(VarInt::MAX),
        );
        self.connection_recv_window.on_bytes_read(self.connection_bytes_read);
        Some(data)
    }

    /// Drives every timer- and flag-triggered piece of connection-local work
    /// that doesn't depend on an incoming packet (spec §4.6, 10 steps).
    pub fn tick(&mut self, now: Timestamp) -> TickResult {
        // Step 1 (spec §4.6): process any deferred saved-ACK before anything
        // else, so a single-range ACK with no follow-up ACK still reaches
        // the streams and send controller it covers.
        frame_dispatch::process_saved_ack(self, PacketNumberSpace::ApplicationData);

        if self.state.is_handshaking() && !self.alarms.handshake.is_armed() {
            self.alarms.handshake.set(add_saturating(now, self.config.handshake_timeout));
        }

        let mut fired = Vec::new();
        self.alarms.poll_expirations(now, |id| fired.push(id));

        for id in fired {
            match id {
                AlarmId::Idle => self.fail(ConnectionError::IdleTimeout, true),
                AlarmId::Handshake => {
                    if self.state.is_handshaking() {
                        self.fail(ConnectionError::HandshakeFailed, true);
                    }
                }
                AlarmId::Ack(_space) => {
                    // The ACK itself is only built once, at assembly time
                    // (step 6b below); the alarm's job was just to wake us.
                }
                AlarmId::Ping => self.flags.send_ping = true,
            }
        }

        if self.close_reason.is_some() {
            if self.flags.send_connection_close {
                self.flags.send_connection_close = false;
                let packet = self.build_close_packet(now);
                self.alarms.idle.set(add_saturating(now, CLOSING_LINGER));
                return TickResult::Close(packet);
            }
            if matches!(self.state, ConnectionState::Closing | ConnectionState::Draining)
                && !self.alarms.idle.is_armed()
            {
                let _ = self.state.on_closing_timer_expired();
            }
            return TickResult::Close(None);
        }

        self.streams.reap_closed(|_id| {});

        if self.local_cids.has_room() {
            self.flags.send_new_connection_id = true;
        }

        if self.send_controller.can_send() {
            for space in [PacketNumberSpace::Initial, PacketNumberSpace::Handshake] {
                if let Some(packet) = self.fill_basic_packet(space, now) {
                    self.record_sent(&packet, now);
                    self.send_controller.schedule(packet);
                }
            }

            if let Some(packet) = self.fill_application_packet(now) {
                self.record_sent(&packet, now);
                let carries_ack = packet.frames.iter().any(|f| matches!(f, OutboundFrame::Ack(_)));
                if carries_ack {
                    self.send_controller.ack_to_front(packet);
                } else {
                    self.send_controller.schedule(packet);
                }
            }
        }

        let mut packets = Vec::new();
        while let Some(packet) = self.send_controller.next_to_send() {
            packets.push(packet);
        }

        if packets.is_empty() && self.flags.send_ping {
            let space = if self.state.is_handshaking() {
                PacketNumberSpace::Initial
            } else {
                PacketNumberSpace::ApplicationData
            };
            if let Ok(mut packet) = self.send_controller.new_packet(space, 0) {
                packet.push(OutboundFrame::Ping);
                self.record_sent(&packet, now);
                packets.push(packet);
            }
        }
        self.flags.send_ping = false;

        if let Some(idle_timeout) = self.config.max_idle_timeout {
            self.alarms.idle.set(add_saturating(now, idle_timeout));
        }
        if !self.streams.is_empty() {
            self.alarms.ping.set(add_saturating(now, PING_INTERVAL));
        }

        if packets.is_empty() {
            TickResult::Quiet
        } else {
            TickResult::Send(packets)
        }
    }

    fn record_sent(&mut self, packet: &Packet, now: Timestamp) {
        let size = packet.estimated_size();
        self.send_controller.on_sent(packet, now, size, packet.ack_eliciting);
        self.spaces.get_mut(packet.space).on_packet_sent(packet.ack_eliciting);
    }

    /// Builds the final CONNECTION_CLOSE packet for a terminal connection,
    /// or `None` if the close is configured to be silent (idle timeout).
    fn build_close_packet(&mut self, now: Timestamp) -> Option<Packet> {
        let reason = *self.close_reason.as_ref()?;
        if self.config.silent_close && matches!(reason, ConnectionError::IdleTimeout) {
            return None;
        }
        let space = if self.state.is_handshaking() {
            PacketNumberSpace::Initial
        } else {
            PacketNumberSpace::ApplicationData
        };
        let mut packet = self.send_controller.new_packet(space, 0).ok()?;
        let (error_code, is_application_error, reason_bytes) = match reason {
            ConnectionError::Transport(e) => (e.code, false, Bytes::copy_from_slice(e.reason.as_bytes())),
            ConnectionError::PeerClosed {
                error_code,
                is_application_error,
            } => (error_code, is_application_error, Bytes::new()),
            ConnectionError::ApplicationClosed => (VarInt::ZERO, true, Bytes::new()),
            _ => (VarInt::ZERO, false, Bytes::new()),
        };
        packet.push(OutboundFrame::ConnectionClose {
            error_code,
            frame_type: None,
            reason: reason_bytes,
            is_application_error,
        });
        self.record_sent(&packet, now);
        Some(packet)
    }

    /// Assembles an Initial- or Handshake-space packet: a due ACK followed
    /// by as much unsent CRYPTO data as fits.
    fn fill_basic_packet(&mut self, space: PacketNumberSpace, now: Timestamp) -> Option<Packet> {
        let mut packet = self.send_controller.new_packet(space, 0).ok()?;

        if let Some(built) = self.spaces.get_mut(space).build_and_clear(now, self.config.ack_delay_exponent) {
            packet.push(OutboundFrame::Ack(AckPayload {
                largest_acknowledged: built.largest_acknowledged,
                ack_delay: built.ack_delay,
                ranges: built.ranges,
                ecn_counts: built.ecn_counts,
            }));
            self.alarms.cancel_ack(space);
        }
        packet.mark_regen_boundary();

        let crypto = self.crypto_stream_mut(space);
        if crypto.has_unsent() {
            let offset = crypto.send_offset();
            let data = crypto.peek_send(1024);
            if !data.is_empty() {
                let len = data.len() as u64;
                crypto.on_data_sent(len);
                packet.push(OutboundFrame::Crypto {
                    offset: VarInt::new(offset).unwrap_or(VarInt::MAX),
                    data: Bytes::from(data),
                });
            }
        }

        if packet.is_empty() {
            None
        } else {
            Some(packet)
        }
    }

    /// Assembles the Application-space packet: ACK, MAX_DATA, connection-ID
    /// housekeeping, requeued lost frames, then per-stream control and data
    /// frames (spec §4.6 step 6).
    fn fill_application_packet(&mut self, now: Timestamp) -> Option<Packet> {
        let space = PacketNumberSpace::ApplicationData;
        let mut packet = self.send_controller.new_packet(space, 0).ok()?;

        if self.flags.send_handshake_done {
            packet.push(OutboundFrame::HandshakeDone);
            self.flags.send_handshake_done = false;
        }

        if let Some(built) = self.spaces.get_mut(space).build_and_clear(now, self.config.ack_delay_exponent) {
            packet.push(OutboundFrame::Ack(AckPayload {
                largest_acknowledged: built.largest_acknowledged,
                ack_delay: built.ack_delay,
                ranges: built.ranges,
                ecn_counts: built.ecn_counts,
            }));
            self.alarms.cancel_ack(space);
            //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
            //# To keep the receive window open, a receiver MAY send a MAX_DATA
            //# frame periodically.
            //
            // A gappy ACK followed by a long run of non-ack-eliciting sends
            // could otherwise leave the peer believing its window is closed
            // well past the point the receiver actually reopened it (spec
            // §4.1 "after emission... schedule a MAX_DATA frame").
            if self.spaces.get(space).should_trigger_keepalive_max_data() {
                self.flags.send_max_data = true;
            }
        }

        if let Some(new_max) = self.connection_recv_window.advance_window() {
            packet.push(OutboundFrame::MaxData { maximum_data: new_max });
            self.flags.send_max_data = false;
        } else if core::mem::take(&mut self.flags.send_max_data) {
            packet.push(OutboundFrame::MaxData {
                maximum_data: self.connection_recv_window.max(),
            });
        }

        packet.mark_regen_boundary();

        if let Some(data) = self.pending_path_response.take() {
            packet.push(OutboundFrame::PathResponse { data });
        }

        self.flags.send_new_connection_id = false;
        for (seq, id, token) in self.local_cids.take_pending_advertisements(4) {
            packet.push(OutboundFrame::NewConnectionId {
                sequence_number: seq,
                retire_prior_to: VarInt::ZERO,
                connection_id: id,
                stateless_reset_token: token,
            });
        }
        for seq in self.peer_cids.take_pending_retirements(4) {
            packet.push(OutboundFrame::RetireConnectionId { sequence_number: seq });
        }

        for lost in self.send_controller.on_loss(now) {
            for (idx, frame) in lost.frames.into_iter().enumerate() {
                // Regeneratable frames (ACK, MAX_DATA) are rebuilt fresh
                // above rather than replayed verbatim.
                if idx >= lost.regen_size {
                    packet.push(frame);
                }
            }
        }

        let stream_ids: Vec<StreamId> = self.streams.iter_mut().map(|(id, _)| *id).collect();

        for id in &stream_ids {
            let Some(stream) = self.streams.get_mut(*id) else {
                continue;
            };
            if stream.flags.send_reset {
                packet.push(OutboundFrame::ResetStream {
                    stream_id: *id,
                    application_error_code: VarInt::ZERO,
                    final_size: stream.send_offset(),
                });
                let _ = stream.on_reset_sent();
            }
            if let Some(new_max) = stream.poll_window_update() {
                packet.push(OutboundFrame::MaxStreamData {
                    stream_id: *id,
                    maximum_stream_data: new_max,
                });
                stream.on_max_stream_data_sent();
            }
            if core::mem::take(&mut stream.flags.send_blocked) {
                packet.push(OutboundFrame::StreamDataBlocked {
                    stream_id: *id,
                    stream_data_limit: stream.send_window_max(),
                });
            }
        }

        // Two-tier write pass: the first ready stream gets first crack at
        // the packet, then every other ready stream fills the remainder.
        let (first_ready, rest): (Vec<StreamId>, Vec<StreamId>) = {
            let mut first = None;
            let mut rest = Vec::new();
            for id in stream_ids {
                let ready = self.streams.get_mut(id).map(|s| s.flags.want_write).unwrap_or(false);
                if !ready {
                    continue;
                }
                if first.is_none() {
                    first = Some(id);
                } else {
                    rest.push(id);
                }
            }
            (first.into_iter().collect(), rest)
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.1
        //# A sender MUST NOT send data in excess of the maximum data it has
        //# received from the receiver.
        //
        // Stream-level windows bound each stream individually; this caps
        // their sum across the whole tick at the connection's max_data
        // (spec §3 invariant, §4.2 "connection-level DATA_BLOCKED").
        let mut connection_budget = self.connection_send_window.available().as_u64();
        let mut connection_blocked = false;

        for id in first_ready.into_iter().chain(rest) {
            let Some(stream) = self.streams.get_mut(id) else {
                continue;
            };
            if connection_budget == 0 {
                stream.on_send_window_blocked();
                connection_blocked = true;
                continue;
            }
            let offset = stream.send_offset();
            let max_len = (1024u64).min(connection_budget) as usize;
            let (data, fin) = stream.peek_send(max_len);
            if data.is_empty() && !fin {
                stream.on_send_window_blocked();
                continue;
            }
            let len = data.len() as u64;
            let _ = stream.on_data_sent(len, fin);
            connection_budget -= len;
            let new_offset = self.connection_send_window.consumed().saturating_add(VarInt::new(len).unwrap_or(VarInt::ZERO));
            let _ = self.connection_send_window.consume_to(new_offset);
            packet.push(OutboundFrame::Stream {
                stream_id: id,
                offset,
                data: Bytes::from(data),
                is_fin: fin,
            });
            self.sent_stream_frames
                .entry((space, packet.number.as_u64()))
                .or_default()
                .push((id, len, fin));
        }

        self.flags.send_data_blocked = connection_blocked;
        if connection_blocked && self.last_data_blocked_limit != Some(self.connection_send_window.max()) {
            self.last_data_blocked_limit = Some(self.connection_send_window.max());
            packet.push(OutboundFrame::DataBlocked {
                data_limit: self.connection_send_window.max(),
            });
        } else if !connection_blocked {
            self.last_data_blocked_limit = None;
        }

        if packet.is_empty() {
            None
        } else {
            Some(packet)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send::FixedWindowController;
    use std::convert::TryFrom;

    fn connection() -> Connection<FixedWindowController> {
        Connection::new(
            endpoint::Type::Client,
            Config::default(),
            LocalId::try_from(&[1u8][..]).unwrap(),
            StatelessResetToken::new([9; 16]),
            PeerId::try_from(&[2u8][..]).unwrap(),
            StatelessResetToken::new([0; 16]),
            FixedWindowController::new(12_000),
        )
    }

    #[test]
    fn starts_handshaking_and_moves_to_active() {
        let mut c = connection();
        assert!(c.state().is_handshaking());
        c.on_handshake_confirmed().unwrap();
        assert!(c.state().is_active());
    }

    #[test]
    fn local_close_then_timeout_reaches_closed() {
        let mut c = connection();
        c.close(TransportError::NO_ERROR).unwrap();
        assert!(c.state().is_closing());
        let now = Timestamp::ZERO;
        match c.tick(now) {
            TickResult::Close(Some(_)) => {}
            other => panic!("expected a final close packet, got {other:?}"),
        }
        let later = Timestamp::from_duration(CLOSING_LINGER + Duration::from_millis(1));
        match c.tick(later) {
            TickResult::Close(None) => {}
            other => panic!("expected no further close packet, got {other:?}"),
        }
        assert!(c.state().is_closed());
    }

    #[test]
    fn abort_is_idempotent() {
        let mut c = connection();
        c.abort();
        let reason_once = c.close_reason().copied();
        c.abort();
        assert_eq!(c.close_reason().copied(), reason_once);
    }

    #[test]
    fn first_tick_arms_the_handshake_timeout_within_ten_seconds() {
        let c = connection();
        let deadline = c.config().handshake_timeout;
        assert_eq!(deadline, Duration::from_micros(10_000_000));
    }

    #[test]
    fn handshake_timeout_fails_a_still_handshaking_connection() {
        let mut c = connection();
        c.tick(Timestamp::ZERO);
        let deadline = c.next_tick_time().unwrap();
        assert!(deadline.as_duration() <= Duration::from_micros(10_000_000));
        c.tick(deadline);
        assert_eq!(c.status(), Status::HandshakeFailure);
    }

    #[test]
    fn completed_handshake_cancels_the_handshake_timeout() {
        let mut c = connection();
        c.tick(Timestamp::ZERO);
        c.on_handshake_confirmed().unwrap();
        assert!(!c.alarms.handshake.is_armed());
    }

    #[test]
    fn idle_timeout_produces_timed_out_status() {
        let mut c = connection();
        c.on_handshake_confirmed().unwrap();
        let idle_deadline = c.config().max_idle_timeout.unwrap();
        c.tick(Timestamp::ZERO);
        c.tick(Timestamp::from_duration(idle_deadline + Duration::from_micros(1)));
        assert_eq!(c.status(), Status::TimedOut);
    }

    #[test]
    fn crypto_data_is_scheduled_into_an_initial_packet() {
        let mut c = connection();
        c.crypto_stream_mut(PacketNumberSpace::Initial).write(b"client hello");
        match c.tick(Timestamp::ZERO) {
            TickResult::Send(packets) => {
                let has_crypto = packets
                    .iter()
                    .any(|p| p.frames.iter().any(|f| matches!(f, OutboundFrame::Crypto { .. })));
                assert!(has_crypto);
            }
            other => panic!("expected a packet carrying CRYPTO data, got {other:?}"),
        }
    }

    #[test]
    fn version_negotiation_picks_common_version_for_a_client() {
        let mut c = connection();
        assert_eq!(c.pending_version_retry(), None);
        let offered = [q_quic_core::version::Version::new(0xdead_beef), q_quic_core::version::Version::QUIC_V1];
        c.on_version_negotiation(&offered).unwrap();
        assert_eq!(c.pending_version_retry(), Some(q_quic_core::version::Version::QUIC_V1));
    }

    #[test]
    fn version_negotiation_with_no_overlap_fails_the_connection() {
        let mut c = connection();
        let offered = [q_quic_core::version::Version::new(0xdead_beef)];
        assert!(c.on_version_negotiation(&offered).is_err());
    }

    #[test]
    fn version_negotiation_is_ignored_once_handshake_is_confirmed() {
        let mut c = connection();
        c.on_handshake_confirmed().unwrap();
        let offered = [q_quic_core::version::Version::QUIC_V1];
        c.on_version_negotiation(&offered).unwrap();
        assert_eq!(c.pending_version_retry(), None);
    }

    #[test]
    fn path_challenge_is_answered_with_a_path_response_on_next_tick() {
        let mut c = connection();
        c.on_handshake_confirmed().unwrap();
        let challenge = q_quic_core::frame::PathChallenge { data: [7; 8] };
        c.on_frame(
            &Frame::PathChallenge(challenge),
            q_quic_core::crypto::EncryptionLevel::OneRtt,
            Timestamp::ZERO,
        )
        .unwrap();
        assert_eq!(c.pending_path_response, Some([7; 8]));

        match c.tick(Timestamp::ZERO) {
            TickResult::Send(packets) => {
                let response = packets.iter().find_map(|p| {
                    p.frames.iter().find_map(|f| match f {
                        OutboundFrame::PathResponse { data } => Some(*data),
                        _ => None,
                    })
                });
                assert_eq!(response, Some([7; 8]));
            }
            other => panic!("expected a packet carrying PATH_RESPONSE, got {other:?}"),
        }
        assert_eq!(c.pending_path_response, None);
    }

    #[test]
    fn a_new_destination_connection_id_switches_the_active_peer_cid() {
        let mut c = connection();
        c.on_handshake_confirmed().unwrap();

        let second_local = LocalId::try_from(&[1u8, 2][..]).unwrap();
        c.local_cids.issue(second_local, StatelessResetToken::new([1; 16])).unwrap();
        c.peer_cids
            .on_new_connection_id(
                VarInt::from_u32(1),
                VarInt::ZERO,
                PeerId::try_from(&[9u8][..]).unwrap(),
                StatelessResetToken::new([2; 16]),
            )
            .unwrap();
        let original_active = c.peer_cids.active_sequence();

        let meta = q_quic_core::packet::ReceivedPacket {
            number: PacketNumberSpace::ApplicationData.new_packet_number(1),
            level: q_quic_core::crypto::EncryptionLevel::OneRtt,
            ecn: q_quic_core::packet::EcnMarking::default(),
            received_time: Timestamp::ZERO,
            destination_connection_id: second_local,
        };
        c.packet_in(meta, &[], Timestamp::ZERO).unwrap();

        assert_ne!(c.peer_cids.active_sequence(), original_active);
    }

    #[test]
    fn connection_level_send_window_blocks_and_emits_data_blocked() {
        use q_quic_core::stream::StreamType;

        let mut c = connection();
        c.on_handshake_confirmed().unwrap();
        c.connection_send_window = Window::new(VarInt::ZERO);
        c.streams.set_local_limit(StreamType::Bidirectional, 10);

        let id = c.streams.open_local(StreamType::Bidirectional).unwrap();
        c.streams.get_mut(id).unwrap().write(&[1u8; 100], false).unwrap();

        match c.tick(Timestamp::ZERO) {
            TickResult::Send(packets) => {
                let has_data_blocked = packets
                    .iter()
                    .any(|p| p.frames.iter().any(|f| matches!(f, OutboundFrame::DataBlocked { .. })));
                assert!(has_data_blocked, "expected a DATA_BLOCKED frame, got {packets:?}");
                let sent: u64 = packets
                    .iter()
                    .flat_map(|p| p.frames.iter())
                    .filter_map(|f| match f {
                        OutboundFrame::Stream { data, .. } => Some(data.len() as u64),
                        _ => None,
                    })
                    .sum();
                assert_eq!(sent, 0);
            }
            other => panic!("expected a packet, got {other:?}"),
        }

        // A second tick at the same limit must not resend DATA_BLOCKED.
        match c.tick(Timestamp::ZERO) {
            TickResult::Send(packets) => {
                let has_data_blocked = packets
                    .iter()
                    .any(|p| p.frames.iter().any(|f| matches!(f, OutboundFrame::DataBlocked { .. })));
                assert!(!has_data_blocked);
            }
            TickResult::Quiet => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reading_a_stream_advances_the_connection_level_recv_window() {
        // Regression: on_bytes_read must reach connection_recv_window, or
        // should_trigger_keepalive_max_data (and step 6c's MAX_DATA) can
        // never fire since the window's read side never moves.
        let mut c = connection();
        c.on_handshake_confirmed().unwrap();
        c.connection_recv_window = ReceiveWindow::new(VarInt::from_u32(20));

        let peer_stream = q_quic_core::stream::StreamId::initial(
            endpoint::Type::Server,
            q_quic_core::stream::StreamType::Bidirectional,
        );
        let frame = Frame::Stream(q_quic_core::frame::StreamFrame {
            stream_id: peer_stream,
            offset: VarInt::ZERO,
            data: &[1u8; 20],
            is_fin: false,
        });
        c.on_frame(&frame, q_quic_core::crypto::EncryptionLevel::OneRtt, Timestamp::ZERO)
            .unwrap();
        assert!(!c.connection_recv_window.should_advance_window());

        let data = c.read_stream(peer_stream).unwrap();
        assert_eq!(data.len(), 20);
        assert!(c.connection_recv_window.should_advance_window());
    }

    #[test]
    fn a_peer_initiated_stream_frame_opens_the_stream_by_default() {
        // Regression: Config's default peer-facing stream limits must
        // actually reach StreamTable, or every peer-initiated STREAM frame
        // aborts the connection with StreamLimitError.
        let mut c = connection();
        c.on_handshake_confirmed().unwrap();
        let peer_stream = q_quic_core::stream::StreamId::initial(
            endpoint::Type::Server,
            q_quic_core::stream::StreamType::Bidirectional,
        );
        let frame = Frame::Stream(q_quic_core::frame::StreamFrame {
            stream_id: peer_stream,
            offset: VarInt::ZERO,
            data: b"hi",
            is_fin: false,
        });
        c.on_frame(&frame, q_quic_core::crypto::EncryptionLevel::OneRtt, Timestamp::ZERO)
            .unwrap();
        assert!(c.streams.get(peer_stream).is_some());
    }
}
