// SPDX-License-Identifier: Apache-2.0

//! Connection-wide tunables, mirroring the subset of RFC 9000 §18.2
//! transport parameters this crate actually consumes. Negotiating
//! transport parameters with a peer is a TLS-layer concern and out of
//! scope; a `Config` here represents the already-resolved, effective
//! values for one connection.

use core::time::Duration;
use q_quic_core::{self, varint::VarInt, version::Version};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub initial_max_data: VarInt,
    pub initial_max_stream_data_bidi_local: VarInt,
    pub initial_max_stream_data_bidi_remote: VarInt,
    pub initial_max_stream_data_uni: VarInt,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub max_idle_timeout: Option<Duration>,
    /// How long a handshake may remain incomplete before the connection
    /// fails with `HandshakeFailed` (spec §6 "handshake timeout (usec)",
    /// §8 scenario 1).
    pub handshake_timeout: Duration,
    pub max_ack_delay: Duration,
    pub ack_delay_exponent: u8,
    pub active_connection_id_limit: u64,
    /// When closing, skip sending CONNECTION_CLOSE entirely (e.g. after a
    /// stateless reset, or when the embedder wants a hard local drop).
    pub silent_close: bool,
    /// Versions this endpoint is willing to retry the handshake with, most
    /// preferred first, consulted on an incoming Version Negotiation
    /// datagram (spec §6 "Configuration", "versions bitmask").
    pub supported_versions: Vec<Version>,
}

/// The peer's transport parameters, as unpacked by the (out-of-scope) crypto
/// session once the handshake completes (spec §4.6 "Handshake completion").
/// Negotiating and encoding these on the wire is a TLS-layer concern; this
/// is the already-decoded result the connection applies to its own limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerTransportParameters {
    pub initial_max_data: VarInt,
    pub initial_max_stream_data_bidi_local: VarInt,
    pub initial_max_stream_data_bidi_remote: VarInt,
    pub initial_max_stream_data_uni: VarInt,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub max_ack_delay: Duration,
    pub active_connection_id_limit: u64,
    pub stateless_reset_token: Option<q_quic_core::connection::id::StatelessResetToken>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_max_data: VarInt::from_u32(1 << 20),
            initial_max_stream_data_bidi_local: VarInt::from_u32(1 << 16),
            initial_max_stream_data_bidi_remote: VarInt::from_u32(1 << 16),
            initial_max_stream_data_uni: VarInt::from_u32(1 << 16),
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            max_idle_timeout: Some(Duration::from_secs(30)),
            handshake_timeout: Duration::from_micros(10_000_000),
            max_ack_delay: Duration::from_millis(25),
            ack_delay_exponent: 3,
            active_connection_id_limit: 4,
            silent_close: false,
            supported_versions: vec![Version::QUIC_V1],
        }
    }
}
