// SPDX-License-Identifier: Apache-2.0

//! Foundational QUIC types shared by the connection state machine:
//! identifiers, varints, frame values, and the small state-machine DSL the
//! stream and connection FSMs are built from. Wire encoding/decoding, the
//! TLS crypto session, congestion control, and HTTP/3 framing live outside
//! this crate.

pub mod connection;
pub mod crypto;
pub mod endpoint;
pub mod frame;
pub mod interval_set;
pub mod packet;
pub mod state;
pub mod stream;
pub mod time;
pub mod transport_error;
pub mod varint;
pub mod version;
