// SPDX-License-Identifier: Apache-2.0

//! The stateful per-connection QUIC transport core: streams, flow control,
//! packet number spaces, connection IDs, and the `tick()` driving loop that
//! ties them together. Deliberately I/O- and crypto-agnostic; an embedder
//! supplies a wire codec, a TLS session, and a congestion controller and
//! drives this crate through `packet_in`, `tick`, and the stream read/write
//! calls (see [`connection::Connection`]).

pub mod alarm;
pub mod callbacks;
pub mod config;
pub mod connection;
pub mod connection_id;
pub mod crypto_stream;
pub mod error;
pub mod flow_control;
mod frame_dispatch;
pub mod packet;
pub mod send;
pub mod space;
pub mod stream;

pub use callbacks::Status;
pub use config::Config;
pub use connection::{Connection, ConnectionState, TickResult};
pub use error::ConnectionError;
pub use packet::{OutboundFrame, Packet};
pub use send::SendController;
