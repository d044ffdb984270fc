// SPDX-License-Identifier: Apache-2.0

//! The small struct the (out-of-scope) wire decoder fills in for each
//! incoming packet. The core never looks at packet bytes directly; it only
//! consumes this metadata plus the frames the decoder already parsed out of
//! the packet's payload (§6 "Wire format").

pub mod number;

use crate::{connection::id::LocalId, crypto::EncryptionLevel, time::Timestamp};
use number::PacketNumber;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EcnMarking {
    pub ect0: bool,
    pub ect1: bool,
    pub ce: bool,
}

impl EcnMarking {
    pub fn any(self) -> bool {
        self.ect0 || self.ect1 || self.ce
    }
}

/// Decoder-supplied metadata for one already-decrypted incoming packet.
/// Frame bytes themselves are handed to the dispatcher separately, already
/// parsed into `Frame` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub number: PacketNumber,
    pub level: EncryptionLevel,
    pub ecn: EcnMarking,
    pub received_time: Timestamp,
    /// The destination connection ID the peer addressed this packet to,
    /// i.e. one of our local (SCID) pool entries. Used to detect the peer
    /// switching which local ID it addresses us with (spec §4.3 "DCID
    /// switch").
    pub destination_connection_id: LocalId,
}
