// SPDX-License-Identifier: Apache-2.0

//! Connection ID pools (RFC 9000 §5.1). Each endpoint manages two
//! independent pools: the local IDs it has issued for the peer to address
//! it by, and the peer IDs it has been given to address the peer.

use hashbrown::HashMap;
use q_quic_core::{
    connection::id::{LocalId, PeerId, StatelessResetToken},
    varint::VarInt,
};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionIdError {
    /// The peer's `active_connection_id_limit` would be exceeded.
    LimitExceeded,
    /// A NEW_CONNECTION_ID frame referenced a sequence number we already
    /// retired, or tried to retire the ID the packet itself arrived on
    /// (RFC 9000 §19.16).
    InvalidRetirement,
    UnknownSequenceNumber,
    /// The same sequence number arrived with a different connection ID, or
    /// the same connection ID arrived under a different sequence number
    /// (RFC 9000 §19.15).
    Inconsistent,
}

#[derive(Debug, Clone)]
struct LocalEntry {
    id: LocalId,
    token: StatelessResetToken,
    retired: bool,
    /// Set once an incoming short-header packet has actually addressed us
    /// with this ID (spec §4.3 "used bitmask").
    used: bool,
}

/// The pool of connection IDs we have issued to our peer via
/// NEW_CONNECTION_ID frames. Bounded to `active_connection_id_limit` slots
/// (spec's fixed 8-slot array, modeled here as a map since a retired slot's
/// sequence number must never be reused). Minting the random ID and token
/// themselves is the engine's job (the connection only tracks which already
/// minted entries the peer hasn't been told about yet).
#[derive(Debug, Default)]
pub struct LocalIdPool {
    entries: HashMap<VarInt, LocalEntry>,
    next_sequence: u64,
    active_limit: u64,
    pending_advertise: VecDeque<VarInt>,
}

impl LocalIdPool {
    pub fn new(initial_id: LocalId, initial_token: StatelessResetToken, peer_active_limit: u64) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            VarInt::ZERO,
            LocalEntry {
                id: initial_id,
                token: initial_token,
                retired: false,
                used: true,
            },
        );
        Self {
            entries,
            next_sequence: 1,
            active_limit: peer_active_limit.max(1),
            pending_advertise: VecDeque::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.entries.values().filter(|e| !e.retired).count()
    }

    /// `true` once the peer's active_connection_id_limit leaves room to
    /// mint and advertise another local ID.
    pub fn has_room(&self) -> bool {
        (self.active_count() as u64) < self.active_limit
    }

    /// Registers a freshly minted local ID (and its stateless reset token),
    /// returning its sequence number, unless doing so would exceed the
    /// peer's advertised active_connection_id_limit. Queues the entry to be
    /// advertised via NEW_CONNECTION_ID on the next packet assembled.
    pub fn issue(&mut self, id: LocalId, token: StatelessResetToken) -> Result<VarInt, ConnectionIdError> {
        if !self.has_room() {
            return Err(ConnectionIdError::LimitExceeded);
        }
        let seq = VarInt::new(self.next_sequence).map_err(|_| ConnectionIdError::LimitExceeded)?;
        self.next_sequence += 1;
        self.entries.insert(
            seq,
            LocalEntry {
                id,
                token,
                retired: false,
                used: false,
            },
        );
        self.pending_advertise.push_back(seq);
        Ok(seq)
    }

    /// Drains up to `max` entries awaiting a NEW_CONNECTION_ID frame.
    pub fn take_pending_advertisements(&mut self, max: usize) -> Vec<(VarInt, LocalId, StatelessResetToken)> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.pending_advertise.pop_front() {
                Some(seq) => {
                    if let Some(entry) = self.entries.get(&seq) {
                        out.push((seq, entry.id, entry.token));
                    }
                }
                None => break,
            }
        }
        out
    }

    /// Marks a local ID retired on receipt of RETIRE_CONNECTION_ID. Fails if
    /// the sequence number exceeds every one we've ever issued (spec's
    /// "Open Question": treated as ProtocolViolation regardless of CID
    /// length), or if it names the very connection ID the packet carrying
    /// the frame was addressed to (RFC 9000 §19.16: a peer can't retire the
    /// ID it's using to talk to us in the same breath).
    pub fn retire(&mut self, sequence_number: VarInt, packet_destination_cid: &LocalId) -> Result<(), ConnectionIdError> {
        if sequence_number.as_u64() >= self.next_sequence {
            return Err(ConnectionIdError::UnknownSequenceNumber);
        }
        if let Some(entry) = self.entries.get(&sequence_number) {
            if entry.id == *packet_destination_cid {
                return Err(ConnectionIdError::InvalidRetirement);
            }
        }
        if let Some(entry) = self.entries.get_mut(&sequence_number) {
            entry.retired = true;
        }
        Ok(())
    }

    pub fn lookup(&self, id: &LocalId) -> Option<VarInt> {
        self.entries
            .iter()
            .find(|(_, e)| &e.id == id && !e.retired)
            .map(|(&seq, _)| seq)
    }

    /// Marks the slot for `id` used, i.e. the peer has actually addressed us
    /// with it. Returns `true` the first time this happens for that slot.
    pub fn mark_used(&mut self, id: &LocalId) -> bool {
        match self.entries.iter_mut().find(|(_, e)| &e.id == id) {
            Some((_, e)) if !e.used => {
                e.used = true;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct PeerEntry {
    id: PeerId,
    stateless_reset_token: StatelessResetToken,
}

/// The pool of connection IDs our peer has issued to us to address it by.
#[derive(Debug, Default)]
pub struct PeerIdPool {
    entries: HashMap<VarInt, PeerEntry>,
    retire_prior_to: u64,
    active: Option<VarInt>,
    active_limit: u64,
    /// Sequence numbers awaiting a RETIRE_CONNECTION_ID frame, drained by
    /// the assembler one per tick while packet space permits (spec §4.3).
    pending_retire: VecDeque<VarInt>,
}

impl PeerIdPool {
    pub fn new(initial_id: PeerId, initial_token: StatelessResetToken, local_active_limit: u64) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            VarInt::ZERO,
            PeerEntry {
                id: initial_id,
                stateless_reset_token: initial_token,
            },
        );
        Self {
            entries,
            retire_prior_to: 0,
            active: Some(VarInt::ZERO),
            active_limit: local_active_limit.max(1),
            pending_retire: VecDeque::new(),
        }
    }

    pub fn active(&self) -> Option<&PeerId> {
        self.active.and_then(|seq| self.entries.get(&seq)).map(|e| &e.id)
    }

    pub fn active_sequence(&self) -> Option<VarInt> {
        self.active
    }

    pub fn is_known_reset_token(&self, token: &StatelessResetToken) -> bool {
        self.entries.values().any(|e| &e.stateless_reset_token == token)
    }

    /// Records the peer's stateless reset token for sequence 0, learned from
    /// its transport parameters rather than a NEW_CONNECTION_ID frame (spec
    /// §4.6): the Initial DCID is assumed, not advertised.
    pub fn set_initial_reset_token(&mut self, token: StatelessResetToken) {
        if let Some(entry) = self.entries.get_mut(&VarInt::ZERO) {
            entry.stateless_reset_token = token;
        }
    }

    /// Records a peer-issued NEW_CONNECTION_ID, returning any sequence
    /// numbers that must now be retired because they fall below
    /// `retire_prior_to`. Those are also queued onto the pending-retirement
    /// FIFO the assembler drains.
    pub fn on_new_connection_id(
        &mut self,
        sequence_number: VarInt,
        retire_prior_to: VarInt,
        id: PeerId,
        stateless_reset_token: StatelessResetToken,
    ) -> Result<Vec<VarInt>, ConnectionIdError> {
        if let Some(existing) = self.entries.get(&sequence_number) {
            if existing.id != id {
                return Err(ConnectionIdError::Inconsistent);
            }
        } else if self
            .entries
            .iter()
            .any(|(&seq, e)| e.id == id && seq != sequence_number)
        {
            return Err(ConnectionIdError::Inconsistent);
        }

        if self.entries.len() as u64 >= self.active_limit
            && !self.entries.contains_key(&sequence_number)
        {
            return Err(ConnectionIdError::LimitExceeded);
        }
        self.entries.insert(
            sequence_number,
            PeerEntry {
                id,
                stateless_reset_token,
            },
        );

        let new_floor = retire_prior_to.as_u64();
        if new_floor <= self.retire_prior_to {
            return Ok(vec![]);
        }
        self.retire_prior_to = new_floor;

        let to_retire: Vec<VarInt> = self
            .entries
            .keys()
            .copied()
            .filter(|seq| seq.as_u64() < new_floor)
            .collect();
        for seq in &to_retire {
            self.entries.remove(seq);
            self.pending_retire.push_back(*seq);
        }
        if self.active.map(|a| a.as_u64() < new_floor).unwrap_or(false) {
            self.active = self.entries.keys().min().copied();
        }
        Ok(to_retire)
    }

    pub fn needs_new_connection_id(&self) -> bool {
        (self.entries.len() as u64) < self.active_limit
    }

    /// Picks a not-currently-active sequence number to switch to, for a
    /// locally-initiated DCID rotation (spec §4.3 "DCID switch"). `None`
    /// means switching would be suppressed: no spare entry is available.
    pub fn next_unused_sequence(&self) -> Option<VarInt> {
        self.entries
            .keys()
            .copied()
            .filter(|&seq| Some(seq) != self.active)
            .min()
    }

    /// Moves the currently active DCID onto the retirement FIFO and adopts
    /// `new_active` in its place.
    pub fn switch_active(&mut self, new_active: VarInt) {
        if let Some(old) = self.active.replace(new_active) {
            if old != new_active {
                self.pending_retire.push_back(old);
            }
        }
    }

    /// Drains up to `max` pending RETIRE_CONNECTION_ID sequence numbers.
    pub fn take_pending_retirements(&mut self, max: usize) -> Vec<VarInt> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.pending_retire.pop_front() {
                Some(seq) => out.push(seq),
                None => break,
            }
        }
        out
    }

    pub fn has_pending_retirements(&self) -> bool {
        !self.pending_retire.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    fn token(b: u8) -> StatelessResetToken {
        StatelessResetToken::new([b; 16])
    }

    #[test]
    fn local_pool_respects_active_limit() {
        let mut pool = LocalIdPool::new(LocalId::try_from(&[1u8][..]).unwrap(), token(0), 2);
        pool.issue(LocalId::try_from(&[2u8][..]).unwrap(), token(1)).unwrap();
        assert_eq!(
            pool.issue(LocalId::try_from(&[3u8][..]).unwrap(), token(2)),
            Err(ConnectionIdError::LimitExceeded)
        );
    }

    #[test]
    fn retiring_frees_room_in_the_local_pool() {
        let mut pool = LocalIdPool::new(LocalId::try_from(&[1u8][..]).unwrap(), token(0), 2);
        let seq = pool.issue(LocalId::try_from(&[2u8][..]).unwrap(), token(1)).unwrap();
        let addressed_with = LocalId::try_from(&[1u8][..]).unwrap();
        pool.retire(seq, &addressed_with).unwrap();
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn retiring_past_the_highest_issued_sequence_is_rejected() {
        let mut pool = LocalIdPool::new(LocalId::try_from(&[1u8][..]).unwrap(), token(0), 2);
        let addressed_with = LocalId::try_from(&[1u8][..]).unwrap();
        assert_eq!(
            pool.retire(VarInt::from_u32(9), &addressed_with),
            Err(ConnectionIdError::UnknownSequenceNumber)
        );
    }

    #[test]
    fn retiring_the_id_the_packet_arrived_on_is_rejected() {
        let mut pool = LocalIdPool::new(LocalId::try_from(&[1u8][..]).unwrap(), token(0), 2);
        let addressed_with = LocalId::try_from(&[1u8][..]).unwrap();
        assert_eq!(
            pool.retire(VarInt::ZERO, &addressed_with),
            Err(ConnectionIdError::InvalidRetirement)
        );
    }

    #[test]
    fn issuing_queues_the_entry_for_advertisement() {
        let mut pool = LocalIdPool::new(LocalId::try_from(&[1u8][..]).unwrap(), token(0), 4);
        let id = LocalId::try_from(&[2u8][..]).unwrap();
        let seq = pool.issue(id, token(1)).unwrap();
        let pending = pool.take_pending_advertisements(8);
        assert_eq!(pending, vec![(seq, id, token(1))]);
        assert!(pool.take_pending_advertisements(8).is_empty());
    }

    #[test]
    fn new_connection_id_below_watermark_retires_old_entries() {
        let mut pool = PeerIdPool::new(PeerId::try_from(&[1u8][..]).unwrap(), token(0), 4);
        pool.on_new_connection_id(
            VarInt::from_u32(1),
            VarInt::ZERO,
            PeerId::try_from(&[2u8][..]).unwrap(),
            token(1),
        )
        .unwrap();
        let retired = pool
            .on_new_connection_id(
                VarInt::from_u32(2),
                VarInt::from_u32(1),
                PeerId::try_from(&[3u8][..]).unwrap(),
                token(2),
            )
            .unwrap();
        assert_eq!(retired, vec![VarInt::ZERO]);
        assert_eq!(pool.take_pending_retirements(8), vec![VarInt::ZERO]);
    }

    #[test]
    fn same_sequence_with_a_different_id_is_inconsistent() {
        let mut pool = PeerIdPool::new(PeerId::try_from(&[1u8][..]).unwrap(), token(0), 4);
        pool.on_new_connection_id(
            VarInt::from_u32(1),
            VarInt::ZERO,
            PeerId::try_from(&[2u8][..]).unwrap(),
            token(1),
        )
        .unwrap();
        assert_eq!(
            pool.on_new_connection_id(
                VarInt::from_u32(1),
                VarInt::ZERO,
                PeerId::try_from(&[9u8][..]).unwrap(),
                token(1),
            ),
            Err(ConnectionIdError::Inconsistent)
        );
    }

    #[test]
    fn same_id_under_a_different_sequence_is_inconsistent() {
        let mut pool = PeerIdPool::new(PeerId::try_from(&[1u8][..]).unwrap(), token(0), 4);
        pool.on_new_connection_id(
            VarInt::from_u32(1),
            VarInt::ZERO,
            PeerId::try_from(&[2u8][..]).unwrap(),
            token(1),
        )
        .unwrap();
        assert_eq!(
            pool.on_new_connection_id(
                VarInt::from_u32(2),
                VarInt::ZERO,
                PeerId::try_from(&[2u8][..]).unwrap(),
                token(2),
            ),
            Err(ConnectionIdError::Inconsistent)
        );
    }

    #[test]
    fn switching_active_queues_the_old_one_for_retirement() {
        let mut pool = PeerIdPool::new(PeerId::try_from(&[1u8][..]).unwrap(), token(0), 4);
        pool.on_new_connection_id(
            VarInt::from_u32(1),
            VarInt::ZERO,
            PeerId::try_from(&[2u8][..]).unwrap(),
            token(1),
        )
        .unwrap();
        let next = pool.next_unused_sequence().unwrap();
        pool.switch_active(next);
        assert_eq!(pool.active_sequence(), Some(next));
        assert_eq!(pool.take_pending_retirements(8), vec![VarInt::ZERO]);
    }
}
