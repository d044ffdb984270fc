// SPDX-License-Identifier: Apache-2.0

//! Per-packet-number-space receive history and ACK-generation state.

use core::time::Duration;
use q_quic_core::{
    frame::{AckRange, EcnCounts},
    interval_set::IntervalSet,
    packet::number::PacketNumberSpace,
    time::Timestamp,
    varint::VarInt,
};

/// The default ACK-delay timer ceiling (RFC 9000 §18.2 `max_ack_delay`).
pub const DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(25);

/// After this many non-ack-eliciting packets have been sent since the last
/// ack-eliciting one, a gappy ACK triggers a keepalive MAX_DATA.
const MAX_DATA_KEEPALIVE_THRESHOLD: u32 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckSchedule {
    /// Queue immediately: this is the 2nd+ ack-eliciting packet since the
    /// last ACK, it filled a gap, or the watermark advanced.
    Immediate,
    /// Arm the per-space ACK-delay alarm for this deadline.
    Delayed(Timestamp),
    /// Nothing new to acknowledge.
    None,
}

/// The Application-space-only optimization for batching rapidly arriving
/// single-range ACKs without losing RTT sample fidelity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SavedAck {
    pub range: AckRange,
    pub ack_delay: VarInt,
    pub received_time: Timestamp,
}

#[derive(Debug, Default)]
pub struct PacketNumberSpaceState {
    /// Received packet numbers, newest-first.
    received: IntervalSet,
    largest_received_time: Option<Timestamp>,
    ack_eliciting_since_last_ack: u32,
    queued: bool,
    /// The highest packet number we have sent that an ACK from the peer has
    /// acknowledged.
    largest_acked_by_peer: Option<VarInt>,
    /// The highest packet number we've processed in an incoming ACK frame,
    /// used to reject duplicate/stale ACKs.
    largest_ack_processed: Option<VarInt>,
    ecn_ect0_in: VarInt,
    ecn_ect1_in: VarInt,
    ecn_ce_in: VarInt,
    saw_ecn: bool,
    last_ack_had_gaps: bool,
    non_ack_eliciting_sent_since_ack_eliciting: u32,
    pub saved_ack: Option<SavedAck>,
}

impl PacketNumberSpaceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_unacked_received_packets(&self) -> bool {
        self.ack_eliciting_since_last_ack > 0
    }

    pub fn is_ack_queued(&self) -> bool {
        self.queued
    }

    pub fn largest_received(&self) -> Option<u64> {
        self.received.max_value()
    }

    /// Records receipt of a packet at `pn`, returning how the ACK alarm
    /// should react.
    pub fn on_packet_received(
        &mut self,
        pn: u64,
        now: Timestamp,
        is_ack_eliciting: bool,
        ect0: bool,
        ect1: bool,
        ce: bool,
        max_ack_delay: Duration,
        smoothed_rtt: Duration,
    ) -> AckSchedule {
        let was_new_max = self
            .received
            .max_value()
            .map(|m| pn > m)
            .unwrap_or(true);
        let filled_gap = self.received.insert_value(pn);
        self.largest_received_time = Some(now);

        if ect0 {
            self.ecn_ect0_in = self.ecn_ect0_in.saturating_add(VarInt::from_u8(1));
            self.saw_ecn = true;
        }
        if ect1 {
            self.ecn_ect1_in = self.ecn_ect1_in.saturating_add(VarInt::from_u8(1));
            self.saw_ecn = true;
        }
        if ce {
            self.ecn_ce_in = self.ecn_ce_in.saturating_add(VarInt::from_u8(1));
            self.saw_ecn = true;
        }

        if !is_ack_eliciting {
            self.non_ack_eliciting_sent_since_ack_eliciting =
                self.non_ack_eliciting_sent_since_ack_eliciting.saturating_add(1);
            return AckSchedule::None;
        }

        self.ack_eliciting_since_last_ack += 1;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.1
        //# an endpoint SHOULD send an ACK frame after receiving at least two
        //# ack-eliciting packets, or if the received packet had a gap.
        let advanced_watermark = was_new_max && filled_gap;
        if self.ack_eliciting_since_last_ack >= 2 || filled_gap || advanced_watermark {
            self.queued = true;
            return AckSchedule::Immediate;
        }

        self.queued = true;
        let delay = max_ack_delay.min(smoothed_rtt);
        match now.checked_add(delay) {
            Some(deadline) => AckSchedule::Delayed(deadline),
            None => AckSchedule::Immediate,
        }
    }

    /// Records that a packet (ack-eliciting or not) was sent, tracking the
    /// keepalive-MAX_DATA trigger.
    pub fn on_packet_sent(&mut self, is_ack_eliciting: bool) {
        if is_ack_eliciting {
            self.non_ack_eliciting_sent_since_ack_eliciting = 0;
        } else {
            self.non_ack_eliciting_sent_since_ack_eliciting =
                self.non_ack_eliciting_sent_since_ack_eliciting.saturating_add(1);
        }
    }

    pub fn should_trigger_keepalive_max_data(&self) -> bool {
        self.last_ack_had_gaps
            && self.non_ack_eliciting_sent_since_ack_eliciting >= MAX_DATA_KEEPALIVE_THRESHOLD
    }

    /// Builds the ACK frame content for this space, newest ranges first, and
    /// resets the bookkeeping an emitted ACK clears.
    pub fn build_and_clear(&mut self, now: Timestamp, ack_delay_exponent: u8) -> Option<BuiltAck> {
        if self.received.is_empty() {
            return None;
        }

        let ranges: Vec<AckRange> = self
            .received
            .ranges_descending()
            .map(|i| AckRange {
                smallest: VarInt::new(i.start).unwrap_or(VarInt::ZERO),
                largest: VarInt::new(i.end).unwrap_or(VarInt::ZERO),
            })
            .collect();

        self.last_ack_had_gaps = ranges.len() > 1;

        let largest_acknowledged = ranges[0].largest;
        let ack_delay_us = self
            .largest_received_time
            .map(|t| now.saturating_duration_since(t).as_micros() as u64)
            .unwrap_or(0);
        let ack_delay = VarInt::new(ack_delay_us >> ack_delay_exponent).unwrap_or(VarInt::ZERO);

        let ecn_counts = self.saw_ecn.then_some(EcnCounts {
            ect0: self.ecn_ect0_in,
            ect1: self.ecn_ect1_in,
            ce: self.ecn_ce_in,
        });

        self.ack_eliciting_since_last_ack = 0;
        self.queued = false;

        Some(BuiltAck {
            largest_acknowledged,
            ack_delay,
            ranges,
            ecn_counts,
        })
    }

    pub fn record_ack_processed(&mut self, largest_acknowledged: VarInt) -> Result<(), DuplicatedInfo> {
        if let Some(prev) = self.largest_ack_processed {
            if largest_acknowledged <= prev {
                return Err(DuplicatedInfo);
            }
        }
        self.largest_ack_processed = Some(largest_acknowledged);
        Ok(())
    }

    pub fn record_acked_by_peer(&mut self, pn: VarInt) {
        self.largest_acked_by_peer = Some(
            self.largest_acked_by_peer
                .map(|cur| cur.max(pn))
                .unwrap_or(pn),
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltAck {
    pub largest_acknowledged: VarInt,
    pub ack_delay: VarInt,
    pub ranges: Vec<AckRange>,
    pub ecn_counts: Option<EcnCounts>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicatedInfo;

/// The three packet number spaces a connection tracks, indexed by
/// `PacketNumberSpace`.
#[derive(Debug, Default)]
pub struct PacketSpaceManager {
    spaces: [PacketNumberSpaceState; 3],
    /// Once any Handshake-level packet has been sent, Initial keys are
    /// dropped and later Initial datagrams are discarded undecrypted.
    initial_dropped: bool,
}

impl PacketSpaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, space: PacketNumberSpace) -> &PacketNumberSpaceState {
        &self.spaces[space as usize]
    }

    pub fn get_mut(&mut self, space: PacketNumberSpace) -> &mut PacketNumberSpaceState {
        &mut self.spaces[space as usize]
    }

    pub fn is_initial_dropped(&self) -> bool {
        self.initial_dropped
    }

    pub fn drop_initial(&mut self) {
        self.initial_dropped = true;
        self.spaces[PacketNumberSpace::Initial as usize] = PacketNumberSpaceState::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    fn t(ms: u64) -> Timestamp {
        Timestamp::from_duration(Duration::from_millis(ms))
    }

    #[test]
    fn second_ack_eliciting_packet_queues_immediately() {
        let mut s = PacketNumberSpaceState::new();
        let sched = s.on_packet_received(1, t(0), true, false, false, false, DEFAULT_MAX_ACK_DELAY, Duration::from_millis(10));
        assert!(matches!(sched, AckSchedule::Delayed(_)));
        let sched = s.on_packet_received(2, t(1), true, false, false, false, DEFAULT_MAX_ACK_DELAY, Duration::from_millis(10));
        assert_eq!(sched, AckSchedule::Immediate);
    }

    #[test]
    fn gap_fill_triggers_immediate_ack() {
        let mut s = PacketNumberSpaceState::new();
        s.on_packet_received(0, t(0), true, false, false, false, DEFAULT_MAX_ACK_DELAY, Duration::from_millis(10));
        s.on_packet_received(2, t(1), true, false, false, false, DEFAULT_MAX_ACK_DELAY, Duration::from_millis(10));
        // now pn=1 fills the gap between 0 and 2
        let sched = s.on_packet_received(1, t(2), true, false, false, false, DEFAULT_MAX_ACK_DELAY, Duration::from_millis(10));
        assert_eq!(sched, AckSchedule::Immediate);
    }

    #[test]
    fn build_and_clear_resets_counters() {
        let mut s = PacketNumberSpaceState::new();
        s.on_packet_received(0, t(0), true, false, false, false, DEFAULT_MAX_ACK_DELAY, Duration::from_millis(10));
        let built = s.build_and_clear(t(5), 3).unwrap();
        assert_eq!(built.ranges.len(), 1);
        assert!(!s.is_ack_queued());
        assert!(!s.has_unacked_received_packets());
    }

    #[test]
    fn duplicate_ack_info_rejected() {
        let mut s = PacketNumberSpaceState::new();
        s.record_ack_processed(VarInt::from_u32(5)).unwrap();
        assert!(s.record_ack_processed(VarInt::from_u32(5)).is_err());
        assert!(s.record_ack_processed(VarInt::from_u32(4)).is_err());
        assert!(s.record_ack_processed(VarInt::from_u32(6)).is_ok());
    }
}
