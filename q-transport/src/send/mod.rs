// SPDX-License-Identifier: Apache-2.0

//! The boundary between the connection's tick loop and congestion control /
//! loss recovery / pacing. Those algorithms (e.g. an RFC 9002 NewReno or a
//! BBR variant) are supplied by an embedder through the `SendController`
//! trait; this module only defines the contract (§4.4) and a minimal
//! reference implementation usable in tests.

use crate::packet::Packet;
use q_quic_core::{packet::number::PacketNumberSpace, time::Timestamp, varint::VarInt};
use std::collections::VecDeque;

/// Why `new_packet` could not hand back a fresh packet to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocked {
    CongestionWindow,
    Pacer,
}

/// One range of packet numbers a peer's ACK frame covered, plus the time we
/// processed it, as handed to `on_ack` for RTT sampling and loss detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckedRange {
    pub smallest: VarInt,
    pub largest: VarInt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The acknowledged range didn't cover any packet we're tracking.
    Unknown,
    Acked,
}

/// The interface a connection's tick loop depends on to assemble outbound
/// packets, decide whether it may send, and learn what happened to
/// previously sent packets. Congestion control, pacing and loss detection
/// all live behind this trait; the state machine here only calls it (§4.4).
pub trait SendController {
    /// Starts a new packet in `space`, unless congestion control or the
    /// pacer currently forbid sending at least `min_size` bytes.
    fn new_packet(&mut self, space: PacketNumberSpace, min_size: usize) -> Result<Packet, Blocked>;

    /// Queues an assembled packet for transmission without yet marking it
    /// sent; used for packets built ahead of the pacer's next release.
    fn schedule(&mut self, packet: Packet);

    /// The highest packet number scheduled (not necessarily sent) so far in
    /// `space`, used to decide whether stale scheduled packets should be
    /// renumbered after a pacer stall (tick step 6a).
    fn last_scheduled(&self, space: PacketNumberSpace) -> Option<VarInt>;

    /// Pops the next packet ready to actually go out, in priority order.
    fn next_to_send(&mut self) -> Option<Packet>;

    /// Called once a packet has actually been placed on the wire.
    fn on_sent(&mut self, packet: &Packet, sent_time: Timestamp, size: usize, in_flight: bool);

    /// Applies a peer ACK range covering `[smallest, largest]` in `space`,
    /// received at `received_time`, to loss detection and RTT estimation.
    fn on_ack(&mut self, range: AckedRange, received_time: Timestamp, space: PacketNumberSpace) -> AckOutcome;

    /// Asks loss detection for packets it now considers lost and wants
    /// rescheduled; their regeneratable frames (ACK, MAX_DATA) are dropped
    /// by the caller and the rest requeued verbatim.
    fn on_loss(&mut self, now: Timestamp) -> Vec<Packet>;

    /// Whether the congestion window currently permits sending anything at
    /// all.
    fn can_send(&self) -> bool;

    /// When the pacer will next release a packet, for `next_tick_time`
    /// scheduling.
    fn pacer_ready_at(&self) -> Option<Timestamp>;

    /// Whether previously scheduled-but-unsent packets should be squeezed
    /// (coalesced/dropped) because the pacer fell far behind.
    fn squeeze_scheduled(&self) -> bool;

    /// Moves a freshly built ACK-bearing packet to the front of the send
    /// queue, ahead of anything already scheduled (tick step 6a).
    fn ack_to_front(&mut self, packet: Packet);

    fn bytes_in_flight(&self) -> u64;

    fn smoothed_rtt(&self) -> core::time::Duration;
}

/// A fixed-window reference controller with no actual congestion response
/// or real loss detection, useful for exercising the connection state
/// machine without pulling in a real congestion-control crate. Loss is
/// approximated as a simple fixed multiple of `smoothed_rtt` elapsing since
/// a packet was sent (a crude stand-in for a proper PTO), and `on_loss`
/// requeues expired packets oldest-first.
#[derive(Debug)]
pub struct FixedWindowController {
    window: u64,
    in_flight_bytes: u64,
    in_flight: Vec<(PacketNumberSpace, VarInt, Timestamp, usize, Packet)>,
    scheduled: VecDeque<Packet>,
    last_scheduled: [Option<VarInt>; 3],
    smoothed_rtt: core::time::Duration,
}

/// How long a packet may sit unacknowledged before `on_loss` requeues it.
const LOSS_THRESHOLD_RTT_MULTIPLE: u32 = 3;

impl FixedWindowController {
    pub fn new(window: u64) -> Self {
        Self {
            window,
            in_flight_bytes: 0,
            in_flight: Vec::new(),
            scheduled: VecDeque::new(),
            last_scheduled: [None, None, None],
            smoothed_rtt: core::time::Duration::from_millis(100),
        }
    }

    fn space_index(space: PacketNumberSpace) -> usize {
        match space {
            PacketNumberSpace::Initial => 0,
            PacketNumberSpace::Handshake => 1,
            PacketNumberSpace::ApplicationData => 2,
        }
    }
}

impl SendController for FixedWindowController {
    fn new_packet(&mut self, space: PacketNumberSpace, min_size: usize) -> Result<Packet, Blocked> {
        if self.in_flight_bytes + min_size as u64 > self.window {
            return Err(Blocked::CongestionWindow);
        }
        let idx = Self::space_index(space);
        let next = self.last_scheduled[idx]
            .map(|pn| VarInt::new(pn.as_u64() + 1).unwrap_or(VarInt::MAX))
            .unwrap_or(VarInt::ZERO);
        self.last_scheduled[idx] = Some(next);
        Ok(Packet::new(space, next))
    }

    fn schedule(&mut self, packet: Packet) {
        self.scheduled.push_back(packet);
    }

    fn last_scheduled(&self, space: PacketNumberSpace) -> Option<VarInt> {
        self.last_scheduled[Self::space_index(space)]
    }

    fn next_to_send(&mut self) -> Option<Packet> {
        self.scheduled.pop_front()
    }

    fn on_sent(&mut self, packet: &Packet, sent_time: Timestamp, size: usize, in_flight: bool) {
        if in_flight {
            self.in_flight_bytes += size as u64;
            self.in_flight.push((packet.space, packet.number, sent_time, size, packet.clone()));
        }
    }

    fn on_ack(&mut self, range: AckedRange, received_time: Timestamp, space: PacketNumberSpace) -> AckOutcome {
        let _ = received_time;
        let before = self.in_flight.len();
        self.in_flight.retain(|(s, pn, _, size, _)| {
            let covered = *s == space && *pn >= range.smallest && *pn <= range.largest;
            if covered {
                self.in_flight_bytes = self.in_flight_bytes.saturating_sub(*size as u64);
            }
            !covered
        });
        if self.in_flight.len() == before {
            AckOutcome::Unknown
        } else {
            AckOutcome::Acked
        }
    }

    /// Requeues, oldest-first, every in-flight packet that has sat
    /// unacknowledged for longer than a fixed multiple of `smoothed_rtt`.
    fn on_loss(&mut self, now: Timestamp) -> Vec<Packet> {
        let threshold = self.smoothed_rtt * LOSS_THRESHOLD_RTT_MULTIPLE;
        let mut lost = Vec::new();
        let mut freed_bytes = 0u64;
        self.in_flight.retain(|(_, _, sent_time, size, packet)| {
            let expired = now.saturating_duration_since(*sent_time) > threshold;
            if expired {
                freed_bytes += *size as u64;
                lost.push(packet.clone());
            }
            !expired
        });
        self.in_flight_bytes = self.in_flight_bytes.saturating_sub(freed_bytes);
        lost
    }

    fn can_send(&self) -> bool {
        self.in_flight_bytes < self.window
    }

    fn pacer_ready_at(&self) -> Option<Timestamp> {
        None
    }

    fn squeeze_scheduled(&self) -> bool {
        false
    }

    fn ack_to_front(&mut self, packet: Packet) {
        self.scheduled.push_front(packet);
    }

    fn bytes_in_flight(&self) -> u64 {
        self.in_flight_bytes
    }

    fn smoothed_rtt(&self) -> core::time::Duration {
        self.smoothed_rtt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::OutboundFrame;
    use core::time::Duration;

    #[test]
    fn new_packet_assigns_increasing_numbers_per_space() {
        let mut ctrl = FixedWindowController::new(1_000);
        let p0 = ctrl.new_packet(PacketNumberSpace::ApplicationData, 10).unwrap();
        let p1 = ctrl.new_packet(PacketNumberSpace::ApplicationData, 10).unwrap();
        assert_eq!(p0.number, VarInt::ZERO);
        assert_eq!(p1.number, VarInt::from_u32(1));
    }

    #[test]
    fn congestion_window_blocks_new_packets() {
        let mut ctrl = FixedWindowController::new(100);
        let p = ctrl.new_packet(PacketNumberSpace::ApplicationData, 10).unwrap();
        ctrl.on_sent(&p, Timestamp::from_duration(Duration::from_secs(0)), 90, true);
        assert_eq!(
            ctrl.new_packet(PacketNumberSpace::ApplicationData, 20),
            Err(Blocked::CongestionWindow)
        );
    }

    #[test]
    fn acking_a_range_frees_its_bytes() {
        let mut ctrl = FixedWindowController::new(1_000);
        let p = ctrl.new_packet(PacketNumberSpace::ApplicationData, 10).unwrap();
        let pn = p.number;
        ctrl.on_sent(&p, Timestamp::from_duration(Duration::from_secs(0)), 60, true);
        let outcome = ctrl.on_ack(
            AckedRange { smallest: pn, largest: pn },
            Timestamp::from_duration(Duration::from_secs(1)),
            PacketNumberSpace::ApplicationData,
        );
        assert_eq!(outcome, AckOutcome::Acked);
        assert_eq!(ctrl.bytes_in_flight(), 0);
    }

    #[test]
    fn on_loss_requeues_packets_that_sat_unacked_past_the_threshold() {
        let mut ctrl = FixedWindowController::new(1_000);
        let mut p = ctrl.new_packet(PacketNumberSpace::ApplicationData, 0).unwrap();
        p.push(OutboundFrame::Ping);
        let pn = p.number;
        ctrl.on_sent(&p, Timestamp::from_duration(Duration::from_secs(0)), 30, true);

        // Still well within the loss threshold: nothing to requeue yet.
        let still_fresh = ctrl.on_loss(Timestamp::from_duration(Duration::from_millis(50)));
        assert!(still_fresh.is_empty());
        assert_eq!(ctrl.bytes_in_flight(), 30);

        let expired = ctrl.on_loss(Timestamp::from_duration(Duration::from_secs(10)));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].number, pn);
        assert_eq!(ctrl.bytes_in_flight(), 0);

        // Already requeued: a later call finds nothing left in flight.
        assert!(ctrl.on_loss(Timestamp::from_duration(Duration::from_secs(20))).is_empty());
    }

    #[test]
    fn scheduling_and_draining_preserves_order() {
        let mut ctrl = FixedWindowController::new(1_000);
        let a = ctrl.new_packet(PacketNumberSpace::ApplicationData, 0).unwrap();
        let b = ctrl.new_packet(PacketNumberSpace::ApplicationData, 0).unwrap();
        let (a_pn, b_pn) = (a.number, b.number);
        ctrl.schedule(a);
        ctrl.schedule(b);
        assert_eq!(ctrl.next_to_send().unwrap().number, a_pn);
        assert_eq!(ctrl.next_to_send().unwrap().number, b_pn);
    }
}
