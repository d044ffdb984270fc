// SPDX-License-Identifier: Apache-2.0

//! The connection's named timers: idle, handshake, an ACK-delay alarm per
//! packet number space, and the keepalive PING alarm.
//! Rather than a literal priority queue, each timer tracks its own
//! expiration and the set reports the soonest one so the embedder can learn
//! `next_tick_time()` cheaply.

use q_quic_core::{packet::number::PacketNumberSpace, time::Timestamp};

/// A single named timer. Does not implement `Copy` so an expiration is never
/// silently dropped by a stray move.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Timer {
    expiration: Option<Timestamp>,
}

impl Timer {
    #[inline]
    pub fn set(&mut self, time: Timestamp) {
        self.expiration = Some(time);
    }

    #[inline]
    pub fn cancel(&mut self) {
        self.expiration = None;
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.expiration.is_some()
    }

    #[inline]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.expiration, Some(t) if t <= now)
    }

    /// If expired, cancels the timer and returns `true`.
    #[inline]
    pub fn poll_expiration(&mut self, now: Timestamp) -> bool {
        if self.is_expired(now) {
            self.cancel();
            true
        } else {
            false
        }
    }

    pub fn expiration(&self) -> Option<Timestamp> {
        self.expiration
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlarmId {
    Idle,
    Handshake,
    Ack(PacketNumberSpace),
    Ping,
}

/// The connection's complete set of named alarms.
#[derive(Clone, Debug, Default)]
pub struct AlarmSet {
    pub idle: Timer,
    pub handshake: Timer,
    pub ack: [Timer; 3],
    pub ping: Timer,
}

impl AlarmSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn ack_mut(&mut self, space: PacketNumberSpace) -> &mut Timer {
        &mut self.ack[space as usize]
    }

    pub fn ack(&self, space: PacketNumberSpace) -> &Timer {
        &self.ack[space as usize]
    }

    pub fn set_ack(&mut self, space: PacketNumberSpace, time: Timestamp) {
        self.ack_mut(space).set(time);
    }

    pub fn cancel_ack(&mut self, space: PacketNumberSpace) {
        self.ack_mut(space).cancel();
    }

    /// Fires every alarm due at `now`, in idle/handshake/ack/ping order,
    /// invoking `on_fire` for each one that expired.
    pub fn poll_expirations(&mut self, now: Timestamp, mut on_fire: impl FnMut(AlarmId)) {
        if self.idle.poll_expiration(now) {
            on_fire(AlarmId::Idle);
        }
        if self.handshake.poll_expiration(now) {
            on_fire(AlarmId::Handshake);
        }
        for space in PacketNumberSpace::ALL {
            if self.ack_mut(space).poll_expiration(now) {
                on_fire(AlarmId::Ack(space));
            }
        }
        if self.ping.poll_expiration(now) {
            on_fire(AlarmId::Ping);
        }
    }

    /// The soonest armed expiration across every alarm, i.e. what the
    /// embedder should sleep until next.
    pub fn next_expiration(&self) -> Option<Timestamp> {
        [
            self.idle.expiration(),
            self.handshake.expiration(),
            self.ack[0].expiration(),
            self.ack[1].expiration(),
            self.ack[2].expiration(),
            self.ping.expiration(),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    fn t(secs: u64) -> Timestamp {
        Timestamp::from_duration(Duration::from_secs(secs))
    }

    #[test]
    fn next_expiration_picks_soonest_armed_alarm() {
        let mut alarms = AlarmSet::new();
        alarms.idle.set(t(30));
        alarms.set_ack(PacketNumberSpace::Initial, t(5));
        assert_eq!(alarms.next_expiration(), Some(t(5)));
    }

    #[test]
    fn poll_expirations_only_fires_due_alarms() {
        let mut alarms = AlarmSet::new();
        alarms.idle.set(t(10));
        alarms.ping.set(t(20));
        let mut fired = vec![];
        alarms.poll_expirations(t(10), |id| fired.push(id));
        assert_eq!(fired, vec![AlarmId::Idle]);
        assert!(!alarms.idle.is_armed());
        assert!(alarms.ping.is_armed());
    }
}
