// SPDX-License-Identifier: Apache-2.0

//! Send/receive credit windows, connection- and stream-level. Per RFC 9000
//! §4, a stream's send offset is bounded by both its own `MAX_STREAM_DATA`
//! and the connection's `MAX_DATA`.

use q_quic_core::varint::VarInt;

/// One direction (send or receive) of a flow-control window: a limit the
/// peer has granted and the amount consumed against it so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Window {
    consumed: VarInt,
    max: VarInt,
}

impl Window {
    pub fn new(initial_max: VarInt) -> Self {
        Self {
            consumed: VarInt::ZERO,
            max: initial_max,
        }
    }

    pub fn consumed(&self) -> VarInt {
        self.consumed
    }

    pub fn max(&self) -> VarInt {
        self.max
    }

    pub fn available(&self) -> VarInt {
        self.max.saturating_sub(self.consumed)
    }

    pub fn is_blocked(&self) -> bool {
        self.available() == VarInt::ZERO
    }

    /// Advances the consumed offset, rejecting anything that would cross
    /// `max`.
    pub fn consume_to(&mut self, new_offset: VarInt) -> Result<(), FlowControlViolation> {
        if new_offset > self.max {
            return Err(FlowControlViolation);
        }
        if new_offset > self.consumed {
            self.consumed = new_offset;
        }
        Ok(())
    }

    /// Raises `max` if `new_max` is strictly greater; non-increasing updates
    /// are ignored, since MAX_DATA/MAX_STREAM_DATA frames may arrive out of
    /// order.
    pub fn set_max(&mut self, new_max: VarInt) -> bool {
        if new_max > self.max {
            self.max = new_max;
            true
        } else {
            false
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlowControlViolation;

/// A receive-side window that additionally tracks how much the application
/// has read, so it can decide when to advance the window once more than
/// half of it has been consumed and read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReceiveWindow {
    pub window: Window,
    read: VarInt,
    initial_window: VarInt,
}

impl ReceiveWindow {
    pub fn new(initial_window: VarInt) -> Self {
        Self {
            window: Window::new(initial_window),
            read: VarInt::ZERO,
            initial_window,
        }
    }

    pub fn max(&self) -> VarInt {
        self.window.max()
    }

    pub fn on_bytes_received(&mut self, new_offset: VarInt) -> Result<(), FlowControlViolation> {
        self.window.consume_to(new_offset)
    }

    pub fn on_bytes_read(&mut self, read_offset: VarInt) {
        if read_offset > self.read {
            self.read = read_offset;
        }
    }

    /// `true` once more than half the granted window has been consumed by
    /// the peer and read by the application; the caller should then advance
    /// the window and emit a MAX_DATA / MAX_STREAM_DATA frame.
    pub fn should_advance_window(&self) -> bool {
        let outstanding = self.window.max().saturating_sub(self.read);
        outstanding.as_u64() * 2 <= self.window.max().as_u64()
    }

    /// Advances `max` by the initial window size and returns the new limit,
    /// or `None` if the window wasn't due for advancement.
    pub fn advance_window(&mut self) -> Option<VarInt> {
        if !self.should_advance_window() {
            return None;
        }
        let new_max = self.window.max().saturating_add(self.initial_window);
        self.window.set_max(new_max);
        Some(new_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_past_max_is_rejected() {
        let mut w = Window::new(VarInt::from_u32(100));
        assert!(w.consume_to(VarInt::from_u32(100)).is_ok());
        assert!(w.consume_to(VarInt::from_u32(101)).is_err());
    }

    #[test]
    fn set_max_ignores_non_increasing_updates() {
        let mut w = Window::new(VarInt::from_u32(100));
        assert!(!w.set_max(VarInt::from_u32(50)));
        assert!(w.set_max(VarInt::from_u32(200)));
        assert_eq!(w.max(), VarInt::from_u32(200));
    }

    #[test]
    fn window_advances_past_halfway_point() {
        let mut recv = ReceiveWindow::new(VarInt::from_u32(100));
        recv.on_bytes_read(VarInt::from_u32(49));
        assert!(!recv.should_advance_window());
        recv.on_bytes_read(VarInt::from_u32(50));
        assert!(recv.should_advance_window());
        let new_max = recv.advance_window().unwrap();
        assert_eq!(new_max, VarInt::from_u32(200));
    }
}
