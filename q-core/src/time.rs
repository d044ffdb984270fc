// SPDX-License-Identifier: Apache-2.0

//! An opaque point in time, sourced from whatever clock the embedder feeds
//! into `tick()`. Values are only meaningful relative to other `Timestamp`s
//! from the same clock.

use core::{fmt, ops::Add, time::Duration};

#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash, Default)]
pub struct Timestamp(Duration);

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Timestamp({:?})", self.0)
    }
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    pub fn from_duration(d: Duration) -> Self {
        Self(d)
    }

    pub fn as_duration(self) -> Duration {
        self.0
    }

    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }

    pub fn checked_add(self, d: Duration) -> Option<Timestamp> {
        self.0.checked_add(d).map(Timestamp)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0 + rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_duration() {
        let a = Timestamp::from_duration(Duration::from_secs(1));
        let b = Timestamp::from_duration(Duration::from_secs(2));
        assert!(a < b);
        assert_eq!(b.saturating_duration_since(a), Duration::from_secs(1));
    }
}
