//! Emulated time, counted in VDP cycles
//!
//! Everything in the emulation core is sequenced against a single logical timeline. `EmuTime` is
//! a point on that timeline; components that are advanced lazily compare the time of an external
//! request against their own bookkeeping time and catch up before servicing it.

use bincode::{Decode, Encode};
use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Encode, Decode)]
pub struct EmuTime(u64);

impl EmuTime {
    pub const ZERO: Self = Self(0);

    /// Sentinel for "never": later than every reachable point on the timeline.
    pub const INFINITY: Self = Self(u64::MAX);

    #[must_use]
    pub const fn from_ticks(ticks: u64) -> Self {
        Self(ticks)
    }

    #[must_use]
    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// Cycles from `earlier` to `self`; 0 if `earlier` is not actually earlier.
    #[must_use]
    pub const fn ticks_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<u64> for EmuTime {
    type Output = Self;

    fn add(self, ticks: u64) -> Self {
        Self(self.0.saturating_add(ticks))
    }
}

impl AddAssign<u64> for EmuTime {
    fn add_assign(&mut self, ticks: u64) {
        *self = *self + ticks;
    }
}

impl Display for EmuTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if *self == Self::INFINITY { write!(f, "inf") } else { write!(f, "{}", self.0) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_and_arithmetic() {
        let t = EmuTime::from_ticks(100);
        assert!(t > EmuTime::ZERO);
        assert!(t < EmuTime::INFINITY);
        assert_eq!(t + 28, EmuTime::from_ticks(128));
        assert_eq!((t + 28).ticks_since(t), 28);
        assert_eq!(t.ticks_since(t + 28), 0);
    }

    #[test]
    fn infinity_saturates() {
        assert_eq!(EmuTime::INFINITY + 1, EmuTime::INFINITY);
    }
}
