//! Virtual time for the optimistic simulation kernel.
//!
//! A logical timestamp with no dependency on `std::time`. Every event
//! carries two of these (send and receive time), GVT is one, and the
//! simulation ceiling is one. `INFINITY` is the sentinel a node reports
//! when it has nothing pending.

/// A logical tick in simulation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct VirtualTime(u64);

impl VirtualTime {
    /// The zero-point of simulation time.
    pub const ZERO: VirtualTime = VirtualTime(0);

    /// Sentinel for "no pending work"; compares greater than every real time.
    pub const INFINITY: VirtualTime = VirtualTime(u64::MAX);

    /// Create a new `VirtualTime` from a raw tick value.
    #[inline]
    pub const fn new(ticks: u64) -> Self {
        VirtualTime(ticks)
    }

    /// Return the raw tick value.
    #[inline]
    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// Advance time by `delta` ticks.
    /// Returns `None` on overflow or when the result would hit the sentinel.
    #[inline]
    pub fn advance(self, delta: u64) -> Option<VirtualTime> {
        self.0
            .checked_add(delta)
            .filter(|t| *t != u64::MAX)
            .map(VirtualTime)
    }

    /// Compute the absolute time that is `delay` ticks after `self`.
    /// Alias for `advance`; reads better at call-sites that send events.
    #[inline]
    pub fn plus(self, delay: u64) -> Option<VirtualTime> {
        self.advance(delay)
    }

    /// Returns `true` if `self` is strictly before `other`.
    #[inline]
    pub fn is_before(self, other: VirtualTime) -> bool {
        self.0 < other.0
    }

    /// Returns `true` for the `INFINITY` sentinel.
    #[inline]
    pub fn is_infinite(self) -> bool {
        self.0 == u64::MAX
    }

    /// Returns the duration (in ticks) between two points in time.
    /// Returns `None` if `other` is after `self`.
    #[inline]
    pub fn duration_since(self, other: VirtualTime) -> Option<u64> {
        self.0.checked_sub(other.0)
    }
}

impl std::fmt::Display for VirtualTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_infinite() {
            write!(f, "T=inf")
        } else {
            write!(f, "T={}", self.0)
        }
    }
}
