//! Wrapping sequence numbers.
//!
//! Sequence numbers are 32-bit and wrap from `u32::MAX` back to 0. Order
//! between two numbers is decided by their forward modular distance, so
//! `u32::MAX` precedes `0` in the same way `4` precedes `5`.

use std::cmp::Ordering;
use std::fmt;

/// Half of the sequence space. Two numbers further apart than this are
/// treated as lying on opposite sides of the wrap point.
pub const SEQ_HALF_RANGE: u32 = 0x8000_0000;

/// A wrapping packet sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seq(u32);

impl Seq {
    pub const ZERO: Seq = Seq(0);
    pub const MAX: Seq = Seq(u32::MAX);

    pub const fn new(value: u32) -> Self {
        Seq(value)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the following sequence number, wrapping at `u32::MAX`.
    pub const fn next(self) -> Seq {
        Seq(self.0.wrapping_add(1))
    }

    /// Forward distance from `self` to `other`.
    pub const fn distance_to(self, other: Seq) -> u32 {
        other.0.wrapping_sub(self.0)
    }

    /// Returns true if `self` comes strictly before `other`.
    pub const fn precedes(self, other: Seq) -> bool {
        let diff = self.distance_to(other);
        diff != 0 && diff < SEQ_HALF_RANGE
    }

    /// Orders two sequence numbers by modular distance.
    pub fn cmp_wrapping(self, other: Seq) -> Ordering {
        if self == other {
            Ordering::Equal
        } else if self.precedes(other) {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Seq {
    fn from(value: u32) -> Self {
        Seq(value)
    }
}

impl From<Seq> for u32 {
    fn from(seq: Seq) -> Self {
        seq.0
    }
}

/// Hands out consecutive sequence numbers.
#[derive(Debug, Default)]
pub struct SeqAllocator {
    next: Seq,
}

impl SeqAllocator {
    pub const fn new() -> Self {
        Self::starting_at(Seq::ZERO)
    }

    pub const fn starting_at(start: Seq) -> Self {
        Self { next: start }
    }

    /// The number the next call to `allocate` returns.
    pub const fn peek(&self) -> Seq {
        self.next
    }

    pub fn allocate(&mut self) -> Seq {
        let seq = self.next;
        self.next = seq.next();
        seq
    }

    pub fn reset(&mut self) {
        self.next = Seq::ZERO;
    }
}
