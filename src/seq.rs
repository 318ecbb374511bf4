use std::fmt::{Display, Formatter};
use std::ops::Add;

/// A 16-bit packet sequence number with serial-number (wrap-around) semantics.
///
/// Half of the sequence space is "before" and half is "after" any given value,
/// so ordering stays meaningful across the wrap from `0xFFFF` to `0`. All
/// sequence comparisons in the protocol go through [`SeqNr::precedes`] and
/// [`SeqNr::in_window`] - comparing raw `u16` values breaks at the wrap point.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SeqNr(u16);

impl Display for SeqNr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNr {
    pub const ZERO: SeqNr = SeqNr(0);

    const HALF_SPACE: u16 = 1 << 15;

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> SeqNr {
        SeqNr(self.0.wrapping_add(1))
    }

    /// `self` precedes `other` iff `(other - self) mod 2^16` lies in `[1, 2^15)`.
    pub fn precedes(&self, other: SeqNr) -> bool {
        let diff = other.0.wrapping_sub(self.0);
        diff != 0 && diff < Self::HALF_SPACE
    }

    /// `self` lies in the window `[base, base+width)` under modular arithmetic.
    ///
    /// Window widths must stay below half the sequence space (`2^15`) for this
    /// to be unambiguous - the config layer enforces that bound.
    pub fn in_window(&self, base: SeqNr, width: u16) -> bool {
        self.0.wrapping_sub(base.0) < width
    }

    /// Modular distance from `base` up to `self`, in `[0, 2^16)`.
    pub fn distance_from(&self, base: SeqNr) -> u16 {
        self.0.wrapping_sub(base.0)
    }
}

impl Add<u16> for SeqNr {
    type Output = SeqNr;

    fn add(self, rhs: u16) -> SeqNr {
        SeqNr(self.0.wrapping_add(rhs))
    }
}
