//! 16-bit sequence-number arithmetic.
//!
//! Sequence numbers live on a ring of [`SEQUENCE_SPACE`] values.  Ordering
//! questions are answered relative to an *expected* value: anything within
//! the half of the ring ahead of it counts as "newer", everything else as
//! old.
//!
//! ```text
//!            expected            expected + HALF_SPACE
//!               │◀──────── newer ────────▶│◀──────── old ────────▶│
//!   ────────────┼─────────────────────────┼───────────────────────┼──── (mod 65536)
//! ```

/// Number of distinct sequence values.
pub const SEQUENCE_SPACE: u32 = 1 << 16;

/// Width of the "newer than" window.
pub const HALF_SPACE: u32 = SEQUENCE_SPACE / 2;

/// The sequence following `seq`, wrapping at 65536.
#[inline]
pub fn next(seq: u16) -> u16 {
    seq.wrapping_add(1)
}

/// Whether `seq` is at or ahead of `expected` by less than half the ring.
///
/// `seq` is shifted into the domain `>= expected` (adding 65536 when it is
/// numerically smaller) and must then fall in `[expected, expected + 32768)`.
/// `seq == expected` counts as newer.
pub fn newer_than_expected(expected: u16, seq: u16) -> bool {
    let expected = u32::from(expected);
    let mut seq = u32::from(seq);
    if seq < expected {
        seq += SEQUENCE_SPACE;
    }
    seq < expected + HALF_SPACE
}

/// Forward distance from `from` to `to` around the ring.
#[inline]
pub fn distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}
