use std::fmt::{Display, Formatter};

/// A 32-bit sequence number that wraps around. Sequence numbers are compared by their signed
///  distance, so that ordering is correct as long as the compared numbers are less than 2^31
///  apart. There is deliberately no `Ord` implementation: sorting sequence numbers by their
///  raw value is wrong around the wrap.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct Seq(u32);

impl Seq {
    pub const ZERO: Seq = Seq(0);

    pub const fn from_raw(raw: u32) -> Seq {
        Seq(raw)
    }

    pub const fn to_raw(&self) -> u32 {
        self.0
    }

    /// signed distance from `other` to `self`
    pub fn diff(&self, other: Seq) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    pub fn is_after(&self, other: Seq) -> bool {
        self.diff(other) > 0
    }

    pub fn is_before(&self, other: Seq) -> bool {
        self.diff(other) < 0
    }

    pub fn next(&self) -> Seq {
        Seq(self.0.wrapping_add(1))
    }

    pub fn prev(&self) -> Seq {
        Seq(self.0.wrapping_sub(1))
    }

    /// the later of two sequence numbers
    pub fn max(self, other: Seq) -> Seq {
        if other.is_after(self) { other } else { self }
    }

    /// the earlier of two sequence numbers
    pub fn min(self, other: Seq) -> Seq {
        if other.is_before(self) { other } else { self }
    }

    /// `first <= self <= last` in sequence order
    pub fn is_in(&self, first: Seq, last: Seq) -> bool {
        !self.is_before(first) && !self.is_after(last)
    }
}

impl Display for Seq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::equal(5, 5, 0)]
    #[case::simple(7, 5, 2)]
    #[case::simple_negative(5, 7, -2)]
    #[case::across_zero(1, 0xffff_ffff, 2)]
    #[case::across_zero_negative(0xffff_ffff, 1, -2)]
    #[case::half_range_below(0x7fff_ffff, 0, 0x7fff_ffff)]
    #[case::half_range(0x8000_0000, 0, i32::MIN)]
    #[case::across_half(0x8000_0001, 0x7fff_ffff, 2)]
    fn test_diff(#[case] a: u32, #[case] b: u32, #[case] expected: i32) {
        assert_eq!(Seq::from_raw(a).diff(Seq::from_raw(b)), expected);
    }

    #[rstest]
    #[case::natural(2, 1, true)]
    #[case::natural_not(1, 2, false)]
    #[case::equal(1, 1, false)]
    #[case::wrap(0, 0xffff_ffff, true)]
    #[case::wrap_not(0xffff_ffff, 0, false)]
    #[case::wrap_far(0x10, 0xffff_fff0, true)]
    #[case::around_half(0x8000_0000, 0x7fff_ffff, true)]
    #[case::beyond_half(0x8000_0001, 0, false)]
    fn test_is_after(#[case] a: u32, #[case] b: u32, #[case] expected: bool) {
        let a = Seq::from_raw(a);
        let b = Seq::from_raw(b);
        assert_eq!(a.is_after(b), expected);
        assert_eq!(b.is_before(a), expected);
    }

    #[rstest]
    #[case::simple(5, 6)]
    #[case::wrap(0xffff_ffff, 0)]
    fn test_next_prev(#[case] a: u32, #[case] next: u32) {
        assert_eq!(Seq::from_raw(a).next(), Seq::from_raw(next));
        assert_eq!(Seq::from_raw(next).prev(), Seq::from_raw(a));
    }

    #[rstest]
    #[case::inside(5, 4, 6, true)]
    #[case::lower_bound(4, 4, 6, true)]
    #[case::upper_bound(6, 4, 6, true)]
    #[case::below(3, 4, 6, false)]
    #[case::above(7, 4, 6, false)]
    #[case::wrapping_range(0, 0xffff_fffe, 2, true)]
    fn test_is_in(#[case] s: u32, #[case] first: u32, #[case] last: u32, #[case] expected: bool) {
        assert_eq!(Seq::from_raw(s).is_in(Seq::from_raw(first), Seq::from_raw(last)), expected);
    }

    #[test]
    fn test_max_min_across_wrap() {
        let a = Seq::from_raw(0xffff_fff0);
        let b = Seq::from_raw(3);
        assert_eq!(a.max(b), b);
        assert_eq!(b.max(a), b);
        assert_eq!(a.min(b), a);
    }
}
