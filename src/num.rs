//! Numeric domains over which bitvector bounds are computed.
//!
//! Bounds are totally ordered weights closed under addition and subtraction.
//! The usual instantiation is a signed machine integer, which additionally
//! supports tightening bounds against individual bits. Rational weights are
//! supported for hosts that attach non-integral semantics to bit patterns;
//! they propagate and explain like integers but opt out of bit-level
//! refinement through [`Weight::BIT_REFINEMENT`].

use num_integer::Integer;
use num_rational::Ratio;

pub trait Weight:
    Copy
    + Eq
    + Ord
    + std::fmt::Debug
    + std::fmt::Display
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::AddAssign
    + std::ops::SubAssign
    + 'static
{
    const ZERO: Self;

    /// Largest bitvector width for which `max_value` does not overflow.
    const MAX_WIDTH: u32;

    /// Whether bounds may be tightened against the values of individual bits.
    ///
    /// When false, [`Weight::test_bit`] and [`Weight::with_bit`] must not be
    /// called.
    const BIT_REFINEMENT: bool;

    /// The weight of bit `i`, i.e. `2^i`.
    fn bit(i: u32) -> Self;

    /// The largest value representable on `width` bits, i.e. `2^width - 1`.
    fn max_value(width: u32) -> Self;

    /// Whether bit `i` is set in the binary representation of this value.
    fn test_bit(self, i: u32) -> bool;

    /// This value with bit `i` set.
    fn with_bit(self, i: u32) -> Self;

    /// Largest weight `<= self / 2`.
    fn half_floor(self) -> Self;

    /// Smallest weight `>= self / 2`.
    fn half_ceil(self) -> Self;

    /// Largest value a bitvector can take that is strictly below `self`.
    ///
    /// Bitvector values are integral regardless of the weight type, so a
    /// non-integral threshold rounds down instead of stepping by one.
    fn pred(self) -> Self;

    /// Smallest value a bitvector can take that is strictly above `self`.
    fn succ(self) -> Self;
}

macro_rules! int_weight {
    ($t:ty, $max_width:expr) => {
        impl Weight for $t {
            const ZERO: Self = 0;
            const MAX_WIDTH: u32 = $max_width;
            const BIT_REFINEMENT: bool = true;

            fn bit(i: u32) -> Self {
                1 << i
            }

            fn max_value(width: u32) -> Self {
                debug_assert!(width <= Self::MAX_WIDTH);
                (1 << width) - 1
            }

            fn test_bit(self, i: u32) -> bool {
                self & (1 << i) != 0
            }

            fn with_bit(self, i: u32) -> Self {
                self | (1 << i)
            }

            fn half_floor(self) -> Self {
                Integer::div_floor(&self, &2)
            }

            fn half_ceil(self) -> Self {
                Integer::div_ceil(&self, &2)
            }

            fn pred(self) -> Self {
                self - 1
            }

            fn succ(self) -> Self {
                self + 1
            }
        }
    };
}

int_weight!(i64, 62);
int_weight!(i128, 126);

impl Weight for Ratio<i64> {
    const ZERO: Self = Ratio::new_raw(0, 1);
    const MAX_WIDTH: u32 = 62;
    const BIT_REFINEMENT: bool = false;

    fn bit(i: u32) -> Self {
        Ratio::from_integer(1i64 << i)
    }

    fn max_value(width: u32) -> Self {
        debug_assert!(width <= Self::MAX_WIDTH);
        Ratio::from_integer((1i64 << width) - 1)
    }

    fn test_bit(self, _i: u32) -> bool {
        unreachable!("bit-level refinement is disabled for rational weights")
    }

    fn with_bit(self, _i: u32) -> Self {
        unreachable!("bit-level refinement is disabled for rational weights")
    }

    // Rational halving is exact, floor and ceiling coincide.
    fn half_floor(self) -> Self {
        self / Ratio::from_integer(2)
    }

    fn half_ceil(self) -> Self {
        self / Ratio::from_integer(2)
    }

    fn pred(self) -> Self {
        if self.is_integer() {
            self - Ratio::from_integer(1)
        } else {
            self.floor()
        }
    }

    fn succ(self) -> Self {
        if self.is_integer() {
            self + Ratio::from_integer(1)
        } else {
            self.ceil()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_weight() {
        assert_eq!(<i64 as Weight>::bit(0), 1);
        assert_eq!(<i64 as Weight>::bit(5), 32);
        assert_eq!(<i64 as Weight>::max_value(4), 15);
        assert_eq!(<i64 as Weight>::max_value(62), (1i64 << 62) - 1);
        assert_eq!(<i128 as Weight>::max_value(100), (1i128 << 100) - 1);
        assert!(10i64.test_bit(1));
        assert!(!10i64.test_bit(0));
        assert_eq!(8i64.with_bit(1), 10);
        assert_eq!(7i64.half_floor(), 3);
        assert_eq!(7i64.half_ceil(), 4);
        assert_eq!(6i64.half_ceil(), 3);
        assert_eq!(Weight::pred(5i64), 4);
        assert_eq!(Weight::succ(5i64), 6);
    }

    #[test]
    fn test_rational_weight() {
        type Q = Ratio<i64>;
        assert_eq!(<Q as Weight>::bit(3), Ratio::from_integer(8));
        assert_eq!(<Q as Weight>::max_value(2), Ratio::from_integer(3));
        let x = Ratio::new(3, 2);
        assert_eq!(x.half_floor(), Ratio::new(3, 4));
        assert_eq!(x.half_floor(), x.half_ceil());
        assert!(Q::ZERO < x);
        assert!(!<Q as Weight>::BIT_REFINEMENT);
        assert_eq!(Ratio::new(1, 2).pred(), Q::ZERO);
        assert_eq!(Ratio::new(1, 2).succ(), Ratio::from_integer(1));
        assert_eq!(Ratio::from_integer(3).pred(), Ratio::from_integer(2));
        assert_eq!(Ratio::from_integer(3).succ(), Ratio::from_integer(4));
    }
}
