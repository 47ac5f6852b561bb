// rational.rs — Exact rational arithmetic for rate balancing
//
// `Fraction` is an arbitrary-precision numerator/denominator pair kept in
// lowest terms with a positive denominator. Balance equations are solved
// entirely in fractions and converted to integers once per container.
//
// Preconditions: none.
// Postconditions: every constructed Fraction is reduced, denominator > 0.
// Failure modes: construction with a zero denominator returns None.
// Side effects: none.

use std::fmt;
use std::ops::Mul;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{One, Signed, ToPrimitive, Zero};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fraction {
    num: BigInt,
    den: BigInt,
}

impl Fraction {
    /// Build `num / den` in lowest terms. Returns None when `den` is zero.
    pub fn new(num: impl Into<BigInt>, den: impl Into<BigInt>) -> Option<Self> {
        let num = num.into();
        let den = den.into();
        if den.is_zero() {
            return None;
        }
        Some(Self::reduced(num, den))
    }

    pub fn from_integer(value: impl Into<BigInt>) -> Self {
        Fraction {
            num: value.into(),
            den: BigInt::one(),
        }
    }

    pub fn one() -> Self {
        Self::from_integer(1)
    }

    pub fn zero() -> Self {
        Self::from_integer(0)
    }

    fn reduced(num: BigInt, den: BigInt) -> Self {
        let g = num.gcd(&den);
        let (mut num, mut den) = if g.is_zero() || g.is_one() {
            (num, den)
        } else {
            (num / &g, den / &g)
        };
        if den.is_negative() {
            num = -num;
            den = -den;
        }
        if num.is_zero() {
            den = BigInt::one();
        }
        Fraction { num, den }
    }

    pub fn numer(&self) -> &BigInt {
        &self.num
    }

    pub fn denom(&self) -> &BigInt {
        &self.den
    }

    pub fn is_zero(&self) -> bool {
        self.num.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.num.is_positive()
    }

    pub fn is_integer(&self) -> bool {
        self.den.is_one()
    }

    /// Multiply by the ratio `num / den`. None when `den` is zero.
    pub fn scale(&self, num: u64, den: u64) -> Option<Fraction> {
        if den == 0 {
            return None;
        }
        Some(Self::reduced(
            &self.num * BigInt::from(num),
            &self.den * BigInt::from(den),
        ))
    }

    /// Integer value, if this fraction is a non-negative integer that fits.
    pub fn to_u64(&self) -> Option<u64> {
        if !self.is_integer() {
            return None;
        }
        self.num.to_u64()
    }
}

impl Mul for &Fraction {
    type Output = Fraction;

    fn mul(self, rhs: &Fraction) -> Fraction {
        Fraction::reduced(&self.num * &rhs.num, &self.den * &rhs.den)
    }
}

impl Mul<&BigInt> for &Fraction {
    type Output = Fraction;

    fn mul(self, rhs: &BigInt) -> Fraction {
        Fraction::reduced(&self.num * rhs, self.den.clone())
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_integer() {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

/// Least common multiple of all denominators (1 for an empty input).
pub fn lcm_of_denominators<'a>(values: impl IntoIterator<Item = &'a Fraction>) -> BigInt {
    values
        .into_iter()
        .fold(BigInt::one(), |acc, f| acc.lcm(f.denom()))
}

/// Scale a set of fractions to the smallest positive integers with the same
/// ratios: one LCM pass over denominators, then one GCD pass over numerators.
pub fn normalize_to_integers(values: &[Fraction]) -> Vec<BigInt> {
    let lcm = lcm_of_denominators(values);
    let scaled: Vec<BigInt> = values.iter().map(|f| (f * &lcm).num).collect();
    let g = scaled.iter().fold(BigInt::zero(), |acc, v| acc.gcd(v));
    if g.is_zero() || g.is_one() {
        return scaled;
    }
    scaled.into_iter().map(|v| v / &g).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frac(n: i64, d: i64) -> Fraction {
        Fraction::new(n, d).unwrap()
    }

    #[test]
    fn construction_reduces_and_fixes_sign() {
        let f = frac(6, -4);
        assert_eq!(f.numer(), &BigInt::from(-3));
        assert_eq!(f.denom(), &BigInt::from(2));
        assert_eq!(frac(0, 5), Fraction::zero());
        assert!(Fraction::new(1, 0).is_none());
    }

    #[test]
    fn multiplication_and_scaling() {
        let product = &frac(2, 3) * &frac(9, 4);
        assert_eq!(product, frac(3, 2));
        assert_eq!(frac(3, 2).scale(4, 3), Some(Fraction::from_integer(2)));
        assert_eq!(frac(3, 2).scale(1, 0), None);
        assert_eq!(Fraction::from_integer(7).to_u64(), Some(7));
        assert_eq!(frac(7, 2).to_u64(), None);
    }

    #[test]
    fn normalization_yields_minimal_integers() {
        let values = [frac(1, 1), frac(1, 2), frac(3, 4)];
        let ints = normalize_to_integers(&values);
        assert_eq!(
            ints,
            vec![BigInt::from(4), BigInt::from(2), BigInt::from(3)]
        );

        let common = [Fraction::from_integer(4), Fraction::from_integer(6)];
        assert_eq!(
            normalize_to_integers(&common),
            vec![BigInt::from(2), BigInt::from(3)]
        );
    }

    #[test]
    fn display_shows_integers_plainly() {
        assert_eq!(frac(4, 2).to_string(), "2");
        assert_eq!(frac(1, 3).to_string(), "1/3");
    }
}
