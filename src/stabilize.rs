//! Numeric stabilizer for relevance quotients.
//!
//! Every quotient in a relevance rule goes through [`safe_divide`]; a raw
//! division against a recomputed layer output can blow up or produce NaN
//! wherever that output crosses zero.

use crate::{error::Result, ops::elementwise::zip_with, tensor::Tensor};
use num_traits::Float;

/// Stabilized element-wise division.
///
/// Returns `a / b` with the denominator clamped away from zero on both
/// sides (floored at `+1e-9` on the positive branch, capped at `-1e-9` on
/// the negative branch, summed), plus a further `1e-9` wherever the clamped
/// denominator is still exactly zero. Wherever the *original* `b` is exactly
/// zero the result is exactly zero, regardless of `a`.
pub fn safe_divide<T: Float>(a: &Tensor<T>, b: &Tensor<T>) -> Result<Tensor<T>> {
    zip_with(a, b, safe_divide_scalar)
}

/// Scalar form of [`safe_divide`], for the scalar rescaling factors of the
/// Add redistribution rule.
pub fn safe_divide_scalar<T: Float>(a: T, b: T) -> T {
    let eps = T::from(1e-9).unwrap();
    if b == T::zero() {
        return T::zero();
    }
    let mut den = b.max(eps) + b.min(-eps);
    if den == T::zero() {
        den = den + eps;
    }
    a / den
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_zero_denominator_gives_exact_zero() {
        let a = Tensor::from_slice(&[1.0f64, -2.0, 3.0, 0.0], &[2, 2]).unwrap();
        let b = Tensor::from_slice(&[0.0f64, 0.0, 2.0, 0.0], &[2, 2]).unwrap();
        let q = safe_divide(&a, &b).unwrap();
        assert_eq!(q.data()[0], 0.0);
        assert_eq!(q.data()[1], 0.0);
        assert_relative_eq!(q.data()[2], 1.5, epsilon = 1e-12);
        assert_eq!(q.data()[3], 0.0);
    }

    #[test]
    fn test_ordinary_division_unaffected() {
        let a = Tensor::from_slice(&[6.0f64, -8.0], &[2]).unwrap();
        let b = Tensor::from_slice(&[3.0f64, 2.0], &[2]).unwrap();
        let q = safe_divide(&a, &b).unwrap();
        assert_relative_eq!(q.data()[0], 2.0, epsilon = 1e-8);
        assert_relative_eq!(q.data()[1], -4.0, epsilon = 1e-8);
    }

    #[test]
    fn test_near_zero_denominator_is_bounded() {
        // 1 / 1e-12 would be 1e12; the stabilizer bounds it near 1e9.
        let a = Tensor::from_slice(&[1.0f64], &[1]).unwrap();
        let b = Tensor::from_slice(&[1e-12f64], &[1]).unwrap();
        let q = safe_divide(&a, &b).unwrap();
        assert!(q.data()[0] <= 1.1e9);
        assert!(q.data()[0] > 0.0);
    }

    #[test]
    fn test_negative_near_zero_is_bounded() {
        // Both clamps cancel for |b| < 1e-9; the extra correction keeps the
        // denominator finite.
        let a = Tensor::from_slice(&[1.0f64], &[1]).unwrap();
        let b = Tensor::from_slice(&[-1e-12f64], &[1]).unwrap();
        let q = safe_divide(&a, &b).unwrap();
        assert!(q.data()[0].abs() <= 1.1e9);
        assert!(q.data()[0] != 0.0);
    }
}
