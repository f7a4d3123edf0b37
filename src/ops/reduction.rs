//! Reduction operations for tensors.

use crate::{error::Result, tensor::Tensor};
use num_traits::Float;

/// Compute the sum of all elements in the tensor.
pub fn sum<T: Float>(tensor: &Tensor<T>) -> T {
    tensor.data().iter().fold(T::zero(), |acc, &x| acc + x)
}

/// Find the maximum value in the tensor.
pub fn max<T: Float>(tensor: &Tensor<T>) -> T {
    tensor
        .data()
        .iter()
        .fold(T::neg_infinity(), |acc, &x| acc.max(x))
}

/// Find the minimum value in the tensor.
pub fn min<T: Float>(tensor: &Tensor<T>) -> T {
    tensor
        .data()
        .iter()
        .fold(T::infinity(), |acc, &x| acc.min(x))
}

/// Per-sample minimum over every non-batch dimension, broadcast back to the
/// input shape.
///
/// For an input of shape `[b, ...]` the result holds, at every position of
/// sample `i`, the smallest element of sample `i`. This is the lower pixel
/// bound `L` of the first-layer convolution rule.
pub fn sample_min<T: Float>(tensor: &Tensor<T>) -> Result<Tensor<T>> {
    sample_bound(tensor, T::infinity(), |a, b| a.min(b))
}

/// Per-sample maximum over every non-batch dimension, broadcast back to the
/// input shape. The upper pixel bound `H` of the first-layer convolution rule.
pub fn sample_max<T: Float>(tensor: &Tensor<T>) -> Result<Tensor<T>> {
    sample_bound(tensor, T::neg_infinity(), |a, b| a.max(b))
}

fn sample_bound<T, F>(tensor: &Tensor<T>, init: T, f: F) -> Result<Tensor<T>>
where
    T: Float,
    F: Fn(T, T) -> T,
{
    let batch = if tensor.ndim() == 0 { 1 } else { tensor.shape()[0] };
    let per_sample = if batch == 0 { 0 } else { tensor.len() / batch };
    let mut data = Vec::with_capacity(tensor.len());
    for b in 0..batch {
        let slice = &tensor.data()[b * per_sample..(b + 1) * per_sample];
        let bound = slice.iter().fold(init, |acc, &x| f(acc, x));
        data.extend(std::iter::repeat(bound).take(per_sample));
    }
    Tensor::from_slice(&data, tensor.shape())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum() {
        let a = Tensor::from_slice(&[1.0f32, 2.0, 3.0], &[3]).unwrap();
        assert_eq!(sum(&a), 6.0);
    }

    #[test]
    fn test_min_max() {
        let a = Tensor::from_slice(&[1.0f32, 3.0, 2.0], &[3]).unwrap();
        assert_eq!(max(&a), 3.0);
        assert_eq!(min(&a), 1.0);
    }

    #[test]
    fn test_sample_bounds() {
        // Two samples of shape [1, 2, 2].
        let a = Tensor::from_slice(
            &[1.0f32, -2.0, 3.0, 0.5, 4.0, 7.0, -1.0, 2.0],
            &[2, 1, 2, 2],
        )
        .unwrap();
        let lo = sample_min(&a).unwrap();
        let hi = sample_max(&a).unwrap();
        assert_eq!(lo.data()[..4], [-2.0, -2.0, -2.0, -2.0]);
        assert_eq!(lo.data()[4..], [-1.0, -1.0, -1.0, -1.0]);
        assert_eq!(hi.data()[..4], [3.0, 3.0, 3.0, 3.0]);
        assert_eq!(hi.data()[4..], [7.0, 7.0, 7.0, 7.0]);
    }
}
