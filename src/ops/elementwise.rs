//! Element-wise operations for tensors.

use crate::{
    error::{RelPropError, Result},
    tensor::Tensor,
};
use num_traits::Float;

/// Apply a function element-wise to a tensor.
pub fn map<T, F>(tensor: &Tensor<T>, f: F) -> Result<Tensor<T>>
where
    T: Float,
    F: Fn(T) -> T,
{
    let data: Vec<T> = tensor.data().iter().map(|&x| f(x)).collect();
    Tensor::from_slice(&data, tensor.shape())
}

/// Apply a function element-wise to two tensors of identical shape.
pub fn zip_with<T, F>(lhs: &Tensor<T>, rhs: &Tensor<T>, f: F) -> Result<Tensor<T>>
where
    T: Float,
    F: Fn(T, T) -> T,
{
    if lhs.shape() != rhs.shape() {
        return Err(RelPropError::IncompatibleShapes(
            lhs.shape().to_vec(),
            rhs.shape().to_vec(),
        ));
    }
    let data: Vec<T> = lhs
        .data()
        .iter()
        .zip(rhs.data())
        .map(|(&a, &b)| f(a, b))
        .collect();
    Tensor::from_slice(&data, lhs.shape())
}

/// Element-wise lower clamp: `max(x, bound)`.
pub fn clamp_min<T: Float>(tensor: &Tensor<T>, bound: T) -> Result<Tensor<T>> {
    map(tensor, |x| x.max(bound))
}

/// Element-wise upper clamp: `min(x, bound)`.
pub fn clamp_max<T: Float>(tensor: &Tensor<T>, bound: T) -> Result<Tensor<T>> {
    map(tensor, |x| x.min(bound))
}

/// Element-wise absolute value.
pub fn abs<T: Float>(tensor: &Tensor<T>) -> Result<Tensor<T>> {
    map(tensor, |x| x.abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map() {
        let a = Tensor::from_slice(&[1.0f32, 2.0, 3.0], &[3]).unwrap();
        let b = map(&a, |x| x * 2.0).unwrap();
        assert_eq!(b.data(), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_zip_with() {
        let a = Tensor::from_slice(&[1.0f32, 2.0, 3.0], &[3]).unwrap();
        let b = Tensor::from_slice(&[4.0f32, 5.0, 6.0], &[3]).unwrap();
        let c = zip_with(&a, &b, |x, y| x + y).unwrap();
        assert_eq!(c.data(), &[5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_zip_with_shape_mismatch() {
        let a = Tensor::<f32>::zeros(&[2]);
        let b = Tensor::<f32>::zeros(&[3]);
        assert!(zip_with(&a, &b, |x, y| x + y).is_err());
    }

    #[test]
    fn test_clamp() {
        let a = Tensor::from_slice(&[-2.0f32, 0.0, 3.0], &[3]).unwrap();
        assert_eq!(clamp_min(&a, 0.0).unwrap().data(), &[0.0, 0.0, 3.0]);
        assert_eq!(clamp_max(&a, 0.0).unwrap().data(), &[-2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_abs() {
        let a = Tensor::from_slice(&[-1.0f32, 0.0, 1.0], &[3]).unwrap();
        assert_eq!(abs(&a).unwrap().data(), &[1.0, 0.0, 1.0]);
    }
}
