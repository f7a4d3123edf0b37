//! Arithmetic operations for tensors.

use crate::{error::Result, ops::elementwise, tensor::Tensor};
use num_traits::Float;

/// Element-wise addition.
pub fn add<T: Float>(lhs: &Tensor<T>, rhs: &Tensor<T>) -> Result<Tensor<T>> {
    elementwise::zip_with(lhs, rhs, |a, b| a + b)
}

/// Element-wise subtraction.
pub fn sub<T: Float>(lhs: &Tensor<T>, rhs: &Tensor<T>) -> Result<Tensor<T>> {
    elementwise::zip_with(lhs, rhs, |a, b| a - b)
}

/// Element-wise multiplication.
pub fn mul<T: Float>(lhs: &Tensor<T>, rhs: &Tensor<T>) -> Result<Tensor<T>> {
    elementwise::zip_with(lhs, rhs, |a, b| a * b)
}

/// Element-wise division.
///
/// Note: relevance rules must not use this directly for their quotients;
/// the stabilized [`crate::stabilize::safe_divide`] guards those.
pub fn div<T: Float>(lhs: &Tensor<T>, rhs: &Tensor<T>) -> Result<Tensor<T>> {
    elementwise::zip_with(lhs, rhs, |a, b| a / b)
}

/// Adds a scalar to every element.
pub fn add_scalar<T: Float>(tensor: &Tensor<T>, value: T) -> Result<Tensor<T>> {
    elementwise::map(tensor, |x| x + value)
}

/// Multiplies every element by a scalar.
pub fn mul_scalar<T: Float>(tensor: &Tensor<T>, value: T) -> Result<Tensor<T>> {
    elementwise::map(tensor, |x| x * value)
}
