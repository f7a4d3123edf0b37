//! Core dense tensor type.
//!
//! This module provides the main `Tensor` type used throughout the crate:
//! a row-major n-dimensional array over a floating point element type.

use crate::error::{RelPropError, Result};
use num_traits::Float;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

/// A dense n-dimensional array with row-major layout.
///
/// `Tensor` is the central data structure of the crate. Both the forward
/// transformations of the propagator layers and the relevance signals that
/// flow backward through them are represented as tensors.
///
/// # Type Parameters
///
/// * `T`: The floating point element type (`f32` or `f64`).
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    data: Vec<T>,
    shape: Vec<usize>,
}

impl<T: Float> Tensor<T> {
    /// Creates a tensor from a flat slice and a shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice length does not match the shape size.
    pub fn from_slice(data: &[T], shape: &[usize]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(RelPropError::ShapeMismatch {
                expected: vec![size],
                actual: vec![data.len()],
            });
        }
        Ok(Self {
            data: data.to_vec(),
            shape: shape.to_vec(),
        })
    }

    /// Creates a tensor filled with zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, T::zero())
    }

    /// Creates a tensor filled with ones.
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, T::one())
    }

    /// Creates a tensor filled with the given value.
    pub fn full(shape: &[usize], value: T) -> Self {
        let size: usize = shape.iter().product();
        Self {
            data: vec![value; size],
            shape: shape.to_vec(),
        }
    }

    /// Creates a zero tensor with the same shape as `self`.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(&self.shape)
    }

    /// Creates a tensor of samples from a normal distribution.
    ///
    /// # Arguments
    /// * `shape` - The shape of the tensor
    /// * `mean` - Mean of the distribution
    /// * `std` - Standard deviation of the distribution
    /// * `seed` - Optional random seed for reproducibility
    pub fn randn(shape: &[usize], mean: T, std: T, seed: Option<u64>) -> Self
    where
        StandardNormal: Distribution<T>,
    {
        let seed = seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let size: usize = shape.iter().product();
        let data = (0..size)
            .map(|_| {
                let z: T = rng.sample(StandardNormal);
                mean + std * z
            })
            .collect();
        Self {
            data,
            shape: shape.to_vec(),
        }
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the total number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the tensor has no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the flat element data.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Returns the flat element data mutably.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Returns the row-major strides of the tensor.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.shape.len()];
        for i in (0..self.shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.shape[i + 1];
        }
        strides
    }

    /// Converts a multi-dimensional index into a flat offset.
    pub(crate) fn offset(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.shape.len() {
            return Err(RelPropError::InvalidIndex(
                index.to_vec(),
                self.shape.clone(),
            ));
        }
        let mut offset = 0;
        let strides = self.strides();
        for (axis, (&i, &dim)) in index.iter().zip(&self.shape).enumerate() {
            if i >= dim {
                return Err(RelPropError::IndexOutOfBounds(i, dim, axis));
            }
            offset += i * strides[axis];
        }
        Ok(offset)
    }

    /// Returns the element at the given multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Result<T> {
        Ok(self.data[self.offset(index)?])
    }

    /// Sets the element at the given multi-dimensional index.
    pub fn set(&mut self, index: &[usize], value: T) -> Result<()> {
        let offset = self.offset(index)?;
        self.data[offset] = value;
        Ok(())
    }

    /// Returns a tensor with the same data and a new shape of equal size.
    pub fn reshape(&self, shape: &[usize]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if size != self.data.len() {
            return Err(RelPropError::InvalidShape(format!(
                "cannot reshape tensor of size {} to {:?}",
                self.data.len(),
                shape
            )));
        }
        Ok(Self {
            data: self.data.clone(),
            shape: shape.to_vec(),
        })
    }
}
