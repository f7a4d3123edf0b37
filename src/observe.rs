//! Forward observation capture.
//!
//! Relevance propagation needs the tensors that flowed through a layer
//! during the forward pass. Rather than stashing them in hidden mutable
//! fields, every forward call returns an explicit [`Observation`] that the
//! caller threads into the matching `relprop` call. An observation is valid
//! for exactly one forward invocation; a new forward pass produces a new
//! observation and the old one must not be mixed with it.

use crate::{
    error::{RelPropError, Result},
    tensor::Tensor,
};
use num_traits::Float;

/// A layer input or output: a single tensor or an ordered list of tensors.
///
/// Multi-input layers (Add, Cat, einsum) consume `Many`; fan-out layers
/// (Replicate) produce it.
#[derive(Debug, Clone)]
pub enum Value<T> {
    One(Tensor<T>),
    Many(Vec<Tensor<T>>),
}

impl<T: Float> Value<T> {
    /// Returns the single tensor, or an error for a list.
    pub fn one(&self) -> Result<&Tensor<T>> {
        match self {
            Value::One(tensor) => Ok(tensor),
            Value::Many(list) => Err(RelPropError::ExpectedSingle(list.len())),
        }
    }

    /// Returns the tensor list, or an error for a single tensor.
    pub fn many(&self) -> Result<&[Tensor<T>]> {
        match self {
            Value::One(_) => Err(RelPropError::ArityMismatch {
                expected: 2,
                actual: 1,
            }),
            Value::Many(list) => Ok(list),
        }
    }

    /// Returns the tensor list, checking its length.
    pub fn many_exactly(&self, expected: usize) -> Result<&[Tensor<T>]> {
        let list = self.many()?;
        if list.len() != expected {
            return Err(RelPropError::ArityMismatch {
                expected,
                actual: list.len(),
            });
        }
        Ok(list)
    }

    /// Whether this value carries no tensors at all.
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Many(list) if list.is_empty())
    }

    /// Sum of all elements across all carried tensors.
    pub fn total(&self) -> T {
        match self {
            Value::One(tensor) => crate::ops::reduction::sum(tensor),
            Value::Many(list) => list
                .iter()
                .fold(T::zero(), |acc, t| acc + crate::ops::reduction::sum(t)),
        }
    }
}

/// Pairs two values of matching structure element by element.
///
/// `One` pairs with `One`, `Many` with `Many` of the same length. This is
/// how the generic rule divides relevance by the recomputed output and
/// multiplies inputs by their gradient terms without caring about arity.
pub fn zip_values<T, F>(lhs: &Value<T>, rhs: &Value<T>, f: F) -> Result<Value<T>>
where
    T: Float,
    F: Fn(&Tensor<T>, &Tensor<T>) -> Result<Tensor<T>>,
{
    match (lhs, rhs) {
        (Value::One(a), Value::One(b)) => Ok(Value::One(f(a, b)?)),
        (Value::Many(a), Value::Many(b)) => {
            if a.len() != b.len() {
                return Err(RelPropError::ArityMismatch {
                    expected: a.len(),
                    actual: b.len(),
                });
            }
            let out = a
                .iter()
                .zip(b)
                .map(|(x, y)| f(x, y))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Many(out))
        }
        (Value::One(_), Value::Many(list)) | (Value::Many(list), Value::One(_)) => {
            Err(RelPropError::ArityMismatch {
                expected: 1,
                actual: list.len(),
            })
        }
    }
}

/// The input and output of one forward invocation of a layer.
#[derive(Debug, Clone)]
pub struct Observation<T> {
    pub input: Value<T>,
    pub output: Value<T>,
}

impl<T: Float> Observation<T> {
    /// Records a forward invocation.
    ///
    /// A forward call without any positional input is logged and recorded
    /// as-is rather than raised; relevance propagation against such an
    /// observation is undefined and callers must avoid producing one.
    pub fn record(input: Value<T>, output: Value<T>) -> Self {
        if input.is_missing() {
            log::error!("forward invoked without any positional input; observation is undefined");
        }
        Self { input, output }
    }

    /// The observed single-tensor input.
    pub fn input_one(&self) -> Result<&Tensor<T>> {
        self.input.one()
    }

    /// The observed single-tensor output.
    pub fn output_one(&self) -> Result<&Tensor<T>> {
        self.output.one()
    }
}
