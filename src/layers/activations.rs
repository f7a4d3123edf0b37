//! Elementwise activation layers.
//!
//! Activations keep the identity relevance rule: relevance that arrives at
//! their output passes through to their input unchanged. They still carry an
//! exact local derivative so the gradient-query primitive composes through
//! them.

use crate::{
    error::{RelPropError, Result},
    layers::{Forward, RelevanceProvider},
    observe::{Observation, Value},
    ops::elementwise::{map, zip_with},
    tensor::Tensor,
};
use num_traits::Float;

/// Iterates a tensor as `outer * axis * inner` blocks along `dim`.
fn axis_blocks<T: Float>(tensor: &Tensor<T>, dim: usize) -> Result<(usize, usize, usize)> {
    if dim >= tensor.ndim() {
        return Err(RelPropError::InvalidAxis(dim, tensor.ndim()));
    }
    let shape = tensor.shape();
    Ok((
        shape[..dim].iter().product(),
        shape[dim],
        shape[dim + 1..].iter().product(),
    ))
}

/// ReLU activation.
///
/// Formula: `f(x) = max(0, x)`
#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU;

impl ReLU {
    pub fn new() -> Self {
        Self
    }
}

impl<T: Float> Forward<T> for ReLU {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        Ok(Value::One(map(input.one()?, |x| x.max(T::zero()))?))
    }
}

impl<T: Float> RelevanceProvider<T> for ReLU {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let x = observation.input_one()?;
        let c = zip_with(seed.one()?, x, |s, x| {
            if x > T::zero() {
                s
            } else {
                T::zero()
            }
        })?;
        Ok(Value::One(c))
    }
}

/// GELU activation (tanh approximation).
///
/// Formula: `f(x) = 0.5 * x * (1 + tanh(sqrt(2/π) * (x + 0.044715 * x^3)))`
#[derive(Debug, Clone, Copy, Default)]
pub struct GELU;

impl GELU {
    pub fn new() -> Self {
        Self
    }
}

fn gelu_inner<T: Float>(x: T) -> T {
    let c = T::from(0.797_884_560_802_865_4).unwrap(); // sqrt(2/pi)
    let k = T::from(0.044715).unwrap();
    c * (x + k * x * x * x)
}

impl<T: Float> Forward<T> for GELU {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let half = T::from(0.5).unwrap();
        Ok(Value::One(map(input.one()?, |x| {
            half * x * (T::one() + gelu_inner(x).tanh())
        })?))
    }
}

impl<T: Float> RelevanceProvider<T> for GELU {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let half = T::from(0.5).unwrap();
        let c = T::from(0.797_884_560_802_865_4).unwrap();
        let k3 = T::from(3.0 * 0.044715).unwrap();
        let x = observation.input_one()?;
        let grad = zip_with(seed.one()?, x, |s, x| {
            let t = gelu_inner(x).tanh();
            let sech2 = T::one() - t * t;
            let du = c * (T::one() + k3 * x * x);
            s * (half * (T::one() + t) + half * x * sech2 * du)
        })?;
        Ok(Value::One(grad))
    }
}

/// ELU activation.
///
/// Formula: `f(x) = x if x >= 0 else alpha * (exp(x) - 1)`
#[derive(Debug, Clone, Copy)]
pub struct ELU<T> {
    alpha: T,
}

impl<T: Float> ELU<T> {
    pub fn new(alpha: T) -> Self {
        Self { alpha }
    }
}

impl<T: Float> Default for ELU<T> {
    fn default() -> Self {
        Self { alpha: T::one() }
    }
}

impl<T: Float> Forward<T> for ELU<T> {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let alpha = self.alpha;
        Ok(Value::One(map(input.one()?, |x| {
            if x >= T::zero() {
                x
            } else {
                alpha * (x.exp() - T::one())
            }
        })?))
    }
}

impl<T: Float> RelevanceProvider<T> for ELU<T> {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let alpha = self.alpha;
        let x = observation.input_one()?;
        let grad = zip_with(seed.one()?, x, |s, x| {
            if x >= T::zero() {
                s
            } else {
                s * alpha * x.exp()
            }
        })?;
        Ok(Value::One(grad))
    }
}

/// Softmax along a fixed dimension.
///
/// Formula: `f(x_i) = exp(x_i) / sum(exp(x_j) for j in dim)`
#[derive(Debug, Clone, Copy)]
pub struct Softmax {
    dim: usize,
}

impl Softmax {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl<T: Float> Forward<T> for Softmax {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let x = input.one()?;
        let (outer, axis, inner) = axis_blocks(x, self.dim)?;
        let mut out = x.clone();
        for o in 0..outer {
            for i in 0..inner {
                let at = |k: usize| o * axis * inner + k * inner + i;
                // Subtract the lane maximum before exponentiating.
                let mut lane_max = T::neg_infinity();
                for k in 0..axis {
                    lane_max = lane_max.max(x.data()[at(k)]);
                }
                let mut denom = T::zero();
                for k in 0..axis {
                    let e = (x.data()[at(k)] - lane_max).exp();
                    out.data_mut()[at(k)] = e;
                    denom = denom + e;
                }
                for k in 0..axis {
                    out.data_mut()[at(k)] = out.data()[at(k)] / denom;
                }
            }
        }
        Ok(Value::One(out))
    }
}

impl<T: Float> RelevanceProvider<T> for Softmax {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let y = self.apply(&observation.input)?;
        let y = y.one()?;
        let s = seed.one()?;
        if s.shape() != y.shape() {
            return Err(RelPropError::IncompatibleShapes(
                s.shape().to_vec(),
                y.shape().to_vec(),
            ));
        }
        let (outer, axis, inner) = axis_blocks(y, self.dim)?;
        let mut out = y.clone();
        for o in 0..outer {
            for i in 0..inner {
                let at = |k: usize| o * axis * inner + k * inner + i;
                let mut dot = T::zero();
                for k in 0..axis {
                    dot = dot + s.data()[at(k)] * y.data()[at(k)];
                }
                for k in 0..axis {
                    out.data_mut()[at(k)] = y.data()[at(k)] * (s.data()[at(k)] - dot);
                }
            }
        }
        Ok(Value::One(out))
    }
}

/// Dropout at inference time: the identity in both directions.
#[derive(Debug, Clone, Copy)]
pub struct Dropout<T> {
    p: T,
}

impl<T: Float> Dropout<T> {
    /// Creates a dropout layer with the given training-time probability.
    ///
    /// The probability is kept only for parity with the layer being
    /// explained; at inference dropout is a no-op.
    pub fn new(p: T) -> Self {
        Self { p }
    }

    pub fn probability(&self) -> T {
        self.p
    }
}

impl<T: Float> Forward<T> for Dropout<T> {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        Ok(Value::One(input.one()?.clone()))
    }
}

impl<T: Float> RelevanceProvider<T> for Dropout<T> {
    fn gradprop(&self, _observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        Ok(Value::One(seed.one()?.clone()))
    }
}
