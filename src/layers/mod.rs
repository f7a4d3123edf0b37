//! Propagator layers.
//!
//! Every layer in this module is a drop-in replacement for its ordinary
//! neural-network counterpart: the forward transformation is unchanged, and
//! on top of it the layer knows how to redistribute a relevance signal from
//! its output back onto its input (deep Taylor decomposition).
//!
//! Capability seams are split in two: [`Forward`] is the pure transformation
//! plus the always-on observation capture, and [`RelevanceProvider`] adds the
//! gradient-query primitive and the relevance rule.

pub mod activations;
pub mod conv2d;
pub mod conv3d;
pub mod linear;
pub mod norm;
pub mod pool;
pub mod structural;

pub use activations::*;
pub use conv2d::Conv2d;
pub use conv3d::Conv3d;
pub use linear::Linear;
pub use norm::*;
pub use pool::*;
pub use structural::*;

use crate::{
    error::{RelPropError, Result},
    observe::{zip_values, Observation, Value},
    ops::arithmetic::mul,
    stabilize::safe_divide,
    tensor::Tensor,
};
use num_traits::Float;

/// The forward capability of a propagator layer.
pub trait Forward<T: Float> {
    /// The pure forward transformation.
    fn apply(&self, input: &Value<T>) -> Result<Value<T>>;

    /// Runs the forward transformation and captures the observation.
    ///
    /// The capture fires on every forward call; it is not optional. The
    /// returned observation is what the matching `relprop` call consumes.
    fn forward(&self, input: Value<T>) -> Result<Observation<T>> {
        let output = self.apply(&input)?;
        Ok(Observation::record(input, output))
    }
}

/// The relevance-propagation capability of a propagator layer.
pub trait RelevanceProvider<T: Float>: Forward<T> {
    /// Vector-Jacobian product of the forward map at the observed input.
    ///
    /// Treats `seed` (shaped like the observed output) as an upstream
    /// gradient signal and projects it through the layer's local derivative
    /// onto the input. Repeated queries against the same observation are
    /// valid; nothing is consumed.
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>>;

    /// Redistributes output relevance `r` onto the layer's input.
    ///
    /// The default is the identity pass-through; concrete layers override
    /// it. `alpha` weights the activator flow of the signed-decomposition
    /// rules (`beta = alpha - 1` is derived, never supplied).
    fn relprop(&self, observation: &Observation<T>, r: Value<T>, alpha: T) -> Result<Value<T>> {
        let _ = (observation, alpha);
        Ok(r)
    }
}

/// The generic deep Taylor redistribution rule.
///
/// Recomputes `Z = apply(X)`, divides the incoming relevance by it through
/// the stabilizer, projects the quotient back through the layer's local
/// derivative and multiplies by the observed input:
/// `R' = X * gradprop(safe_divide(R, Z))`.
pub fn relprop_simple<T, L>(layer: &L, observation: &Observation<T>, r: &Value<T>) -> Result<Value<T>>
where
    T: Float,
    L: RelevanceProvider<T> + ?Sized,
{
    let z = layer.apply(&observation.input)?;
    let s = zip_values(r, &z, |a, b| safe_divide(a, b))?;
    let c = layer.gradprop(observation, &s)?;
    zip_values(&observation.input, &c, mul)
}

/// An ordered sequence of propagator layers.
///
/// Forward evaluation threads a single tensor through the layers in order,
/// collecting one observation per layer; relevance propagation walks the
/// layers and observations in reverse, feeding each layer's input relevance
/// to its predecessor.
pub struct Sequential<T: Float> {
    layers: Vec<Box<dyn RelevanceProvider<T>>>,
}

impl<T: Float> Sequential<T> {
    /// Creates an empty sequence.
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Appends a layer.
    pub fn add<L>(mut self, layer: L) -> Self
    where
        L: RelevanceProvider<T> + 'static,
    {
        self.layers.push(Box::new(layer));
        self
    }

    /// Number of contained layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Forward pass through all layers.
    ///
    /// Returns the final output together with the per-layer observations in
    /// forward order.
    pub fn forward(&self, input: Tensor<T>) -> Result<(Tensor<T>, Vec<Observation<T>>)> {
        let mut observations = Vec::with_capacity(self.layers.len());
        let mut current = input;
        for layer in &self.layers {
            let observation = layer.forward(Value::One(current))?;
            current = observation.output_one()?.clone();
            observations.push(observation);
        }
        Ok((current, observations))
    }

    /// Propagates relevance through the layers in reverse order.
    ///
    /// `observations` must be the vector returned by the matching
    /// [`Sequential::forward`] call.
    pub fn relprop(
        &self,
        observations: &[Observation<T>],
        r: Tensor<T>,
        alpha: T,
    ) -> Result<Tensor<T>> {
        if observations.len() != self.layers.len() {
            return Err(RelPropError::ArityMismatch {
                expected: self.layers.len(),
                actual: observations.len(),
            });
        }
        let mut relevance = Value::One(r);
        for (layer, observation) in self.layers.iter().zip(observations).rev() {
            relevance = layer.relprop(observation, relevance, alpha)?;
        }
        Ok(relevance.one()?.clone())
    }
}

impl<T: Float> Default for Sequential<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_sequential_forward_and_relprop() {
        let model = Sequential::new().add(ReLU::new()).add(ReLU::new());
        let input = Tensor::from_slice(&[-1.0f64, 2.0, 3.0], &[1, 3]).unwrap();
        let (output, observations) = model.forward(input).unwrap();
        assert_eq!(output.data(), &[0.0, 2.0, 3.0]);
        assert_eq!(observations.len(), 2);

        let r = Tensor::from_slice(&[0.5f64, 1.0, 1.5], &[1, 3]).unwrap();
        let back = model.relprop(&observations, r.clone(), 1.0).unwrap();
        // ReLU relprop is the identity pass-through.
        for (&got, &want) in back.data().iter().zip(r.data()) {
            assert_relative_eq!(got, want);
        }
    }

    #[test]
    fn test_relprop_rejects_mismatched_trace() {
        let model = Sequential::<f64>::new().add(ReLU::new());
        let r = Tensor::from_slice(&[1.0f64], &[1]).unwrap();
        assert!(model.relprop(&[], r, 1.0).is_err());
    }
}
