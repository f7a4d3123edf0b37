//! Normalization layers.
//!
//! LayerNorm keeps the identity relevance rule like the activations. The
//! batch-normalization layers override it with a closed form: at inference
//! a batch norm is an exact affine map with a known Jacobian, so relevance
//! can be pushed through the quotient directly, with no linearization step.

use crate::{
    error::{RelPropError, Result},
    layers::{Forward, RelevanceProvider},
    observe::{Observation, Value},
    tensor::Tensor,
};
use num_traits::Float;

/// Layer normalization over the trailing dimension with learned scale/shift.
#[derive(Debug, Clone)]
pub struct LayerNorm<T> {
    weight: Tensor<T>,
    bias: Tensor<T>,
    eps: T,
}

impl<T: Float> LayerNorm<T> {
    /// Creates a layer with unit scale and zero shift.
    pub fn new(normalized_dim: usize) -> Self {
        Self {
            weight: Tensor::ones(&[normalized_dim]),
            bias: Tensor::zeros(&[normalized_dim]),
            eps: T::from(1e-5).unwrap(),
        }
    }

    /// Creates a layer from trained parameters.
    pub fn from_parts(weight: Tensor<T>, bias: Tensor<T>, eps: T) -> Result<Self> {
        if weight.shape() != bias.shape() || weight.ndim() != 1 {
            return Err(RelPropError::IncompatibleShapes(
                weight.shape().to_vec(),
                bias.shape().to_vec(),
            ));
        }
        Ok(Self { weight, bias, eps })
    }

    pub fn weight(&self) -> &Tensor<T> {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor<T> {
        &self.bias
    }

    fn lane_len(&self) -> usize {
        self.weight.len()
    }

    fn check_input(&self, x: &Tensor<T>) -> Result<usize> {
        let d = self.lane_len();
        if x.ndim() == 0 || x.shape()[x.ndim() - 1] != d {
            return Err(RelPropError::ShapeMismatch {
                expected: vec![d],
                actual: x.shape().to_vec(),
            });
        }
        Ok(x.len() / d)
    }

    fn lane_stats(&self, lane: &[T]) -> (T, T) {
        let d = T::from(lane.len()).unwrap();
        let mean = lane.iter().fold(T::zero(), |a, &v| a + v) / d;
        let var = lane
            .iter()
            .fold(T::zero(), |a, &v| a + (v - mean) * (v - mean))
            / d;
        (mean, (var + self.eps).sqrt())
    }
}

impl<T: Float> Forward<T> for LayerNorm<T> {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let x = input.one()?;
        let d = self.lane_len();
        let lanes = self.check_input(x)?;
        let mut out = x.clone();
        for lane in 0..lanes {
            let slice = &x.data()[lane * d..(lane + 1) * d];
            let (mean, std) = self.lane_stats(slice);
            for k in 0..d {
                let xhat = (slice[k] - mean) / std;
                out.data_mut()[lane * d + k] =
                    self.weight.data()[k] * xhat + self.bias.data()[k];
            }
        }
        Ok(Value::One(out))
    }
}

impl<T: Float> RelevanceProvider<T> for LayerNorm<T> {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let x = observation.input_one()?;
        let s = seed.one()?;
        if s.shape() != x.shape() {
            return Err(RelPropError::IncompatibleShapes(
                s.shape().to_vec(),
                x.shape().to_vec(),
            ));
        }
        let d = self.lane_len();
        let dn = T::from(d).unwrap();
        let lanes = self.check_input(x)?;
        let mut out = x.zeros_like();
        for lane in 0..lanes {
            let xs = &x.data()[lane * d..(lane + 1) * d];
            let ss = &s.data()[lane * d..(lane + 1) * d];
            let (mean, std) = self.lane_stats(xs);
            // dxhat = s * w; dx = (dxhat - mean(dxhat) - xhat * mean(dxhat * xhat)) / std
            let mut sum_dxhat = T::zero();
            let mut sum_dxhat_xhat = T::zero();
            for k in 0..d {
                let xhat = (xs[k] - mean) / std;
                let dxhat = ss[k] * self.weight.data()[k];
                sum_dxhat = sum_dxhat + dxhat;
                sum_dxhat_xhat = sum_dxhat_xhat + dxhat * xhat;
            }
            let mean_dxhat = sum_dxhat / dn;
            let mean_dxhat_xhat = sum_dxhat_xhat / dn;
            for k in 0..d {
                let xhat = (xs[k] - mean) / std;
                let dxhat = ss[k] * self.weight.data()[k];
                out.data_mut()[lane * d + k] =
                    (dxhat - mean_dxhat - xhat * mean_dxhat_xhat) / std;
            }
        }
        Ok(Value::One(out))
    }
}

/// Shared inference-mode batch normalization over the channel axis (dim 1).
#[derive(Debug, Clone)]
struct BatchNorm<T> {
    weight: Tensor<T>,
    bias: Tensor<T>,
    running_mean: Tensor<T>,
    running_var: Tensor<T>,
    eps: T,
    ndim: usize,
}

impl<T: Float> BatchNorm<T> {
    fn new(num_features: usize, ndim: usize) -> Self {
        Self {
            weight: Tensor::ones(&[num_features]),
            bias: Tensor::zeros(&[num_features]),
            running_mean: Tensor::zeros(&[num_features]),
            running_var: Tensor::ones(&[num_features]),
            eps: T::from(1e-5).unwrap(),
            ndim,
        }
    }

    fn from_parts(
        weight: Tensor<T>,
        bias: Tensor<T>,
        running_mean: Tensor<T>,
        running_var: Tensor<T>,
        eps: T,
        ndim: usize,
    ) -> Result<Self> {
        for t in [&bias, &running_mean, &running_var] {
            if t.shape() != weight.shape() {
                return Err(RelPropError::IncompatibleShapes(
                    weight.shape().to_vec(),
                    t.shape().to_vec(),
                ));
            }
        }
        Ok(Self {
            weight,
            bias,
            running_mean,
            running_var,
            eps,
            ndim,
        })
    }

    fn check_input(&self, x: &Tensor<T>) -> Result<usize> {
        let features = self.weight.len();
        if x.ndim() != self.ndim || x.shape()[1] != features {
            return Err(RelPropError::ShapeMismatch {
                expected: vec![self.ndim, features],
                actual: x.shape().to_vec(),
            });
        }
        // Elements per channel plane.
        Ok(x.shape()[2..].iter().product())
    }

    fn apply(&self, x: &Tensor<T>) -> Result<Tensor<T>> {
        let inner = self.check_input(x)?;
        let features = self.weight.len();
        let mut out = x.clone();
        for (i, v) in out.data_mut().iter_mut().enumerate() {
            let c = (i / inner) % features;
            let std = (self.running_var.data()[c] + self.eps).sqrt();
            *v = (*v - self.running_mean.data()[c]) / std * self.weight.data()[c]
                + self.bias.data()[c];
        }
        Ok(out)
    }

    fn gradprop(&self, x: &Tensor<T>, s: &Tensor<T>) -> Result<Tensor<T>> {
        let inner = self.check_input(x)?;
        if s.shape() != x.shape() {
            return Err(RelPropError::IncompatibleShapes(
                s.shape().to_vec(),
                x.shape().to_vec(),
            ));
        }
        let features = self.weight.len();
        let mut out = s.clone();
        for (i, v) in out.data_mut().iter_mut().enumerate() {
            let c = (i / inner) % features;
            let std = (self.running_var.data()[c] + self.eps).sqrt();
            *v = *v * self.weight.data()[c] / std;
        }
        Ok(out)
    }

    /// Exact closed-form relevance rule.
    ///
    /// `scale_c = w_c / sqrt(running_var_c^2 + eps)`, `Z = X * scale + 1e-9`,
    /// `R' = X * (R / Z) * scale`. Note the running variance enters this
    /// rule squared, unlike in the forward normalization.
    fn relprop(&self, x: &Tensor<T>, r: &Tensor<T>) -> Result<Tensor<T>> {
        let inner = self.check_input(x)?;
        if r.shape() != x.shape() {
            return Err(RelPropError::IncompatibleShapes(
                r.shape().to_vec(),
                x.shape().to_vec(),
            ));
        }
        let features = self.weight.len();
        let tiny = T::from(1e-9).unwrap();
        let mut out = x.zeros_like();
        for i in 0..x.len() {
            let c = (i / inner) % features;
            let var = self.running_var.data()[c];
            let scale = self.weight.data()[c] / (var * var + self.eps).sqrt();
            let xv = x.data()[i];
            let z = xv * scale + tiny;
            out.data_mut()[i] = xv * (r.data()[i] / z) * scale;
        }
        Ok(out)
    }
}

macro_rules! batch_norm_layer {
    ($name:ident, $ndim:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone)]
        pub struct $name<T> {
            inner: BatchNorm<T>,
        }

        impl<T: Float> $name<T> {
            /// Creates a layer with unit scale, zero shift and unit running
            /// variance.
            pub fn new(num_features: usize) -> Self {
                Self {
                    inner: BatchNorm::new(num_features, $ndim),
                }
            }

            /// Creates a layer from trained parameters and running statistics.
            pub fn from_parts(
                weight: Tensor<T>,
                bias: Tensor<T>,
                running_mean: Tensor<T>,
                running_var: Tensor<T>,
                eps: T,
            ) -> Result<Self> {
                Ok(Self {
                    inner: BatchNorm::from_parts(
                        weight,
                        bias,
                        running_mean,
                        running_var,
                        eps,
                        $ndim,
                    )?,
                })
            }

            pub fn weight(&self) -> &Tensor<T> {
                &self.inner.weight
            }

            pub fn running_var(&self) -> &Tensor<T> {
                &self.inner.running_var
            }

            pub fn eps(&self) -> T {
                self.inner.eps
            }
        }

        impl<T: Float> Forward<T> for $name<T> {
            fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
                Ok(Value::One(self.inner.apply(input.one()?)?))
            }
        }

        impl<T: Float> RelevanceProvider<T> for $name<T> {
            fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
                Ok(Value::One(
                    self.inner
                        .gradprop(observation.input_one()?, seed.one()?)?,
                ))
            }

            fn relprop(
                &self,
                observation: &Observation<T>,
                r: Value<T>,
                _alpha: T,
            ) -> Result<Value<T>> {
                Ok(Value::One(
                    self.inner.relprop(observation.input_one()?, r.one()?)?,
                ))
            }
        }
    };
}

batch_norm_layer!(
    BatchNorm2d,
    4,
    "Inference-mode batch normalization over `[b, c, h, w]` inputs."
);
batch_norm_layer!(
    BatchNorm3d,
    5,
    "Inference-mode batch normalization over `[b, c, d, h, w]` inputs."
);
