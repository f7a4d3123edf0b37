//! Fully connected layer with the alpha/beta relevance rule.

use crate::{
    error::{RelPropError, Result},
    layers::{Forward, RelevanceProvider},
    linalg::{matmul, transpose},
    observe::{Observation, Value},
    ops::{
        arithmetic::{add, mul, mul_scalar, sub},
        elementwise::{clamp_max, clamp_min},
    },
    stabilize::safe_divide,
    tensor::Tensor,
};
use num_traits::Float;

/// A fully connected (affine) layer.
///
/// Forward: `y = x @ w^T + b` with `w` of shape `[out, in]`, over any number
/// of leading batch dimensions.
///
/// Relevance: the signed alpha/beta decomposition. Weights and observed
/// inputs are split into positive and negative parts; the activator flow
/// pairs same signs, the inhibitor flow pairs opposite signs, and the final
/// relevance is `alpha * activator - beta * inhibitor` with
/// `beta = alpha - 1`. The bias is excluded from the decomposition.
#[derive(Debug, Clone)]
pub struct Linear<T> {
    weight: Tensor<T>,
    bias: Option<Tensor<T>>,
}

impl<T: Float> Linear<T> {
    /// Creates a layer from a `[out, in]` weight and an optional `[out]` bias.
    pub fn new(weight: Tensor<T>, bias: Option<Tensor<T>>) -> Result<Self> {
        if weight.ndim() != 2 {
            return Err(RelPropError::InvalidShape(format!(
                "linear weight must be [out, in], got {:?}",
                weight.shape()
            )));
        }
        if let Some(b) = &bias {
            if b.ndim() != 1 || b.shape()[0] != weight.shape()[0] {
                return Err(RelPropError::IncompatibleShapes(
                    weight.shape().to_vec(),
                    b.shape().to_vec(),
                ));
            }
        }
        Ok(Self { weight, bias })
    }

    pub fn weight(&self) -> &Tensor<T> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor<T>> {
        self.bias.as_ref()
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    /// `x @ w^T` over flattened leading dimensions, without bias.
    fn affine(x: &Tensor<T>, weight: &Tensor<T>) -> Result<Tensor<T>> {
        let in_features = weight.shape()[1];
        let out_features = weight.shape()[0];
        if x.ndim() == 0 || x.shape()[x.ndim() - 1] != in_features {
            return Err(RelPropError::ShapeMismatch {
                expected: vec![in_features],
                actual: x.shape().to_vec(),
            });
        }
        let rows = x.len() / in_features;
        let flat = x.reshape(&[rows, in_features])?;
        let y = matmul(&flat, &transpose(weight)?)?;
        let mut shape = x.shape().to_vec();
        let last = shape.len() - 1;
        shape[last] = out_features;
        y.reshape(&shape)
    }

    /// Adjoint of [`Linear::affine`]: `s @ w`.
    fn affine_vjp(s: &Tensor<T>, weight: &Tensor<T>) -> Result<Tensor<T>> {
        let out_features = weight.shape()[0];
        let in_features = weight.shape()[1];
        if s.ndim() == 0 || s.shape()[s.ndim() - 1] != out_features {
            return Err(RelPropError::ShapeMismatch {
                expected: vec![out_features],
                actual: s.shape().to_vec(),
            });
        }
        let rows = s.len() / out_features;
        let flat = s.reshape(&[rows, out_features])?;
        let c = matmul(&flat, weight)?;
        let mut shape = s.shape().to_vec();
        let last = shape.len() - 1;
        shape[last] = in_features;
        c.reshape(&shape)
    }

    /// One signed flow: run the affine map twice with the given weight/input
    /// pairing, share a stabilized quotient against the summed partition
    /// function, and sum the two gradient-weighted contributions.
    fn flow(
        &self,
        w1: &Tensor<T>,
        w2: &Tensor<T>,
        x1: &Tensor<T>,
        x2: &Tensor<T>,
        r: &Tensor<T>,
    ) -> Result<Tensor<T>> {
        let z1 = Self::affine(x1, w1)?;
        let z2 = Self::affine(x2, w2)?;
        let z = add(&z1, &z2)?;
        let s = safe_divide(r, &z)?;
        let c1 = mul(x1, &Self::affine_vjp(&s, w1)?)?;
        let c2 = mul(x2, &Self::affine_vjp(&s, w2)?)?;
        add(&c1, &c2)
    }
}

impl<T: Float> Forward<T> for Linear<T> {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let mut y = Self::affine(input.one()?, &self.weight)?;
        if let Some(bias) = &self.bias {
            let out_features = bias.len();
            for (i, v) in y.data_mut().iter_mut().enumerate() {
                *v = *v + bias.data()[i % out_features];
            }
        }
        Ok(Value::One(y))
    }
}

impl<T: Float> RelevanceProvider<T> for Linear<T> {
    fn gradprop(&self, _observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        Ok(Value::One(Self::affine_vjp(seed.one()?, &self.weight)?))
    }

    fn relprop(&self, observation: &Observation<T>, r: Value<T>, alpha: T) -> Result<Value<T>> {
        let beta = alpha - T::one();
        let x = observation.input_one()?;
        let r = r.one()?;

        let pw = clamp_min(&self.weight, T::zero())?;
        let nw = clamp_max(&self.weight, T::zero())?;
        let px = clamp_min(x, T::zero())?;
        let nx = clamp_max(x, T::zero())?;

        let activator = self.flow(&pw, &nw, &px, &nx, r)?;
        let inhibitor = self.flow(&nw, &pw, &px, &nx, r)?;

        let weighted = sub(
            &mul_scalar(&activator, alpha)?,
            &mul_scalar(&inhibitor, beta)?,
        )?;
        Ok(Value::One(weighted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn layer() -> Linear<f64> {
        // w = [[1, -1], [1, 1]]
        let weight = Tensor::from_slice(&[1.0, -1.0, 1.0, 1.0], &[2, 2]).unwrap();
        Linear::new(weight, None).unwrap()
    }

    #[test]
    fn test_forward() {
        let linear = layer();
        let input = Value::One(Tensor::from_slice(&[2.0, 3.0], &[1, 2]).unwrap());
        let out = linear.apply(&input).unwrap();
        // z = [2 - 3, 2 + 3] = [-1, 5]
        assert_eq!(out.one().unwrap().data(), &[-1.0, 5.0]);
    }

    #[test]
    fn test_forward_with_bias() {
        let weight = Tensor::from_slice(&[1.0, 0.0, 0.0, 1.0], &[2, 2]).unwrap();
        let bias = Tensor::from_slice(&[10.0, 20.0], &[2]).unwrap();
        let linear = Linear::new(weight, Some(bias)).unwrap();
        let input = Value::One(Tensor::from_slice(&[1.0, 2.0], &[1, 2]).unwrap());
        let out = linear.apply(&input).unwrap();
        assert_eq!(out.one().unwrap().data(), &[11.0, 22.0]);
    }

    #[test]
    fn test_relprop_concentrates_on_activating_path() {
        // X = [2, 3], Z = [-1, 5], R = [0, 5], alpha = 1. Only the second
        // output unit carries relevance and both inputs contribute
        // positively to it through w[1] = [1, 1]: the activator partition
        // for that unit is 2 + 3 = 5, so the input relevance comes out as
        // [5 * 2/5, 5 * 3/5] = [2, 3].
        let linear = layer();
        let obs = linear
            .forward(Value::One(Tensor::from_slice(&[2.0, 3.0], &[1, 2]).unwrap()))
            .unwrap();
        let r = Value::One(Tensor::from_slice(&[0.0, 5.0], &[1, 2]).unwrap());
        let out = linear.relprop(&obs, r, 1.0).unwrap();
        let out = out.one().unwrap();
        assert_relative_eq!(out.data()[0], 2.0, epsilon = 1e-6);
        assert_relative_eq!(out.data()[1], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_relprop_alpha_one_ignores_inhibitor() {
        // beta = 0, so only the activator flow contributes; totals conserve.
        let linear = layer();
        let obs = linear
            .forward(Value::One(
                Tensor::from_slice(&[1.0, -2.0], &[1, 2]).unwrap(),
            ))
            .unwrap();
        let r = Value::One(Tensor::from_slice(&[1.0, 1.0], &[1, 2]).unwrap());
        let out = linear.relprop(&obs, r, 1.0).unwrap();

        // Recompute the activator flow by hand and compare.
        let x = Tensor::from_slice(&[1.0, -2.0], &[1, 2]).unwrap();
        let pw = clamp_min(linear.weight(), 0.0).unwrap();
        let nw = clamp_max(linear.weight(), 0.0).unwrap();
        let px = clamp_min(&x, 0.0).unwrap();
        let nx = clamp_max(&x, 0.0).unwrap();
        let r = Tensor::from_slice(&[1.0, 1.0], &[1, 2]).unwrap();
        let expected = linear.flow(&pw, &nw, &px, &nx, &r).unwrap();
        for (&got, &want) in out.one().unwrap().data().iter().zip(expected.data()) {
            assert_relative_eq!(got, want, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_relprop_deterministic() {
        let linear = layer();
        let obs = linear
            .forward(Value::One(
                Tensor::from_slice(&[0.5, -1.5], &[1, 2]).unwrap(),
            ))
            .unwrap();
        let r = Tensor::from_slice(&[0.3, 0.7], &[1, 2]).unwrap();
        let a = linear
            .relprop(&obs, Value::One(r.clone()), 2.0)
            .unwrap();
        let b = linear.relprop(&obs, Value::One(r), 2.0).unwrap();
        assert_eq!(a.one().unwrap().data(), b.one().unwrap().data());
    }
}
