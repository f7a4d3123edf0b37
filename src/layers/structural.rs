//! Structural layers: joins, fan-out and reindexing.
//!
//! These layers reshape the flow of tensors rather than their values, so
//! almost all of them redistribute relevance with the generic rule. The one
//! exception is [`Add`], whose two summands would otherwise swallow each
//! other's relevance when they carry opposite signs; it rebalances the two
//! branch totals explicitly.

use crate::{
    error::{RelPropError, Result},
    layers::{relprop_simple, Forward, RelevanceProvider},
    observe::{Observation, Value},
    ops::{
        arithmetic::{add, mul, mul_scalar},
        einsum, einsum_vjp,
        reduction::sum,
        structure::{concat, index_scatter, index_select, split_sections},
    },
    stabilize::{safe_divide, safe_divide_scalar},
    tensor::Tensor,
};
use num_traits::Float;

/// Element-wise addition of two tensors.
#[derive(Debug, Clone, Default)]
pub struct Add;

impl Add {
    pub fn new() -> Self {
        Self
    }
}

impl<T: Float> Forward<T> for Add {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let inputs = input.many_exactly(2)?;
        Ok(Value::One(add(&inputs[0], &inputs[1])?))
    }
}

impl<T: Float> RelevanceProvider<T> for Add {
    fn gradprop(&self, _observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let s = seed.one()?;
        Ok(Value::Many(vec![s.clone(), s.clone()]))
    }

    /// Splits relevance between the two summands, then rebalances the branch
    /// totals.
    ///
    /// The raw per-element split `x_i * R / Z` can assign relevance of
    /// opposite signs to the two branches that cancels in the total. The
    /// branch totals are therefore renormalized to magnitudes proportional
    /// to `|sum(a)| : |sum(b)|`, preserving the incoming total.
    fn relprop(&self, observation: &Observation<T>, r: Value<T>, _alpha: T) -> Result<Value<T>> {
        let inputs = observation.input.many_exactly(2)?;
        let r = r.one()?;
        let z = add(&inputs[0], &inputs[1])?;
        let s = safe_divide(r, &z)?;
        let a = mul(&inputs[0], &s)?;
        let b = mul(&inputs[1], &s)?;

        let r_total = sum(r);
        let a_total = sum(&a);
        let b_total = sum(&b);
        let magnitude = a_total.abs() + b_total.abs();
        let a_target = safe_divide_scalar(a_total.abs(), magnitude) * r_total;
        let b_target = safe_divide_scalar(b_total.abs(), magnitude) * r_total;

        let a = mul_scalar(&a, safe_divide_scalar(a_target, a_total))?;
        let b = mul_scalar(&b, safe_divide_scalar(b_target, b_total))?;
        Ok(Value::Many(vec![a, b]))
    }
}

/// Fans a single tensor out into `num` identical copies.
///
/// The relevance of the copies flows back onto the one source, summed
/// through the generic rule.
#[derive(Debug, Clone)]
pub struct Replicate {
    num: usize,
}

impl Replicate {
    pub fn new(num: usize) -> Self {
        Self { num }
    }

    pub fn num(&self) -> usize {
        self.num
    }
}

impl<T: Float> Forward<T> for Replicate {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let x = input.one()?;
        Ok(Value::Many(vec![x.clone(); self.num]))
    }
}

impl<T: Float> RelevanceProvider<T> for Replicate {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let seeds = seed.many_exactly(self.num)?;
        let x = observation.input_one()?;
        let mut acc = Tensor::zeros_like(x);
        for s in seeds {
            acc = add(&acc, s)?;
        }
        Ok(Value::One(acc))
    }

    fn relprop(&self, observation: &Observation<T>, r: Value<T>, _alpha: T) -> Result<Value<T>> {
        relprop_simple(self, observation, &r)
    }
}

/// Concatenation of several tensors along a fixed dimension.
#[derive(Debug, Clone)]
pub struct Cat {
    dim: usize,
}

impl Cat {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl<T: Float> Forward<T> for Cat {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let inputs = input.many()?;
        let refs: Vec<&Tensor<T>> = inputs.iter().collect();
        Ok(Value::One(concat(&refs, self.dim)?))
    }
}

impl<T: Float> RelevanceProvider<T> for Cat {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let inputs = observation.input.many()?;
        let sections: Vec<usize> = inputs.iter().map(|t| t.shape()[self.dim]).collect();
        Ok(Value::Many(split_sections(
            seed.one()?,
            self.dim,
            &sections,
        )?))
    }

    fn relprop(&self, observation: &Observation<T>, r: Value<T>, _alpha: T) -> Result<Value<T>> {
        relprop_simple(self, observation, &r)
    }
}

/// Selection of a fixed set of indices along a fixed dimension.
#[derive(Debug, Clone)]
pub struct IndexSelect {
    dim: usize,
    indices: Vec<usize>,
}

impl IndexSelect {
    pub fn new(dim: usize, indices: Vec<usize>) -> Self {
        Self { dim, indices }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl<T: Float> Forward<T> for IndexSelect {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        Ok(Value::One(index_select(
            input.one()?,
            self.dim,
            &self.indices,
        )?))
    }
}

impl<T: Float> RelevanceProvider<T> for IndexSelect {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let x = observation.input_one()?;
        Ok(Value::One(index_scatter(
            seed.one()?,
            self.dim,
            &self.indices,
            x.shape(),
        )?))
    }

    fn relprop(&self, observation: &Observation<T>, r: Value<T>, _alpha: T) -> Result<Value<T>> {
        relprop_simple(self, observation, &r)
    }
}

/// Adds the identity matrix to the two trailing dimensions.
///
/// Used on attention maps of shape `[batch, heads, len, len]` to account for
/// the residual connection before relevance enters the map.
#[derive(Debug, Clone, Default)]
pub struct AddEye;

impl AddEye {
    pub fn new() -> Self {
        Self
    }
}

impl<T: Float> Forward<T> for AddEye {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let x = input.one()?;
        let ndim = x.ndim();
        if ndim < 2 || x.shape()[ndim - 1] != x.shape()[ndim - 2] {
            return Err(RelPropError::InvalidShape(format!(
                "add-eye needs square trailing dimensions, got {:?}",
                x.shape()
            )));
        }
        let n = x.shape()[ndim - 1];
        let mut out = x.clone();
        for block in 0..x.len() / (n * n) {
            for i in 0..n {
                let idx = block * n * n + i * n + i;
                out.data_mut()[idx] = out.data()[idx] + T::one();
            }
        }
        Ok(Value::One(out))
    }
}

impl<T: Float> RelevanceProvider<T> for AddEye {
    fn gradprop(&self, _observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        Ok(seed.clone())
    }

    fn relprop(&self, observation: &Observation<T>, r: Value<T>, _alpha: T) -> Result<Value<T>> {
        relprop_simple(self, observation, &r)
    }
}

/// Two-operand einsum contraction as a layer.
///
/// The equation is fixed at construction, e.g. `"bhid,bhjd->bhij"` for
/// attention scores; relevance flows back onto both operands through the
/// generic rule with the contraction's exact adjoints.
#[derive(Debug, Clone)]
pub struct Einsum {
    equation: String,
}

impl Einsum {
    pub fn new(equation: impl Into<String>) -> Self {
        Self {
            equation: equation.into(),
        }
    }

    pub fn equation(&self) -> &str {
        &self.equation
    }
}

impl<T: Float> Forward<T> for Einsum {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let inputs = input.many_exactly(2)?;
        Ok(Value::One(einsum(&self.equation, &inputs[0], &inputs[1])?))
    }
}

impl<T: Float> RelevanceProvider<T> for Einsum {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let inputs = observation.input.many_exactly(2)?;
        let s = seed.one()?;
        let da = einsum_vjp(&self.equation, &inputs[0], &inputs[1], s, 0)?;
        let db = einsum_vjp(&self.equation, &inputs[0], &inputs[1], s, 1)?;
        Ok(Value::Many(vec![da, db]))
    }

    fn relprop(&self, observation: &Observation<T>, r: Value<T>, _alpha: T) -> Result<Value<T>> {
        relprop_simple(self, observation, &r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_add_forward() {
        let layer = Add::new();
        let input = Value::Many(vec![
            Tensor::from_slice(&[1.0f64, 2.0], &[2]).unwrap(),
            Tensor::from_slice(&[10.0f64, 20.0], &[2]).unwrap(),
        ]);
        let out = layer.apply(&input).unwrap();
        assert_eq!(out.one().unwrap().data(), &[11.0, 22.0]);
    }

    #[test]
    fn test_add_relprop_proportional_and_conserving() {
        // x0 = [1], x1 = [3], R = [4]: branch totals 1 and 3 already sum to
        // R, so the rebalancing is the identity here.
        let layer = Add::new();
        let obs = layer
            .forward(Value::Many(vec![
                Tensor::from_slice(&[1.0f64], &[1]).unwrap(),
                Tensor::from_slice(&[3.0f64], &[1]).unwrap(),
            ]))
            .unwrap();
        let r = Value::One(Tensor::from_slice(&[4.0f64], &[1]).unwrap());
        let out = layer.relprop(&obs, r, 1.0).unwrap();
        let parts = out.many().unwrap();
        assert_relative_eq!(parts[0].data()[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(parts[1].data()[0], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_add_relprop_rebalances_opposite_signs() {
        // x0 = [4], x1 = [-2], Z = [2], R = [2]. The raw split is a = 4,
        // b = -2; rebalancing keeps totals proportional to |4| : |-2| and
        // summing to R.
        let layer = Add::new();
        let obs = layer
            .forward(Value::Many(vec![
                Tensor::from_slice(&[4.0f64], &[1]).unwrap(),
                Tensor::from_slice(&[-2.0f64], &[1]).unwrap(),
            ]))
            .unwrap();
        let r = Value::One(Tensor::from_slice(&[2.0f64], &[1]).unwrap());
        let out = layer.relprop(&obs, r, 1.0).unwrap();
        let parts = out.many().unwrap();
        let a = parts[0].data()[0];
        let b = parts[1].data()[0];
        assert_relative_eq!(a + b, 2.0, epsilon = 1e-6);
        assert_relative_eq!(a, 2.0 * 4.0 / 6.0 * 2.0 / 2.0, epsilon = 1e-6);
        assert_relative_eq!(a / b, 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_replicate_round_trip() {
        // Relevance pushed into the copies comes back as their sum.
        let layer = Replicate::new(2);
        let obs = layer
            .forward(Value::One(Tensor::from_slice(&[2.0f64, 4.0], &[2]).unwrap()))
            .unwrap();
        let r = Value::Many(vec![
            Tensor::from_slice(&[1.0f64, 2.0], &[2]).unwrap(),
            Tensor::from_slice(&[3.0f64, 4.0], &[2]).unwrap(),
        ]);
        let out = layer.relprop(&obs, r, 1.0).unwrap();
        let out = out.one().unwrap();
        assert_relative_eq!(out.data()[0], 4.0, epsilon = 1e-6);
        assert_relative_eq!(out.data()[1], 6.0, epsilon = 1e-6);
    }

    #[test]
    fn test_cat_round_trip() {
        // For non-zero inputs the generic rule reduces to splitting R back
        // into the original sections.
        let layer = Cat::new(1);
        let obs = layer
            .forward(Value::Many(vec![
                Tensor::from_slice(&[1.0f64, 2.0], &[1, 2]).unwrap(),
                Tensor::from_slice(&[3.0f64], &[1, 1]).unwrap(),
            ]))
            .unwrap();
        let r = Value::One(Tensor::from_slice(&[0.5f64, 1.0, 1.5], &[1, 3]).unwrap());
        let out = layer.relprop(&obs, r, 1.0).unwrap();
        let parts = out.many().unwrap();
        assert_eq!(parts.len(), 2);
        assert_relative_eq!(parts[0].data()[0], 0.5, epsilon = 1e-6);
        assert_relative_eq!(parts[0].data()[1], 1.0, epsilon = 1e-6);
        assert_relative_eq!(parts[1].data()[0], 1.5, epsilon = 1e-6);
    }

    #[test]
    fn test_index_select_relprop_scatters() {
        let layer = IndexSelect::new(1, vec![2]);
        let obs = layer
            .forward(Value::One(
                Tensor::from_slice(&[1.0f64, 2.0, 3.0], &[1, 3]).unwrap(),
            ))
            .unwrap();
        let r = Value::One(Tensor::from_slice(&[6.0f64], &[1, 1]).unwrap());
        let out = layer.relprop(&obs, r, 1.0).unwrap();
        assert_eq!(out.one().unwrap().data(), &[0.0, 0.0, 6.0]);
    }

    #[test]
    fn test_add_eye_forward() {
        let layer = AddEye::new();
        let x = Tensor::from_slice(&[1.0f64, 2.0, 3.0, 4.0], &[1, 1, 2, 2]).unwrap();
        let out = layer.apply(&Value::One(x)).unwrap();
        assert_eq!(out.one().unwrap().data(), &[2.0, 2.0, 3.0, 5.0]);
    }

    #[test]
    fn test_add_eye_rejects_non_square() {
        let layer = AddEye::new();
        let x = Tensor::<f64>::zeros(&[1, 2, 3]);
        assert!(Forward::<f64>::apply(&layer, &Value::One(x)).is_err());
    }

    #[test]
    fn test_einsum_layer_matmul() {
        let layer = Einsum::new("ij,jk->ik");
        let input = Value::Many(vec![
            Tensor::from_slice(&[1.0f64, 2.0, 3.0, 4.0], &[2, 2]).unwrap(),
            Tensor::from_slice(&[1.0f64, 0.0, 0.0, 1.0], &[2, 2]).unwrap(),
        ]);
        let obs = layer.forward(input).unwrap();
        assert_eq!(obs.output_one().unwrap().data(), &[1.0, 2.0, 3.0, 4.0]);

        let r = Value::One(Tensor::ones(&[2, 2]));
        let out = layer.relprop(&obs, r, 1.0).unwrap();
        let parts = out.many().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].shape(), &[2, 2]);
        assert_eq!(parts[1].shape(), &[2, 2]);
    }
}
