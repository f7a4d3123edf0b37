//! 2-D convolution with relevance propagation.
//!
//! Two relevance rules live here. Inputs with three channels are treated as
//! images and redistributed with the pixel-bound rule, which anchors the
//! decomposition at the per-sample value range of the input. Everything else
//! goes through the signed alpha/beta decomposition. Both rules halve the
//! result before returning it.

use crate::{
    error::{RelPropError, Result},
    layers::{Forward, RelevanceProvider},
    observe::{Observation, Value},
    ops::{
        arithmetic::{add, add_scalar, div, mul, mul_scalar, sub},
        elementwise::{clamp_max, clamp_min},
        reduction::{sample_max, sample_min},
    },
    stabilize::safe_divide,
    tensor::Tensor,
};
use num_traits::Float;

/// A 2-D convolution over `[batch, channels, height, width]` tensors.
#[derive(Debug, Clone)]
pub struct Conv2d<T> {
    weight: Tensor<T>,
    bias: Option<Tensor<T>>,
    stride: (usize, usize),
    padding: (usize, usize),
}

impl<T: Float> Conv2d<T> {
    /// Creates a layer from a `[out_c, in_c, kh, kw]` weight, an optional
    /// `[out_c]` bias, a stride and a zero padding.
    pub fn new(
        weight: Tensor<T>,
        bias: Option<Tensor<T>>,
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Result<Self> {
        if weight.ndim() != 4 {
            return Err(RelPropError::InvalidShape(format!(
                "conv2d weight must be [out_c, in_c, kh, kw], got {:?}",
                weight.shape()
            )));
        }
        if stride.0 == 0 || stride.1 == 0 {
            return Err(RelPropError::InvalidShape(
                "conv2d stride must be non-zero".to_string(),
            ));
        }
        if let Some(b) = &bias {
            if b.ndim() != 1 || b.shape()[0] != weight.shape()[0] {
                return Err(RelPropError::IncompatibleShapes(
                    weight.shape().to_vec(),
                    b.shape().to_vec(),
                ));
            }
        }
        Ok(Self {
            weight,
            bias,
            stride,
            padding,
        })
    }

    pub fn weight(&self) -> &Tensor<T> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor<T>> {
        self.bias.as_ref()
    }

    pub fn in_channels(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn out_channels(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn kernel_size(&self) -> (usize, usize) {
        (self.weight.shape()[2], self.weight.shape()[3])
    }

    pub fn stride(&self) -> (usize, usize) {
        self.stride
    }

    pub fn padding(&self) -> (usize, usize) {
        self.padding
    }

    fn conv(&self, x: &Tensor<T>, weight: &Tensor<T>) -> Result<Tensor<T>> {
        conv2d(x, weight, self.stride, self.padding)
    }

    /// Transposed convolution back onto the observed input's spatial size.
    ///
    /// The target size stands in for the output padding of a strided
    /// transposed convolution: the stride can map several input sizes onto
    /// the same output size, and only the observation knows which one to
    /// restore.
    fn conv_t(&self, s: &Tensor<T>, weight: &Tensor<T>, size: (usize, usize)) -> Result<Tensor<T>> {
        conv_transpose2d(s, weight, self.stride, self.padding, size)
    }

    /// Pixel-bound rule for three-channel image inputs.
    ///
    /// The partition function is anchored at the per-sample value range:
    /// `Za = conv(X, W) - conv(L, W+) - conv(H, W-) + eps` with `L`/`H` the
    /// per-sample lower/upper bounds, and the quotient is projected back
    /// through all three convolutions.
    fn relprop_pixels(&self, x: &Tensor<T>, r: &Tensor<T>) -> Result<Tensor<T>> {
        let eps = T::from(1e-9).unwrap();
        let size = (x.shape()[2], x.shape()[3]);
        let pw = clamp_min(&self.weight, T::zero())?;
        let nw = clamp_max(&self.weight, T::zero())?;
        let lo = sample_min(x)?;
        let hi = sample_max(x)?;

        let za = sub(
            &sub(&self.conv(x, &self.weight)?, &self.conv(&lo, &pw)?)?,
            &self.conv(&hi, &nw)?,
        )?;
        let za = add_scalar(&za, eps)?;
        let s = div(r, &za)?;

        let c = mul(x, &self.conv_t(&s, &self.weight, size)?)?;
        let c = sub(&c, &mul(&lo, &self.conv_t(&s, &pw, size)?)?)?;
        sub(&c, &mul(&hi, &self.conv_t(&s, &nw, size)?)?)
    }

    /// One signed flow of the alpha/beta rule.
    ///
    /// Unlike the fully connected rule, each sign branch keeps its own
    /// stabilized quotient instead of sharing one over the summed partition
    /// function.
    fn flow(
        &self,
        w1: &Tensor<T>,
        w2: &Tensor<T>,
        x1: &Tensor<T>,
        x2: &Tensor<T>,
        r: &Tensor<T>,
    ) -> Result<Tensor<T>> {
        let size = (x1.shape()[2], x1.shape()[3]);
        let z1 = self.conv(x1, w1)?;
        let z2 = self.conv(x2, w2)?;
        let s1 = safe_divide(r, &z1)?;
        let s2 = safe_divide(r, &z2)?;
        let c1 = mul(x1, &self.conv_t(&s1, w1, size)?)?;
        let c2 = mul(x2, &self.conv_t(&s2, w2, size)?)?;
        add(&c1, &c2)
    }

    fn relprop_signed(&self, x: &Tensor<T>, r: &Tensor<T>, alpha: T) -> Result<Tensor<T>> {
        let beta = alpha - T::one();
        let pw = clamp_min(&self.weight, T::zero())?;
        let nw = clamp_max(&self.weight, T::zero())?;
        let px = clamp_min(x, T::zero())?;
        let nx = clamp_max(x, T::zero())?;

        let activator = self.flow(&pw, &nw, &px, &nx, r)?;
        let inhibitor = self.flow(&nw, &pw, &px, &nx, r)?;
        sub(
            &mul_scalar(&activator, alpha)?,
            &mul_scalar(&inhibitor, beta)?,
        )
    }
}

impl<T: Float> Forward<T> for Conv2d<T> {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let mut y = self.conv(input.one()?, &self.weight)?;
        if let Some(bias) = &self.bias {
            let channels = bias.len();
            let inner = y.shape()[2] * y.shape()[3];
            for (i, v) in y.data_mut().iter_mut().enumerate() {
                *v = *v + bias.data()[(i / inner) % channels];
            }
        }
        Ok(Value::One(y))
    }
}

impl<T: Float> RelevanceProvider<T> for Conv2d<T> {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let x = observation.input_one()?;
        let size = (x.shape()[2], x.shape()[3]);
        Ok(Value::One(self.conv_t(seed.one()?, &self.weight, size)?))
    }

    fn relprop(&self, observation: &Observation<T>, r: Value<T>, alpha: T) -> Result<Value<T>> {
        let x = observation.input_one()?;
        let r = r.one()?;
        let out = if x.shape()[1] == 3 {
            self.relprop_pixels(x, r)?
        } else {
            self.relprop_signed(x, r, alpha)?
        };
        Ok(Value::One(mul_scalar(&out, T::from(0.5).unwrap())?))
    }
}

/// Naive direct convolution of `[b, in_c, h, w]` by `[out_c, in_c, kh, kw]`.
pub fn conv2d<T: Float>(
    x: &Tensor<T>,
    weight: &Tensor<T>,
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<Tensor<T>> {
    if x.ndim() != 4 || weight.ndim() != 4 {
        return Err(RelPropError::InvalidShape(format!(
            "conv2d expects 4-D input and weight, got {:?} and {:?}",
            x.shape(),
            weight.shape()
        )));
    }
    let (batch, in_c, ih, iw) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
    let (out_c, kh, kw) = (weight.shape()[0], weight.shape()[2], weight.shape()[3]);
    if weight.shape()[1] != in_c {
        return Err(RelPropError::IncompatibleShapes(
            x.shape().to_vec(),
            weight.shape().to_vec(),
        ));
    }
    let (sh, sw) = stride;
    let (ph, pw) = padding;
    if ih + 2 * ph < kh || iw + 2 * pw < kw {
        return Err(RelPropError::IncompatibleShapes(
            x.shape().to_vec(),
            weight.shape().to_vec(),
        ));
    }
    let oh = (ih + 2 * ph - kh) / sh + 1;
    let ow = (iw + 2 * pw - kw) / sw + 1;

    let mut out = Tensor::zeros(&[batch, out_c, oh, ow]);
    for b in 0..batch {
        for o in 0..out_c {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = T::zero();
                    for c in 0..in_c {
                        for ky in 0..kh {
                            let iy = (oy * sh + ky) as isize - ph as isize;
                            if iy < 0 || iy >= ih as isize {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (ox * sw + kx) as isize - pw as isize;
                                if ix < 0 || ix >= iw as isize {
                                    continue;
                                }
                                let xi = ((b * in_c + c) * ih + iy as usize) * iw + ix as usize;
                                let wi = ((o * in_c + c) * kh + ky) * kw + kx;
                                acc = acc + x.data()[xi] * weight.data()[wi];
                            }
                        }
                    }
                    out.data_mut()[((b * out_c + o) * oh + oy) * ow + ox] = acc;
                }
            }
        }
    }
    Ok(out)
}

/// Adjoint of [`conv2d`]: scatters `s` back through the kernel onto an input
/// of spatial size `size`.
///
/// `size` must be a valid preimage size of `s` under the given stride and
/// padding, which the observed input guarantees.
pub fn conv_transpose2d<T: Float>(
    s: &Tensor<T>,
    weight: &Tensor<T>,
    stride: (usize, usize),
    padding: (usize, usize),
    size: (usize, usize),
) -> Result<Tensor<T>> {
    if s.ndim() != 4 || weight.ndim() != 4 {
        return Err(RelPropError::InvalidShape(format!(
            "conv_transpose2d expects 4-D input and weight, got {:?} and {:?}",
            s.shape(),
            weight.shape()
        )));
    }
    let (batch, out_c, oh, ow) = (s.shape()[0], s.shape()[1], s.shape()[2], s.shape()[3]);
    let (in_c, kh, kw) = (weight.shape()[1], weight.shape()[2], weight.shape()[3]);
    if weight.shape()[0] != out_c {
        return Err(RelPropError::IncompatibleShapes(
            s.shape().to_vec(),
            weight.shape().to_vec(),
        ));
    }
    let (sh, sw) = stride;
    let (ph, pw) = padding;
    let (ih, iw) = size;
    let min_h = (oh - 1) * sh + kh;
    let min_w = (ow - 1) * sw + kw;
    if ih + 2 * ph < min_h || iw + 2 * pw < min_w {
        return Err(RelPropError::ShapeMismatch {
            expected: vec![min_h, min_w],
            actual: vec![ih + 2 * ph, iw + 2 * pw],
        });
    }

    let mut out = Tensor::zeros(&[batch, in_c, ih, iw]);
    for b in 0..batch {
        for o in 0..out_c {
            for oy in 0..oh {
                for ox in 0..ow {
                    let v = s.data()[((b * out_c + o) * oh + oy) * ow + ox];
                    for c in 0..in_c {
                        for ky in 0..kh {
                            let iy = (oy * sh + ky) as isize - ph as isize;
                            if iy < 0 || iy >= ih as isize {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (ox * sw + kx) as isize - pw as isize;
                                if ix < 0 || ix >= iw as isize {
                                    continue;
                                }
                                let oi = ((b * in_c + c) * ih + iy as usize) * iw + ix as usize;
                                let wi = ((o * in_c + c) * kh + ky) * kw + kx;
                                out.data_mut()[oi] = out.data()[oi] + v * weight.data()[wi];
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::reduction::sum;
    use approx::assert_relative_eq;

    #[test]
    fn test_forward_identity_kernel() {
        // 1x1 kernel of weight 2 just scales every element.
        let w = Tensor::from_slice(&[2.0f64], &[1, 1, 1, 1]).unwrap();
        let conv = Conv2d::new(w, None, (1, 1), (0, 0)).unwrap();
        let x = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]).unwrap();
        let y = conv.apply(&Value::One(x)).unwrap();
        assert_eq!(y.one().unwrap().data(), &[2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_forward_sum_kernel_with_bias() {
        // 2x2 kernel of ones sums each window.
        let w = Tensor::ones(&[1, 1, 2, 2]);
        let b = Tensor::from_slice(&[10.0f64], &[1]).unwrap();
        let conv = Conv2d::new(w, Some(b), (1, 1), (0, 0)).unwrap();
        let x = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]).unwrap();
        let y = conv.apply(&Value::One(x)).unwrap();
        assert_eq!(y.one().unwrap().shape(), &[1, 1, 1, 1]);
        assert_eq!(y.one().unwrap().data(), &[20.0]);
    }

    #[test]
    fn test_transpose_is_adjoint() {
        // <conv(x, w), s> must equal <x, conv_t(s, w)>.
        let x = Tensor::from_slice(
            &[0.5, -1.0, 2.0, 0.0, 1.5, -0.5, 1.0, 2.5, -2.0],
            &[1, 1, 3, 3],
        )
        .unwrap();
        let w = Tensor::from_slice(&[1.0, -2.0, 0.5, 3.0], &[1, 1, 2, 2]).unwrap();
        let z = conv2d(&x, &w, (1, 1), (0, 0)).unwrap();
        let s = Tensor::from_slice(&[1.0, 2.0, -1.0, 0.5], &[1, 1, 2, 2]).unwrap();
        let back = conv_transpose2d(&s, &w, (1, 1), (0, 0), (3, 3)).unwrap();

        let forward_pairing: f64 = z.data().iter().zip(s.data()).map(|(&a, &b)| a * b).sum();
        let backward_pairing: f64 = x.data().iter().zip(back.data()).map(|(&a, &b)| a * b).sum();
        assert_relative_eq!(forward_pairing, backward_pairing, epsilon = 1e-12);
    }

    #[test]
    fn test_strided_transpose_restores_odd_size() {
        // Stride 2 maps both 4 and 5 onto output size 2; the target size
        // disambiguates.
        let w: Tensor<f64> = Tensor::ones(&[1, 1, 2, 2]);
        let s = Tensor::ones(&[1, 1, 2, 2]);
        let back = conv_transpose2d(&s, &w, (2, 2), (0, 0), (5, 5)).unwrap();
        assert_eq!(back.shape(), &[1, 1, 5, 5]);
    }

    #[test]
    fn test_relprop_halves_relevance() {
        // All-positive input and weight: the activator flow conserves the
        // incoming relevance and the inhibitor flow is zero, so the final
        // halving leaves exactly half the total.
        let w = Tensor::ones(&[1, 1, 2, 2]);
        let conv = Conv2d::new(w, None, (1, 1), (0, 0)).unwrap();
        let x = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0], &[1, 1, 3, 3])
            .unwrap();
        let obs = conv.forward(Value::One(x)).unwrap();
        let r = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]).unwrap();
        let out = conv.relprop(&obs, Value::One(r), 1.0).unwrap();
        assert_relative_eq!(sum(out.one().unwrap()), 10.0 / 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_relprop_image_branch_shape() {
        // Three input channels route through the pixel-bound rule.
        let w = Tensor::from_slice(
            &[0.5, -0.25, 1.0, 0.75, -0.5, 0.25],
            &[2, 3, 1, 1],
        )
        .unwrap();
        let conv = Conv2d::new(w, None, (1, 1), (0, 0)).unwrap();
        let x = Tensor::from_slice(
            &[1.0, -2.0, 3.0, 0.5, 1.5, -0.5, 2.0, 0.0, -1.0, 1.0, 0.25, 0.75],
            &[1, 3, 2, 2],
        )
        .unwrap();
        let obs = conv.forward(Value::One(x)).unwrap();
        let r = Tensor::ones(&[1, 2, 2, 2]);
        let out = conv.relprop(&obs, Value::One(r.clone()), 1.0).unwrap();
        assert_eq!(out.one().unwrap().shape(), &[1, 3, 2, 2]);

        let again = conv.relprop(&obs, Value::One(r), 1.0).unwrap();
        assert_eq!(out.one().unwrap().data(), again.one().unwrap().data());
    }
}
