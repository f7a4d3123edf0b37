//! 3-D convolution with relevance propagation.
//!
//! Same shape conventions as the 2-D layer, extended by a depth dimension:
//! `[batch, channels, depth, height, width]`. Volumetric inputs have no
//! pixel-bound rule; relevance always takes the signed alpha/beta path and
//! is halved on the way out.

use crate::{
    error::{RelPropError, Result},
    layers::{Forward, RelevanceProvider},
    observe::{Observation, Value},
    ops::{
        arithmetic::{add, mul, mul_scalar, sub},
        elementwise::{clamp_max, clamp_min},
    },
    stabilize::safe_divide,
    tensor::Tensor,
};
use num_traits::Float;

/// A 3-D convolution over `[batch, channels, depth, height, width]` tensors.
#[derive(Debug, Clone)]
pub struct Conv3d<T> {
    weight: Tensor<T>,
    bias: Option<Tensor<T>>,
    stride: (usize, usize, usize),
    padding: (usize, usize, usize),
}

impl<T: Float> Conv3d<T> {
    /// Creates a layer from a `[out_c, in_c, kd, kh, kw]` weight, an optional
    /// `[out_c]` bias, a stride and a zero padding.
    pub fn new(
        weight: Tensor<T>,
        bias: Option<Tensor<T>>,
        stride: (usize, usize, usize),
        padding: (usize, usize, usize),
    ) -> Result<Self> {
        if weight.ndim() != 5 {
            return Err(RelPropError::InvalidShape(format!(
                "conv3d weight must be [out_c, in_c, kd, kh, kw], got {:?}",
                weight.shape()
            )));
        }
        if stride.0 == 0 || stride.1 == 0 || stride.2 == 0 {
            return Err(RelPropError::InvalidShape(
                "conv3d stride must be non-zero".to_string(),
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

    fn conv(&self, x: &Tensor<T>, weight: &Tensor<T>) -> Result<Tensor<T>> {
        conv3d(x, weight, self.stride, self.padding)
    }

    fn conv_t(
        &self,
        s: &Tensor<T>,
        weight: &Tensor<T>,
        size: (usize, usize, usize),
    ) -> Result<Tensor<T>> {
        conv_transpose3d(s, weight, self.stride, self.padding, size)
    }

    /// One signed flow, stabilized per sign branch as in the 2-D layer.
    fn flow(
        &self,
        w1: &Tensor<T>,
        w2: &Tensor<T>,
        x1: &Tensor<T>,
        x2: &Tensor<T>,
        r: &Tensor<T>,
    ) -> Result<Tensor<T>> {
        let size = (x1.shape()[2], x1.shape()[3], x1.shape()[4]);
        let z1 = self.conv(x1, w1)?;
        let z2 = self.conv(x2, w2)?;
        let s1 = safe_divide(r, &z1)?;
        let s2 = safe_divide(r, &z2)?;
        let c1 = mul(x1, &self.conv_t(&s1, w1, size)?)?;
        let c2 = mul(x2, &self.conv_t(&s2, w2, size)?)?;
        add(&c1, &c2)
    }
}

impl<T: Float> Forward<T> for Conv3d<T> {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let mut y = self.conv(input.one()?, &self.weight)?;
        if let Some(bias) = &self.bias {
            let channels = bias.len();
            let inner = y.shape()[2] * y.shape()[3] * y.shape()[4];
            for (i, v) in y.data_mut().iter_mut().enumerate() {
                *v = *v + bias.data()[(i / inner) % channels];
            }
        }
        Ok(Value::One(y))
    }
}

impl<T: Float> RelevanceProvider<T> for Conv3d<T> {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let x = observation.input_one()?;
        let size = (x.shape()[2], x.shape()[3], x.shape()[4]);
        Ok(Value::One(self.conv_t(seed.one()?, &self.weight, size)?))
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
        let out = sub(
            &mul_scalar(&activator, alpha)?,
            &mul_scalar(&inhibitor, beta)?,
        )?;
        Ok(Value::One(mul_scalar(&out, T::from(0.5).unwrap())?))
    }
}

/// Naive direct convolution of `[b, in_c, d, h, w]` by `[out_c, in_c, kd, kh, kw]`.
pub fn conv3d<T: Float>(
    x: &Tensor<T>,
    weight: &Tensor<T>,
    stride: (usize, usize, usize),
    padding: (usize, usize, usize),
) -> Result<Tensor<T>> {
    if x.ndim() != 5 || weight.ndim() != 5 {
        return Err(RelPropError::InvalidShape(format!(
            "conv3d expects 5-D input and weight, got {:?} and {:?}",
            x.shape(),
            weight.shape()
        )));
    }
    let (batch, in_c) = (x.shape()[0], x.shape()[1]);
    let (id, ih, iw) = (x.shape()[2], x.shape()[3], x.shape()[4]);
    let out_c = weight.shape()[0];
    let (kd, kh, kw) = (weight.shape()[2], weight.shape()[3], weight.shape()[4]);
    if weight.shape()[1] != in_c {
        return Err(RelPropError::IncompatibleShapes(
            x.shape().to_vec(),
            weight.shape().to_vec(),
        ));
    }
    let (sd, sh, sw) = stride;
    let (pd, ph, pw) = padding;
    if id + 2 * pd < kd || ih + 2 * ph < kh || iw + 2 * pw < kw {
        return Err(RelPropError::IncompatibleShapes(
            x.shape().to_vec(),
            weight.shape().to_vec(),
        ));
    }
    let od = (id + 2 * pd - kd) / sd + 1;
    let oh = (ih + 2 * ph - kh) / sh + 1;
    let ow = (iw + 2 * pw - kw) / sw + 1;

    let mut out = Tensor::zeros(&[batch, out_c, od, oh, ow]);
    for b in 0..batch {
        for o in 0..out_c {
            for oz in 0..od {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut acc = T::zero();
                        for c in 0..in_c {
                            for kz in 0..kd {
                                let iz = (oz * sd + kz) as isize - pd as isize;
                                if iz < 0 || iz >= id as isize {
                                    continue;
                                }
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
                                        let xi = (((b * in_c + c) * id + iz as usize) * ih
                                            + iy as usize)
                                            * iw
                                            + ix as usize;
                                        let wi =
                                            (((o * in_c + c) * kd + kz) * kh + ky) * kw + kx;
                                        acc = acc + x.data()[xi] * weight.data()[wi];
                                    }
                                }
                            }
                        }
                        out.data_mut()[(((b * out_c + o) * od + oz) * oh + oy) * ow + ox] = acc;
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Adjoint of [`conv3d`] onto an input of spatial size `size`.
pub fn conv_transpose3d<T: Float>(
    s: &Tensor<T>,
    weight: &Tensor<T>,
    stride: (usize, usize, usize),
    padding: (usize, usize, usize),
    size: (usize, usize, usize),
) -> Result<Tensor<T>> {
    if s.ndim() != 5 || weight.ndim() != 5 {
        return Err(RelPropError::InvalidShape(format!(
            "conv_transpose3d expects 5-D input and weight, got {:?} and {:?}",
            s.shape(),
            weight.shape()
        )));
    }
    let (batch, out_c) = (s.shape()[0], s.shape()[1]);
    let (od, oh, ow) = (s.shape()[2], s.shape()[3], s.shape()[4]);
    let in_c = weight.shape()[1];
    let (kd, kh, kw) = (weight.shape()[2], weight.shape()[3], weight.shape()[4]);
    if weight.shape()[0] != out_c {
        return Err(RelPropError::IncompatibleShapes(
            s.shape().to_vec(),
            weight.shape().to_vec(),
        ));
    }
    let (sd, sh, sw) = stride;
    let (pd, ph, pw) = padding;
    let (id, ih, iw) = size;
    let min_d = (od - 1) * sd + kd;
    let min_h = (oh - 1) * sh + kh;
    let min_w = (ow - 1) * sw + kw;
    if id + 2 * pd < min_d || ih + 2 * ph < min_h || iw + 2 * pw < min_w {
        return Err(RelPropError::ShapeMismatch {
            expected: vec![min_d, min_h, min_w],
            actual: vec![id + 2 * pd, ih + 2 * ph, iw + 2 * pw],
        });
    }

    let mut out = Tensor::zeros(&[batch, in_c, id, ih, iw]);
    for b in 0..batch {
        for o in 0..out_c {
            for oz in 0..od {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let v = s.data()[(((b * out_c + o) * od + oz) * oh + oy) * ow + ox];
                        for c in 0..in_c {
                            for kz in 0..kd {
                                let iz = (oz * sd + kz) as isize - pd as isize;
                                if iz < 0 || iz >= id as isize {
                                    continue;
                                }
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
                                        let oi = (((b * in_c + c) * id + iz as usize) * ih
                                            + iy as usize)
                                            * iw
                                            + ix as usize;
                                        let wi =
                                            (((o * in_c + c) * kd + kz) * kh + ky) * kw + kx;
                                        out.data_mut()[oi] = out.data()[oi] + v * weight.data()[wi];
                                    }
                                }
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
    fn test_forward_sum_kernel() {
        let w = Tensor::ones(&[1, 1, 2, 2, 2]);
        let conv = Conv3d::new(w, None, (1, 1, 1), (0, 0, 0)).unwrap();
        let x = Tensor::from_slice(
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            &[1, 1, 2, 2, 2],
        )
        .unwrap();
        let y = conv.apply(&Value::One(x)).unwrap();
        assert_eq!(y.one().unwrap().shape(), &[1, 1, 1, 1, 1]);
        assert_eq!(y.one().unwrap().data(), &[36.0]);
    }

    #[test]
    fn test_transpose_is_adjoint() {
        let x = Tensor::from_slice(
            &[0.5, -1.0, 2.0, 0.0, 1.5, -0.5, 1.0, 2.5],
            &[1, 1, 2, 2, 2],
        )
        .unwrap();
        let w = Tensor::from_slice(&[1.0, -2.0], &[1, 1, 1, 1, 2]).unwrap();
        let z = conv3d(&x, &w, (1, 1, 1), (0, 0, 0)).unwrap();
        let s = Tensor::from_slice(&[1.0, 0.5, -1.0, 2.0], &[1, 1, 2, 2, 1]).unwrap();
        let back = conv_transpose3d(&s, &w, (1, 1, 1), (0, 0, 0), (2, 2, 2)).unwrap();

        let forward_pairing: f64 = z.data().iter().zip(s.data()).map(|(&a, &b)| a * b).sum();
        let backward_pairing: f64 = x.data().iter().zip(back.data()).map(|(&a, &b)| a * b).sum();
        assert_relative_eq!(forward_pairing, backward_pairing, epsilon = 1e-12);
    }

    #[test]
    fn test_relprop_halves_relevance() {
        let w = Tensor::ones(&[1, 1, 1, 2, 2]);
        let conv = Conv3d::new(w, None, (1, 1, 1), (0, 0, 0)).unwrap();
        let x = Tensor::from_slice(
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
            &[1, 1, 2, 2, 2],
        )
        .unwrap();
        let obs = conv.forward(Value::One(x)).unwrap();
        let r = Tensor::from_slice(&[2.0, 6.0], &[1, 1, 2, 1, 1]).unwrap();
        let out = conv.relprop(&obs, Value::One(r), 1.0).unwrap();
        assert_relative_eq!(sum(out.one().unwrap()), 8.0 / 2.0, epsilon = 1e-6);
    }
}
