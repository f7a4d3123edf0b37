//! Pooling layers.
//!
//! All pooling layers redistribute relevance with the generic deep Taylor
//! rule: divide by the recomputed pooled output, project the quotient back
//! through the pool's derivative, multiply by the observed input. For max
//! pooling the derivative routes everything to the window maximum; for
//! average pooling it spreads uniformly over the window.

use crate::{
    error::{RelPropError, Result},
    layers::{relprop_simple, Forward, RelevanceProvider},
    observe::{Observation, Value},
    tensor::Tensor,
};
use num_traits::Float;

fn check_rank<T: Float>(x: &Tensor<T>, rank: usize) -> Result<()> {
    if x.ndim() != rank {
        return Err(RelPropError::InvalidShape(format!(
            "pool expects a {}-D input, got {:?}",
            rank,
            x.shape()
        )));
    }
    Ok(())
}

fn pooled_len(input: usize, kernel: usize, stride: usize) -> Result<usize> {
    if kernel == 0 || stride == 0 || input < kernel {
        return Err(RelPropError::InvalidShape(format!(
            "cannot pool extent {} with kernel {} and stride {}",
            input, kernel, stride
        )));
    }
    Ok((input - kernel) / stride + 1)
}

/// 2-D max pooling over `[batch, channels, height, width]` tensors.
#[derive(Debug, Clone)]
pub struct MaxPool2d {
    kernel: (usize, usize),
    stride: (usize, usize),
}

impl MaxPool2d {
    pub fn new(kernel: (usize, usize), stride: (usize, usize)) -> Self {
        Self { kernel, stride }
    }

    /// Index of the window maximum, first occurrence winning ties so that
    /// repeated propagation stays bit-identical.
    fn argmax<T: Float>(
        x: &Tensor<T>,
        base: usize,
        iw: usize,
        oy: usize,
        ox: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
    ) -> usize {
        let mut best = base + (oy * stride.0) * iw + ox * stride.1;
        let mut best_val = x.data()[best];
        for ky in 0..kernel.0 {
            for kx in 0..kernel.1 {
                let idx = base + (oy * stride.0 + ky) * iw + ox * stride.1 + kx;
                if x.data()[idx] > best_val {
                    best = idx;
                    best_val = x.data()[idx];
                }
            }
        }
        best
    }
}

impl<T: Float> Forward<T> for MaxPool2d {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let x = input.one()?;
        check_rank(x, 4)?;
        let (batch, ch, ih, iw) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
        let oh = pooled_len(ih, self.kernel.0, self.stride.0)?;
        let ow = pooled_len(iw, self.kernel.1, self.stride.1)?;
        let mut out = Tensor::zeros(&[batch, ch, oh, ow]);
        for bc in 0..batch * ch {
            let base = bc * ih * iw;
            for oy in 0..oh {
                for ox in 0..ow {
                    let idx = Self::argmax(x, base, iw, oy, ox, self.kernel, self.stride);
                    out.data_mut()[(bc * oh + oy) * ow + ox] = x.data()[idx];
                }
            }
        }
        Ok(Value::One(out))
    }
}

impl<T: Float> RelevanceProvider<T> for MaxPool2d {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let x = observation.input_one()?;
        let s = seed.one()?;
        check_rank(x, 4)?;
        let (batch, ch, ih, iw) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
        let (oh, ow) = (s.shape()[2], s.shape()[3]);
        let mut out = Tensor::zeros_like(x);
        for bc in 0..batch * ch {
            let base = bc * ih * iw;
            for oy in 0..oh {
                for ox in 0..ow {
                    let idx = Self::argmax(x, base, iw, oy, ox, self.kernel, self.stride);
                    let v = s.data()[(bc * oh + oy) * ow + ox];
                    out.data_mut()[idx] = out.data()[idx] + v;
                }
            }
        }
        Ok(Value::One(out))
    }

    fn relprop(&self, observation: &Observation<T>, r: Value<T>, _alpha: T) -> Result<Value<T>> {
        relprop_simple(self, observation, &r)
    }
}

/// 3-D max pooling over `[batch, channels, depth, height, width]` tensors.
#[derive(Debug, Clone)]
pub struct MaxPool3d {
    kernel: (usize, usize, usize),
    stride: (usize, usize, usize),
}

impl MaxPool3d {
    pub fn new(kernel: (usize, usize, usize), stride: (usize, usize, usize)) -> Self {
        Self { kernel, stride }
    }

    fn argmax<T: Float>(
        &self,
        x: &Tensor<T>,
        base: usize,
        ih: usize,
        iw: usize,
        oz: usize,
        oy: usize,
        ox: usize,
    ) -> usize {
        let start =
            base + ((oz * self.stride.0) * ih + oy * self.stride.1) * iw + ox * self.stride.2;
        let mut best = start;
        let mut best_val = x.data()[start];
        for kz in 0..self.kernel.0 {
            for ky in 0..self.kernel.1 {
                for kx in 0..self.kernel.2 {
                    let idx = base
                        + ((oz * self.stride.0 + kz) * ih + oy * self.stride.1 + ky) * iw
                        + ox * self.stride.2
                        + kx;
                    if x.data()[idx] > best_val {
                        best = idx;
                        best_val = x.data()[idx];
                    }
                }
            }
        }
        best
    }
}

impl<T: Float> Forward<T> for MaxPool3d {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let x = input.one()?;
        check_rank(x, 5)?;
        let (batch, ch) = (x.shape()[0], x.shape()[1]);
        let (id, ih, iw) = (x.shape()[2], x.shape()[3], x.shape()[4]);
        let od = pooled_len(id, self.kernel.0, self.stride.0)?;
        let oh = pooled_len(ih, self.kernel.1, self.stride.1)?;
        let ow = pooled_len(iw, self.kernel.2, self.stride.2)?;
        let mut out = Tensor::zeros(&[batch, ch, od, oh, ow]);
        for bc in 0..batch * ch {
            let base = bc * id * ih * iw;
            for oz in 0..od {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let idx = self.argmax(x, base, ih, iw, oz, oy, ox);
                        out.data_mut()[((bc * od + oz) * oh + oy) * ow + ox] = x.data()[idx];
                    }
                }
            }
        }
        Ok(Value::One(out))
    }
}

impl<T: Float> RelevanceProvider<T> for MaxPool3d {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let x = observation.input_one()?;
        let s = seed.one()?;
        check_rank(x, 5)?;
        let (batch, ch) = (x.shape()[0], x.shape()[1]);
        let (id, ih, iw) = (x.shape()[2], x.shape()[3], x.shape()[4]);
        let (od, oh, ow) = (s.shape()[2], s.shape()[3], s.shape()[4]);
        let mut out = Tensor::zeros_like(x);
        for bc in 0..batch * ch {
            let base = bc * id * ih * iw;
            for oz in 0..od {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let idx = self.argmax(x, base, ih, iw, oz, oy, ox);
                        let v = s.data()[((bc * od + oz) * oh + oy) * ow + ox];
                        out.data_mut()[idx] = out.data()[idx] + v;
                    }
                }
            }
        }
        Ok(Value::One(out))
    }

    fn relprop(&self, observation: &Observation<T>, r: Value<T>, _alpha: T) -> Result<Value<T>> {
        relprop_simple(self, observation, &r)
    }
}

/// 2-D average pooling over `[batch, channels, height, width]` tensors.
#[derive(Debug, Clone)]
pub struct AvgPool2d {
    kernel: (usize, usize),
    stride: (usize, usize),
}

impl AvgPool2d {
    pub fn new(kernel: (usize, usize), stride: (usize, usize)) -> Self {
        Self { kernel, stride }
    }
}

impl<T: Float> Forward<T> for AvgPool2d {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let x = input.one()?;
        check_rank(x, 4)?;
        let (batch, ch, ih, iw) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
        let oh = pooled_len(ih, self.kernel.0, self.stride.0)?;
        let ow = pooled_len(iw, self.kernel.1, self.stride.1)?;
        let norm = T::from(self.kernel.0 * self.kernel.1).unwrap();
        let mut out = Tensor::zeros(&[batch, ch, oh, ow]);
        for bc in 0..batch * ch {
            let base = bc * ih * iw;
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = T::zero();
                    for ky in 0..self.kernel.0 {
                        for kx in 0..self.kernel.1 {
                            acc = acc
                                + x.data()[base
                                    + (oy * self.stride.0 + ky) * iw
                                    + ox * self.stride.1
                                    + kx];
                        }
                    }
                    out.data_mut()[(bc * oh + oy) * ow + ox] = acc / norm;
                }
            }
        }
        Ok(Value::One(out))
    }
}

impl<T: Float> RelevanceProvider<T> for AvgPool2d {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let x = observation.input_one()?;
        let s = seed.one()?;
        check_rank(x, 4)?;
        let (batch, ch, ih, iw) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
        let (oh, ow) = (s.shape()[2], s.shape()[3]);
        let norm = T::from(self.kernel.0 * self.kernel.1).unwrap();
        let mut out = Tensor::zeros_like(x);
        for bc in 0..batch * ch {
            let base = bc * ih * iw;
            for oy in 0..oh {
                for ox in 0..ow {
                    let v = s.data()[(bc * oh + oy) * ow + ox] / norm;
                    for ky in 0..self.kernel.0 {
                        for kx in 0..self.kernel.1 {
                            let idx =
                                base + (oy * self.stride.0 + ky) * iw + ox * self.stride.1 + kx;
                            out.data_mut()[idx] = out.data()[idx] + v;
                        }
                    }
                }
            }
        }
        Ok(Value::One(out))
    }

    fn relprop(&self, observation: &Observation<T>, r: Value<T>, _alpha: T) -> Result<Value<T>> {
        relprop_simple(self, observation, &r)
    }
}

/// 2-D adaptive average pooling to a fixed output size.
///
/// Window `i` covers `[floor(i * in / out), ceil((i + 1) * in / out))`;
/// neighboring windows may overlap when the sizes do not divide evenly.
#[derive(Debug, Clone)]
pub struct AdaptiveAvgPool2d {
    output_size: (usize, usize),
}

impl AdaptiveAvgPool2d {
    pub fn new(output_size: (usize, usize)) -> Self {
        Self { output_size }
    }

    fn window(i: usize, input: usize, output: usize) -> (usize, usize) {
        let start = i * input / output;
        let end = ((i + 1) * input + output - 1) / output;
        (start, end)
    }
}

impl<T: Float> Forward<T> for AdaptiveAvgPool2d {
    fn apply(&self, input: &Value<T>) -> Result<Value<T>> {
        let x = input.one()?;
        check_rank(x, 4)?;
        let (batch, ch, ih, iw) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
        let (oh, ow) = self.output_size;
        if oh == 0 || ow == 0 || oh > ih || ow > iw {
            return Err(RelPropError::InvalidShape(format!(
                "cannot adaptively pool {:?} to {:?}",
                (ih, iw),
                (oh, ow)
            )));
        }
        let mut out = Tensor::zeros(&[batch, ch, oh, ow]);
        for bc in 0..batch * ch {
            let base = bc * ih * iw;
            for oy in 0..oh {
                let (y0, y1) = Self::window(oy, ih, oh);
                for ox in 0..ow {
                    let (x0, x1) = Self::window(ox, iw, ow);
                    let mut acc = T::zero();
                    for y in y0..y1 {
                        for xx in x0..x1 {
                            acc = acc + x.data()[base + y * iw + xx];
                        }
                    }
                    let count = T::from((y1 - y0) * (x1 - x0)).unwrap();
                    out.data_mut()[(bc * oh + oy) * ow + ox] = acc / count;
                }
            }
        }
        Ok(Value::One(out))
    }
}

impl<T: Float> RelevanceProvider<T> for AdaptiveAvgPool2d {
    fn gradprop(&self, observation: &Observation<T>, seed: &Value<T>) -> Result<Value<T>> {
        let x = observation.input_one()?;
        let s = seed.one()?;
        check_rank(x, 4)?;
        let (batch, ch, ih, iw) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
        let (oh, ow) = self.output_size;
        let mut out = Tensor::zeros_like(x);
        for bc in 0..batch * ch {
            let base = bc * ih * iw;
            for oy in 0..oh {
                let (y0, y1) = Self::window(oy, ih, oh);
                for ox in 0..ow {
                    let (x0, x1) = Self::window(ox, iw, ow);
                    let count = T::from((y1 - y0) * (x1 - x0)).unwrap();
                    let v = s.data()[(bc * oh + oy) * ow + ox] / count;
                    for y in y0..y1 {
                        for xx in x0..x1 {
                            let idx = base + y * iw + xx;
                            out.data_mut()[idx] = out.data()[idx] + v;
                        }
                    }
                }
            }
        }
        Ok(Value::One(out))
    }

    fn relprop(&self, observation: &Observation<T>, r: Value<T>, _alpha: T) -> Result<Value<T>> {
        relprop_simple(self, observation, &r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::reduction::sum;
    use approx::assert_relative_eq;

    #[test]
    fn test_max_pool_forward() {
        let pool = MaxPool2d::new((2, 2), (2, 2));
        let x = Tensor::from_slice(
            &[1.0, 2.0, 5.0, 6.0, 3.0, 4.0, 7.0, 8.0, -1.0, 0.0, 2.0, 1.0, 0.5, -2.0, 1.5, 3.0],
            &[1, 1, 4, 4],
        )
        .unwrap();
        let y = pool.apply(&Value::One(x)).unwrap();
        assert_eq!(y.one().unwrap().shape(), &[1, 1, 2, 2]);
        assert_eq!(y.one().unwrap().data(), &[4.0, 8.0, 0.5, 3.0]);
    }

    #[test]
    fn test_max_pool_relprop_routes_to_maxima() {
        let pool = MaxPool2d::new((2, 2), (2, 2));
        let x = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]).unwrap();
        let obs = pool.forward(Value::One(x)).unwrap();
        let r = Tensor::from_slice(&[5.0], &[1, 1, 1, 1]).unwrap();
        let out = pool.relprop(&obs, Value::One(r), 1.0).unwrap();
        // All relevance lands on the maximum at position 3.
        assert_eq!(out.one().unwrap().data(), &[0.0, 0.0, 0.0, 5.0]);
    }

    #[test]
    fn test_max_pool_tie_breaks_deterministically() {
        let pool = MaxPool2d::new((2, 2), (2, 2));
        let x = Tensor::from_slice(&[4.0, 4.0, 4.0, 4.0], &[1, 1, 2, 2]).unwrap();
        let obs = pool.forward(Value::One(x)).unwrap();
        let r = Tensor::from_slice(&[1.0], &[1, 1, 1, 1]).unwrap();
        let a = pool.relprop(&obs, Value::One(r.clone()), 1.0).unwrap();
        let b = pool.relprop(&obs, Value::One(r), 1.0).unwrap();
        // First occurrence wins; both runs agree bit for bit.
        assert_eq!(a.one().unwrap().data(), &[1.0, 0.0, 0.0, 0.0]);
        assert_eq!(a.one().unwrap().data(), b.one().unwrap().data());
    }

    #[test]
    fn test_avg_pool_conserves_on_positive_input() {
        let pool = AvgPool2d::new((2, 2), (2, 2));
        let x = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]).unwrap();
        let obs = pool.forward(Value::One(x)).unwrap();
        assert_eq!(obs.output_one().unwrap().data(), &[2.5]);
        let r = Tensor::from_slice(&[10.0], &[1, 1, 1, 1]).unwrap();
        let out = pool.relprop(&obs, Value::One(r), 1.0).unwrap();
        assert_relative_eq!(sum(out.one().unwrap()), 10.0, epsilon = 1e-6);
    }

    #[test]
    fn test_adaptive_windows_overlap() {
        // 5 -> 2 splits into [0, 3) and [2, 5).
        assert_eq!(AdaptiveAvgPool2d::window(0, 5, 2), (0, 3));
        assert_eq!(AdaptiveAvgPool2d::window(1, 5, 2), (2, 5));
    }

    #[test]
    fn test_adaptive_avg_pool_forward() {
        let pool = AdaptiveAvgPool2d::new((1, 1));
        let x = Tensor::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[1, 1, 2, 3]).unwrap();
        let y = pool.apply(&Value::One(x)).unwrap();
        assert_relative_eq!(y.one().unwrap().data()[0], 3.5);
    }

    #[test]
    fn test_max_pool_3d_forward() {
        let pool = MaxPool3d::new((2, 1, 1), (2, 1, 1));
        let x = Tensor::from_slice(
            &[1.0, 2.0, 3.0, 4.0, 8.0, 7.0, 6.0, 5.0],
            &[1, 1, 2, 2, 2],
        )
        .unwrap();
        let y = pool.apply(&Value::One(x)).unwrap();
        assert_eq!(y.one().unwrap().shape(), &[1, 1, 1, 2, 2]);
        assert_eq!(y.one().unwrap().data(), &[8.0, 7.0, 6.0, 5.0]);
    }
}
