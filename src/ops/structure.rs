//! Structural operations: concatenation, splitting and index selection.
//!
//! All of these walk the tensor as `outer * axis * inner` blocks of the
//! row-major layout, so they work for any rank.

use crate::{
    error::{RelPropError, Result},
    tensor::Tensor,
};
use num_traits::Float;

fn axis_blocks<T: Float>(tensor: &Tensor<T>, dim: usize) -> Result<(usize, usize, usize)> {
    if dim >= tensor.ndim() {
        return Err(RelPropError::InvalidAxis(dim, tensor.ndim()));
    }
    let shape = tensor.shape();
    let outer: usize = shape[..dim].iter().product();
    let axis = shape[dim];
    let inner: usize = shape[dim + 1..].iter().product();
    Ok((outer, axis, inner))
}

/// Concatenates tensors along `dim`. All other dimensions must agree.
pub fn concat<T: Float>(tensors: &[&Tensor<T>], dim: usize) -> Result<Tensor<T>> {
    let first = tensors.first().ok_or(RelPropError::MissingInput)?;
    let (outer, _, inner) = axis_blocks(first, dim)?;
    let mut axis_total = 0;
    for t in tensors {
        if t.ndim() != first.ndim() {
            return Err(RelPropError::IncompatibleShapes(
                first.shape().to_vec(),
                t.shape().to_vec(),
            ));
        }
        for (axis, (&a, &b)) in first.shape().iter().zip(t.shape()).enumerate() {
            if axis != dim && a != b {
                return Err(RelPropError::IncompatibleShapes(
                    first.shape().to_vec(),
                    t.shape().to_vec(),
                ));
            }
        }
        axis_total += t.shape()[dim];
    }

    let mut out_shape = first.shape().to_vec();
    out_shape[dim] = axis_total;
    let mut data = Vec::with_capacity(outer * axis_total * inner);
    for o in 0..outer {
        for t in tensors {
            let axis = t.shape()[dim];
            let start = o * axis * inner;
            data.extend_from_slice(&t.data()[start..start + axis * inner]);
        }
    }
    Tensor::from_slice(&data, &out_shape)
}

/// Splits a tensor along `dim` into sections of the given sizes.
///
/// The inverse of [`concat`]; used as the adjoint of concatenation when
/// relevance flows back onto the original inputs.
pub fn split_sections<T: Float>(
    tensor: &Tensor<T>,
    dim: usize,
    sections: &[usize],
) -> Result<Vec<Tensor<T>>> {
    let (outer, axis, inner) = axis_blocks(tensor, dim)?;
    let total: usize = sections.iter().sum();
    if total != axis {
        return Err(RelPropError::InvalidShape(format!(
            "sections {:?} do not sum to axis {} of length {}",
            sections, dim, axis
        )));
    }

    let mut parts = Vec::with_capacity(sections.len());
    let mut offset = 0;
    for &section in sections {
        let mut shape = tensor.shape().to_vec();
        shape[dim] = section;
        let mut data = Vec::with_capacity(outer * section * inner);
        for o in 0..outer {
            let start = (o * axis + offset) * inner;
            data.extend_from_slice(&tensor.data()[start..start + section * inner]);
        }
        parts.push(Tensor::from_slice(&data, &shape)?);
        offset += section;
    }
    Ok(parts)
}

/// Selects the given indices along `dim`.
pub fn index_select<T: Float>(
    tensor: &Tensor<T>,
    dim: usize,
    indices: &[usize],
) -> Result<Tensor<T>> {
    let (outer, axis, inner) = axis_blocks(tensor, dim)?;
    for &i in indices {
        if i >= axis {
            return Err(RelPropError::IndexOutOfBounds(i, axis, dim));
        }
    }
    let mut shape = tensor.shape().to_vec();
    shape[dim] = indices.len();
    let mut data = Vec::with_capacity(outer * indices.len() * inner);
    for o in 0..outer {
        for &i in indices {
            let start = (o * axis + i) * inner;
            data.extend_from_slice(&tensor.data()[start..start + inner]);
        }
    }
    Tensor::from_slice(&data, &shape)
}

/// Scatters a selected tensor back onto the full shape along `dim`.
///
/// The adjoint of [`index_select`]: positions named by `indices` receive the
/// corresponding slices of `selected` (accumulating on repeats), every other
/// position is zero.
pub fn index_scatter<T: Float>(
    selected: &Tensor<T>,
    dim: usize,
    indices: &[usize],
    full_shape: &[usize],
) -> Result<Tensor<T>> {
    let mut out = Tensor::zeros(full_shape);
    let (outer, axis, inner) = axis_blocks(&out, dim)?;
    if selected.shape()[dim] != indices.len() {
        return Err(RelPropError::ShapeMismatch {
            expected: vec![indices.len()],
            actual: vec![selected.shape()[dim]],
        });
    }
    for o in 0..outer {
        for (k, &i) in indices.iter().enumerate() {
            if i >= axis {
                return Err(RelPropError::IndexOutOfBounds(i, axis, dim));
            }
            let src = (o * indices.len() + k) * inner;
            let dst = (o * axis + i) * inner;
            for j in 0..inner {
                out.data_mut()[dst + j] = out.data()[dst + j] + selected.data()[src + j];
            }
        }
    }
    Ok(out)
}
