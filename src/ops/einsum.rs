//! Two-operand einsum contraction.
//!
//! Supports equations of the form `"bhid,bhjd->bhij"`: exactly two operands
//! and an explicit output subscript. Evaluation enumerates the cartesian
//! product of all label values and accumulates products, which is plenty for
//! the attention-sized contractions this crate propagates relevance through.

use crate::{
    error::{RelPropError, Result},
    tensor::Tensor,
};
use num_traits::Float;
use std::collections::HashMap;

struct Equation {
    lhs: Vec<Vec<char>>,
    out: Vec<char>,
}

fn parse(equation: &str) -> Result<Equation> {
    let (lhs, out) = equation
        .split_once("->")
        .ok_or_else(|| RelPropError::InvalidEquation(equation.to_string()))?;
    let lhs: Vec<Vec<char>> = lhs.split(',').map(|s| s.trim().chars().collect()).collect();
    let out: Vec<char> = out.trim().chars().collect();
    for subs in lhs.iter().chain(std::iter::once(&out)) {
        if subs.iter().any(|c| !c.is_ascii_lowercase()) {
            return Err(RelPropError::InvalidEquation(equation.to_string()));
        }
    }
    Ok(Equation { lhs, out })
}

fn label_sizes<T: Float>(
    equation: &str,
    eq: &Equation,
    operands: &[&Tensor<T>],
) -> Result<HashMap<char, usize>> {
    let mut sizes = HashMap::new();
    for (subs, operand) in eq.lhs.iter().zip(operands) {
        if subs.len() != operand.ndim() {
            return Err(RelPropError::ShapeMismatch {
                expected: vec![subs.len()],
                actual: vec![operand.ndim()],
            });
        }
        for (&label, &dim) in subs.iter().zip(operand.shape()) {
            match sizes.insert(label, dim) {
                Some(previous) if previous != dim => {
                    return Err(RelPropError::InvalidEquation(format!(
                        "label '{}' bound to both {} and {} in '{}'",
                        label, previous, dim, equation
                    )));
                }
                _ => {}
            }
        }
    }
    for &label in &eq.out {
        if !sizes.contains_key(&label) {
            return Err(RelPropError::InvalidEquation(format!(
                "output label '{}' missing from operands in '{}'",
                label, equation
            )));
        }
    }
    Ok(sizes)
}

/// Flat-offset contribution of each label for one operand.
fn label_strides(subs: &[char], shape: &[usize]) -> HashMap<char, usize> {
    let mut strides = HashMap::new();
    let mut stride = 1;
    for (&label, &dim) in subs.iter().zip(shape).rev() {
        *strides.entry(label).or_insert(0) += stride;
        stride *= dim;
    }
    strides
}

/// Contracts two tensors according to the einsum `equation`.
pub fn einsum<T: Float>(equation: &str, a: &Tensor<T>, b: &Tensor<T>) -> Result<Tensor<T>> {
    let eq = parse(equation)?;
    if eq.lhs.len() != 2 {
        return Err(RelPropError::NotImplemented(format!(
            "einsum with {} operands",
            eq.lhs.len()
        )));
    }
    let operands = [a, b];
    let sizes = label_sizes(equation, &eq, &operands)?;

    let out_shape: Vec<usize> = eq.out.iter().map(|l| sizes[l]).collect();
    let mut out = Tensor::zeros(&out_shape);

    let labels: Vec<char> = {
        let mut seen = Vec::new();
        for subs in eq.lhs.iter().chain(std::iter::once(&eq.out)) {
            for &l in subs {
                if !seen.contains(&l) {
                    seen.push(l);
                }
            }
        }
        seen
    };
    let dims: Vec<usize> = labels.iter().map(|l| sizes[l]).collect();
    let stride_a = label_strides(&eq.lhs[0], a.shape());
    let stride_b = label_strides(&eq.lhs[1], b.shape());
    let stride_out = label_strides(&eq.out, &out_shape);

    // Odometer over every label assignment.
    let mut index = vec![0usize; labels.len()];
    loop {
        let mut off_a = 0;
        let mut off_b = 0;
        let mut off_out = 0;
        for (k, &label) in labels.iter().enumerate() {
            if let Some(&s) = stride_a.get(&label) {
                off_a += index[k] * s;
            }
            if let Some(&s) = stride_b.get(&label) {
                off_b += index[k] * s;
            }
            if let Some(&s) = stride_out.get(&label) {
                off_out += index[k] * s;
            }
        }
        out.data_mut()[off_out] =
            out.data()[off_out] + a.data()[off_a] * b.data()[off_b];

        let mut k = labels.len();
        loop {
            if k == 0 {
                return Ok(out);
            }
            k -= 1;
            index[k] += 1;
            if index[k] < dims[k] {
                break;
            }
            index[k] = 0;
        }
    }
}

/// Vector-Jacobian product of [`einsum`] with respect to one operand.
///
/// For `C = einsum(sa, sb -> so, A, B)`, the adjoint with respect to `A` is
/// `einsum(so, sb -> sa, seed, B)` (and symmetrically for `B`). Equations
/// where an operand label appears nowhere else are not supported.
pub fn einsum_vjp<T: Float>(
    equation: &str,
    a: &Tensor<T>,
    b: &Tensor<T>,
    seed: &Tensor<T>,
    wrt: usize,
) -> Result<Tensor<T>> {
    let eq = parse(equation)?;
    if eq.lhs.len() != 2 {
        return Err(RelPropError::NotImplemented(format!(
            "einsum with {} operands",
            eq.lhs.len()
        )));
    }
    if wrt > 1 {
        return Err(RelPropError::ArityMismatch {
            expected: 2,
            actual: wrt + 1,
        });
    }
    let (target, other, other_tensor) = if wrt == 0 {
        (&eq.lhs[0], &eq.lhs[1], b)
    } else {
        (&eq.lhs[1], &eq.lhs[0], a)
    };
    for &label in target {
        if !eq.out.contains(&label) && !other.contains(&label) {
            return Err(RelPropError::NotImplemented(format!(
                "einsum adjoint for label '{}' contracted within one operand",
                label
            )));
        }
    }
    let adjoint: String = format!(
        "{},{}->{}",
        eq.out.iter().collect::<String>(),
        other.iter().collect::<String>(),
        target.iter().collect::<String>()
    );
    einsum(&adjoint, seed, other_tensor)
}
