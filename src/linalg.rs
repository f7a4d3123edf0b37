//! Basic linear algebra: matrix multiplication and transposition.

use crate::{
    error::{RelPropError, Result},
    tensor::Tensor,
};
use num_traits::Float;

/// Multiplies two matrices: `[m, k] x [k, n] -> [m, n]`.
pub fn matmul<T: Float>(lhs: &Tensor<T>, rhs: &Tensor<T>) -> Result<Tensor<T>> {
    if lhs.ndim() != 2 || rhs.ndim() != 2 || lhs.shape()[1] != rhs.shape()[0] {
        return Err(RelPropError::IncompatibleShapes(
            lhs.shape().to_vec(),
            rhs.shape().to_vec(),
        ));
    }
    let (m, k) = (lhs.shape()[0], lhs.shape()[1]);
    let n = rhs.shape()[1];
    let mut out = Tensor::zeros(&[m, n]);
    for i in 0..m {
        for j in 0..n {
            let mut sum = T::zero();
            for p in 0..k {
                sum = sum + lhs.data()[i * k + p] * rhs.data()[p * n + j];
            }
            out.data_mut()[i * n + j] = sum;
        }
    }
    Ok(out)
}

/// Transposes a matrix: `[m, n] -> [n, m]`.
pub fn transpose<T: Float>(matrix: &Tensor<T>) -> Result<Tensor<T>> {
    if matrix.ndim() != 2 {
        return Err(RelPropError::InvalidShape(format!(
            "transpose expects a matrix, got shape {:?}",
            matrix.shape()
        )));
    }
    let (m, n) = (matrix.shape()[0], matrix.shape()[1]);
    let mut out = Tensor::zeros(&[n, m]);
    for i in 0..m {
        for j in 0..n {
            out.data_mut()[j * m + i] = matrix.data()[i * n + j];
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul() {
        let a = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let b = Tensor::from_slice(&[7.0f32, 8.0, 9.0, 10.0, 11.0, 12.0], &[3, 2]).unwrap();
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_transpose() {
        let a = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let t = transpose(&a).unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_matmul_shape_check() {
        let a = Tensor::<f32>::zeros(&[2, 3]);
        let b = Tensor::<f32>::zeros(&[2, 3]);
        assert!(matmul(&a, &b).is_err());
    }
}
