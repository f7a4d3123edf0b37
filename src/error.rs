use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelPropError {
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Incompatible shapes for operation: {0:?} and {1:?}")]
    IncompatibleShapes(Vec<usize>, Vec<usize>),
    #[error("Invalid shape: {0}")]
    InvalidShape(String),
    #[error("Invalid index: {0:?} for shape {1:?}")]
    InvalidIndex(Vec<usize>, Vec<usize>),
    #[error("Index out of bounds: {0} for dimension of size {1} at axis {2}")]
    IndexOutOfBounds(usize, usize, usize),
    #[error("Invalid axis: {0} for tensor of dimension {1}")]
    InvalidAxis(usize, usize),
    #[error("Expected a single tensor, got a list of {0}")]
    ExpectedSingle(usize),
    #[error("Expected a list of {expected} tensors, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },
    #[error("No positional input was provided")]
    MissingInput,
    #[error("Invalid einsum equation: {0}")]
    InvalidEquation(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

pub type Result<T> = std::result::Result<T, RelPropError>;
