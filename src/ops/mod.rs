//! Tensor operations.

pub mod arithmetic;
pub mod einsum;
pub mod elementwise;
pub mod reduction;
pub mod structure;

pub use arithmetic::*;
pub use einsum::{einsum, einsum_vjp};
pub use elementwise::*;
pub use reduction::*;
pub use structure::*;
