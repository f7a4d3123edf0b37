//! Layer-wise relevance propagation for neural network inference.
//!
//! Every layer in this crate is a drop-in replacement for its ordinary
//! counterpart: it computes the usual forward transformation and, on top of
//! that, knows how to redistribute a relevance signal from its output back
//! onto its input by deep Taylor decomposition. Running a model forward
//! yields per-layer [`Observation`]s; feeding the output relevance back
//! through them in reverse yields a per-input attribution whose total is
//! approximately conserved.
//!
//! # Example
//!
//! ```
//! use relprop::{layers::{Linear, ReLU, Sequential}, Tensor};
//!
//! let weight = Tensor::from_slice(&[1.0, -1.0, 1.0, 1.0], &[2, 2])?;
//! let model = Sequential::new()
//!     .add(Linear::new(weight, None)?)
//!     .add(ReLU::new());
//!
//! let input = Tensor::from_slice(&[2.0, 3.0], &[1, 2])?;
//! let (output, observations) = model.forward(input)?;
//! let relevance = model.relprop(&observations, output, 1.0)?;
//! # Ok::<(), relprop::RelPropError>(())
//! ```

pub mod error;
pub mod layers;
pub mod linalg;
pub mod observe;
pub mod ops;
pub mod stabilize;
pub mod tensor;

pub use error::{RelPropError, Result};
pub use observe::{Observation, Value};
pub use stabilize::safe_divide;
pub use tensor::Tensor;
