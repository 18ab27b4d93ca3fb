//! Numeric core shared by the linear-layer parity harness.
//!
//! Hosts everything that stays independent of a particular operator backend:
//! - the precision model and the 2-D tensors the kernels exchange
//! - deterministic parameter and batch generation from explicit seeds
//! - configuration shared between the CLI and the checker
//! - comparison metrics and GPU payload layouts

pub mod config;
pub mod gpu;
pub mod init;
pub mod metrics;
pub mod precision;
pub mod tensor;

/// Storage scalar used by every tensor, regardless of its logical precision.
pub type Scalar = f32;

pub use gpu::LinearDimsGpu;
pub use precision::Precision;
pub use tensor::Tensor;
