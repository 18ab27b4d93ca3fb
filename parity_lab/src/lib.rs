//! Parity Lab crate: gradient equivalence checks for linear-layer kernels.
//!
//! A candidate kernel (packed CPU or wgpu) and the CPU reference are built from
//! the same seed, run forward + backward on the same batch, and their gradients
//! are compared under a precision-dependent tolerance.

#[path = "../cpu/mod.rs"]
pub mod cpu;

pub mod checker;
pub mod error;
pub mod kernel;
pub mod operator;
pub mod packed;
pub mod report;
pub mod split_sgd;
pub mod wgpu_linear_runner;

pub use checker::{
    build_operator, build_operator_with, check_equivalence, compare, fresh_seed,
    run_forward_backward, ComparisonReport, GradientKind, GradientTriple,
};
pub use error::ParityError;
pub use kernel::OperatorKind;
pub use operator::{LinearSpec, Operator, SampleBatch};
