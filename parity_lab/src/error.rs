use linear_core::Precision;
use thiserror::Error;

use crate::{checker::GradientKind, kernel::OperatorKind};

#[derive(Debug, Error)]
pub enum ParityError {
    #[error("{kind} operator does not support {precision} precision")]
    UnsupportedPrecision {
        kind: OperatorKind,
        precision: Precision,
    },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("operator runs in {operator} but the batch was requested in {requested}")]
    PrecisionMismatch {
        operator: Precision,
        requested: Precision,
    },

    #[error("shape mismatch in {context}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("backward called without a saved forward pass")]
    MissingForward,

    #[error(
        "{tensor} gradient diverged in {precision}: max |a - b| = {max_abs_diff:.3e} exceeds {tolerance:.1e}"
    )]
    Divergence {
        tensor: GradientKind,
        precision: Precision,
        max_abs_diff: f32,
        tolerance: f32,
    },

    #[error("{tensor} gradient present on one side only ({precision})")]
    PresenceMismatch {
        tensor: GradientKind,
        precision: Precision,
    },

    #[error(transparent)]
    Gpu(#[from] anyhow::Error),
}
