//! The capability interface every linear operator backend implements.

use std::{fmt, str::FromStr};

use anyhow::anyhow;
use linear_core::{config::Epilogue, Precision, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::ParityError;

/// Closed set of operator implementations the checker can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    /// Straightforward row-major loops; the ground truth.
    Reference,
    /// Panel-packed CPU kernel with split accumulators and a fused epilogue.
    Packed,
    /// WGSL compute kernels dispatched through wgpu.
    Wgpu,
}

impl OperatorKind {
    pub fn supports(self, precision: Precision) -> bool {
        match self {
            OperatorKind::Reference => true,
            OperatorKind::Packed | OperatorKind::Wgpu => {
                matches!(precision, Precision::Float32 | Precision::BFloat16)
            }
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            OperatorKind::Reference => "reference",
            OperatorKind::Packed => "packed",
            OperatorKind::Wgpu => "wgpu",
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for OperatorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reference" | "cpu" => Ok(OperatorKind::Reference),
            "packed" | "optimized" => Ok(OperatorKind::Packed),
            "wgpu" | "gpu" => Ok(OperatorKind::Wgpu),
            other => Err(anyhow!("unknown operator kind '{other}'")),
        }
    }
}

/// Forward and gradient kernels of `y = x W^T + b`.
///
/// Every method returns a tensor in the precision of its inputs, accumulating in
/// `f32` and rounding once per element. Shapes are validated by the caller.
pub trait LinearKernel {
    /// Called at construction and whenever the weight changes.
    fn prepare(&mut self, _weight: &Tensor) -> Result<(), ParityError> {
        Ok(())
    }

    /// `input (batch, in)`, `weight (out, in)`, `bias (1, out)` -> `(batch, out)`.
    fn forward(
        &mut self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        epilogue: Epilogue,
    ) -> Result<Tensor, ParityError>;

    /// `grad_output (batch, out)`, `weight (out, in)` -> `(batch, in)`.
    fn backward_input(&mut self, grad_output: &Tensor, weight: &Tensor)
        -> Result<Tensor, ParityError>;

    /// `grad_output (batch, out)`, `input (batch, in)` -> `(out, in)`.
    fn backward_weight(&mut self, grad_output: &Tensor, input: &Tensor)
        -> Result<Tensor, ParityError>;

    /// `grad_output (batch, out)` -> `(1, out)`.
    fn backward_bias(&mut self, grad_output: &Tensor) -> Result<Tensor, ParityError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimized_kinds_reject_half_precision() {
        assert!(OperatorKind::Reference.supports(Precision::Float16));
        assert!(!OperatorKind::Packed.supports(Precision::Float16));
        assert!(!OperatorKind::Wgpu.supports(Precision::Float16));
        for kind in [OperatorKind::Reference, OperatorKind::Packed, OperatorKind::Wgpu] {
            assert!(kind.supports(Precision::Float32));
            assert!(kind.supports(Precision::BFloat16));
        }
    }

    #[test]
    fn parses_kind_names() {
        assert_eq!("optimized".parse::<OperatorKind>().unwrap(), OperatorKind::Packed);
        assert_eq!("GPU".parse::<OperatorKind>().unwrap(), OperatorKind::Wgpu);
        assert!("mkl".parse::<OperatorKind>().is_err());
    }
}
