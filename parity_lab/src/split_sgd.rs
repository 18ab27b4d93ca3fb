//! SGD for bf16 operators that keeps a full-precision master weight.
//!
//! The master `f32` is stored as two 16-bit halves: the top half is exactly the
//! bf16 parameter the operator computes with, the bottom half holds the mantissa
//! bits bf16 drops. Updates are applied to the reassembled `f32`, so steps smaller
//! than a bf16 ulp still accumulate.

use linear_core::{Precision, Tensor};
use tracing::debug;

use crate::{error::ParityError, operator::Operator};

#[derive(Debug, Clone, PartialEq)]
pub struct SplitBf16Tensor {
    rows: usize,
    cols: usize,
    top: Vec<u16>,
    bottom: Vec<u16>,
}

impl SplitBf16Tensor {
    /// Splits an `f32` master tensor.
    pub fn from_master(master: &Tensor) -> Self {
        let (top, bottom) = master
            .as_slice()
            .iter()
            .map(|v| {
                let bits = v.to_bits();
                ((bits >> 16) as u16, (bits & 0xFFFF) as u16)
            })
            .unzip();
        Self {
            rows: master.rows(),
            cols: master.cols(),
            top,
            bottom,
        }
    }

    /// Reassembled `f32` master values.
    pub fn master(&self) -> Tensor {
        let data = self
            .top
            .iter()
            .zip(&self.bottom)
            .map(|(top, bottom)| f32::from_bits(((*top as u32) << 16) | *bottom as u32))
            .collect();
        Tensor::from_vec(self.rows, self.cols, data, Precision::Float32)
    }

    /// The bf16 view: the master truncated to its top 16 bits.
    pub fn top_half(&self) -> Tensor {
        let data = self
            .top
            .iter()
            .map(|top| f32::from_bits((*top as u32) << 16))
            .collect();
        Tensor::from_vec(self.rows, self.cols, data, Precision::BFloat16)
    }

    /// `master += alpha * grad`, split back into halves.
    pub fn packed_add(&mut self, grad: &Tensor, alpha: f32) -> Result<(), ParityError> {
        if grad.shape() != (self.rows, self.cols) {
            return Err(ParityError::ShapeMismatch {
                context: "packed_add",
                expected: (self.rows, self.cols),
                found: grad.shape(),
            });
        }
        for ((top, bottom), g) in self
            .top
            .iter_mut()
            .zip(self.bottom.iter_mut())
            .zip(grad.as_slice())
        {
            let mut value = f32::from_bits(((*top as u32) << 16) | *bottom as u32);
            value += alpha * g;
            let bits = value.to_bits();
            *top = (bits >> 16) as u16;
            *bottom = (bits & 0xFFFF) as u16;
        }
        Ok(())
    }
}

/// Plain SGD over a bf16 operator's weight and bias with split master copies.
#[derive(Debug, Clone)]
pub struct SplitSgd {
    lr: f32,
    weight: SplitBf16Tensor,
    bias: Option<SplitBf16Tensor>,
}

impl SplitSgd {
    /// Takes master copies of `operator`'s current bf16 parameters.
    pub fn new(operator: &Operator, lr: f32) -> Result<Self, ParityError> {
        if operator.precision() != Precision::BFloat16 {
            return Err(ParityError::UnsupportedPrecision {
                kind: operator.kind(),
                precision: operator.precision(),
            });
        }
        Ok(Self {
            lr,
            weight: SplitBf16Tensor::from_master(operator.weight().value()),
            bias: operator
                .bias()
                .map(|b| SplitBf16Tensor::from_master(b.value())),
        })
    }

    pub fn weight_master(&self) -> Tensor {
        self.weight.master()
    }

    pub fn bias_master(&self) -> Option<Tensor> {
        self.bias.as_ref().map(SplitBf16Tensor::master)
    }

    /// Applies `-lr * grad` to every parameter that has a gradient and pushes the
    /// new bf16 values into `operator`.
    pub fn step(&mut self, operator: &mut Operator) -> Result<(), ParityError> {
        if let Some(grad) = operator.weight().grad() {
            self.weight.packed_add(grad, -self.lr)?;
        }
        if let (Some(split), Some(grad)) = (
            &mut self.bias,
            operator.bias().and_then(|b| b.grad()),
        ) {
            split.packed_add(grad, -self.lr)?;
        }
        debug!(lr = self.lr, kind = %operator.kind(), "split sgd step");
        operator.set_parameters(
            self.weight.top_half(),
            self.bias.as_ref().map(SplitBf16Tensor::top_half),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checker::{build_operator, run_forward_backward},
        kernel::OperatorKind,
    };

    #[test]
    fn split_round_trips_master_bits() {
        let master = Tensor::from_vec(1, 3, vec![0.1, -1.234_567, 3.0e-5], Precision::Float32);
        let split = SplitBf16Tensor::from_master(&master);
        assert!(split.master().bit_eq(&master));
    }

    #[test]
    fn top_half_truncates() {
        let master = Tensor::from_vec(1, 1, vec![f32::from_bits(0x3F80_FFFF)], Precision::Float32);
        let split = SplitBf16Tensor::from_master(&master);
        assert_eq!(split.top_half().as_slice()[0].to_bits(), 0x3F80_0000);
    }

    #[test]
    fn sub_ulp_updates_accumulate_in_master() {
        let master = Tensor::filled(1, 1, 1.0, Precision::Float32);
        let grad = Tensor::filled(1, 1, 1.0, Precision::Float32);
        let mut split = SplitBf16Tensor::from_master(&master);
        for _ in 0..100 {
            split.packed_add(&grad, 1e-4).unwrap();
        }
        let value = split.master().as_slice()[0];
        assert!((value - 1.01).abs() < 1e-5, "{value}");
        assert!(split.top_half().as_slice()[0] > 1.0);
    }

    #[test]
    fn packed_add_rejects_shape_mismatch() {
        let mut split = SplitBf16Tensor::from_master(&Tensor::zeros(2, 2, Precision::Float32));
        let grad = Tensor::zeros(1, 4, Precision::Float32);
        assert!(split.packed_add(&grad, 1.0).is_err());
    }

    #[test]
    fn step_updates_operator_parameters() {
        let mut op = build_operator(OperatorKind::Packed, 16, 2, Precision::BFloat16, 3).unwrap();
        let before = op.weight().value().clone();
        let mut sgd = SplitSgd::new(&op, 0.5).unwrap();
        run_forward_backward(&mut op, 4, 28, Precision::BFloat16).unwrap();
        let grad = op.weight().grad().unwrap().clone();
        sgd.step(&mut op).unwrap();

        let master = sgd.weight_master();
        for ((w0, g), m) in before
            .as_slice()
            .iter()
            .zip(grad.as_slice())
            .zip(master.as_slice())
        {
            assert_eq!(*m, w0 + -0.5 * g);
        }
        assert!(op.weight().value().bit_eq(&SplitBf16Tensor::from_master(&master).top_half()));
        assert!(sgd.bias_master().is_some());
    }

    #[test]
    fn full_precision_operators_are_rejected() {
        let op = build_operator(OperatorKind::Reference, 4, 1, Precision::Float32, 1).unwrap();
        assert!(matches!(
            SplitSgd::new(&op, 0.1),
            Err(ParityError::UnsupportedPrecision { .. })
        ));
    }
}
