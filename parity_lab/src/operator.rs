//! Differentiable linear operator: parameters, saved activations and gradient routing.
//!
//! The kernels only know how to compute forward and gradient products; this module
//! owns what an autograd engine would: parameter gradients that accumulate across
//! backward passes, the saved input/output of the last forward, and whether the
//! input is a leaf that should receive a gradient.

use linear_core::{config::Epilogue, init, Precision, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    cpu::ReferenceKernel,
    error::ParityError,
    kernel::{LinearKernel, OperatorKind},
    packed::PackedKernel,
    wgpu_linear_runner::WgpuKernel,
};

/// Shape and numeric configuration of a linear operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearSpec {
    pub input_features: usize,
    pub output_features: usize,
    pub precision: Precision,
    pub bias: bool,
    pub epilogue: Epilogue,
}

impl LinearSpec {
    pub fn new(input_features: usize, output_features: usize, precision: Precision) -> Self {
        Self {
            input_features,
            output_features,
            precision,
            bias: true,
            epilogue: Epilogue::Identity,
        }
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_epilogue(mut self, epilogue: Epilogue) -> Self {
        self.epilogue = epilogue;
        self
    }
}

/// A trainable tensor and its accumulated gradient.
#[derive(Debug, Clone)]
pub struct Parameter {
    value: Tensor,
    grad: Option<Tensor>,
}

impl Parameter {
    pub fn new(value: Tensor) -> Self {
        Self { value, grad: None }
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    fn accumulate(&mut self, grad: Tensor) {
        self.grad = Some(match self.grad.take() {
            Some(existing) => existing.add(&grad),
            None => grad,
        });
    }

    pub(crate) fn set_value(&mut self, value: Tensor) {
        self.value = value;
    }
}

/// Input batch `(batch_size, input_features)` plus its leaf status.
///
/// Only a leaf batch receives an input gradient. Casting to a different precision
/// produces a derived copy, so the gradient is not retained on it.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    data: Tensor,
    leaf: bool,
}

impl SampleBatch {
    pub fn leaf(data: Tensor) -> Self {
        Self { data, leaf: true }
    }

    /// Standard-normal full-precision leaf batch drawn from `seed`.
    pub fn generate(seed: u64, batch_size: usize, input_features: usize) -> Self {
        Self::leaf(init::normal_matrix(seed, batch_size, input_features))
    }

    pub fn cast(&self, precision: Precision) -> Self {
        if precision == self.data.precision() {
            return self.clone();
        }
        Self {
            data: self.data.cast(precision),
            leaf: false,
        }
    }

    pub fn tensor(&self) -> &Tensor {
        &self.data
    }

    pub fn requires_input_grad(&self) -> bool {
        self.leaf
    }
}

enum Backend {
    Reference(ReferenceKernel),
    Packed(PackedKernel),
    Wgpu(Box<WgpuKernel>),
    #[cfg(test)]
    Failing(Box<dyn LinearKernel>),
}

impl Backend {
    fn kernel(&mut self) -> &mut dyn LinearKernel {
        match self {
            Backend::Reference(kernel) => kernel,
            Backend::Packed(kernel) => kernel,
            Backend::Wgpu(kernel) => kernel.as_mut(),
            #[cfg(test)]
            Backend::Failing(kernel) => kernel.as_mut(),
        }
    }
}

struct SavedForward {
    input: Tensor,
    output: Tensor,
    input_is_leaf: bool,
}

pub struct Operator {
    kind: OperatorKind,
    spec: LinearSpec,
    weight: Parameter,
    bias: Option<Parameter>,
    backend: Backend,
    saved: Option<SavedForward>,
}

impl Operator {
    /// Builds `kind` with parameters drawn from `seed`.
    pub fn new(kind: OperatorKind, spec: LinearSpec, seed: u64) -> Result<Self, ParityError> {
        if !kind.supports(spec.precision) {
            return Err(ParityError::UnsupportedPrecision {
                kind,
                precision: spec.precision,
            });
        }
        let backend = match kind {
            OperatorKind::Reference => Backend::Reference(ReferenceKernel),
            OperatorKind::Packed => Backend::Packed(PackedKernel::default()),
            OperatorKind::Wgpu => Backend::Wgpu(Box::new(
                WgpuKernel::new()
                    .map_err(|err| ParityError::BackendUnavailable(format!("wgpu: {err:#}")))?,
            )),
        };
        let params = init::linear_parameters(
            seed,
            spec.input_features,
            spec.output_features,
            spec.bias,
            spec.precision,
        );
        let mut operator = Self {
            kind,
            spec,
            weight: Parameter::new(params.weight),
            bias: params.bias.map(Parameter::new),
            backend,
            saved: None,
        };
        operator.backend.kernel().prepare(operator.weight.value())?;
        debug!(%kind, seed, ?spec, "built linear operator");
        Ok(operator)
    }

    pub fn kind(&self) -> OperatorKind {
        self.kind
    }

    pub fn spec(&self) -> &LinearSpec {
        &self.spec
    }

    pub fn precision(&self) -> Precision {
        self.spec.precision
    }

    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    pub fn zero_grad(&mut self) {
        self.weight.zero_grad();
        if let Some(bias) = &mut self.bias {
            bias.zero_grad();
        }
    }

    /// Forward pass that records what backward needs.
    ///
    /// A failed forward leaves nothing saved, so a following `backward` fails
    /// with `MissingForward` instead of reusing an earlier batch.
    pub fn forward(&mut self, batch: &SampleBatch) -> Result<Tensor, ParityError> {
        self.saved = None;
        let output = self.evaluate(batch)?;
        self.saved = Some(SavedForward {
            input: batch.tensor().clone(),
            output: output.clone(),
            input_is_leaf: batch.requires_input_grad(),
        });
        Ok(output)
    }

    /// Inference-only forward pass; a following `backward` fails with `MissingForward`.
    pub fn forward_no_grad(&mut self, batch: &SampleBatch) -> Result<Tensor, ParityError> {
        self.saved = None;
        self.evaluate(batch)
    }

    /// Propagates `grad_output` through the last forward pass.
    ///
    /// Parameter gradients accumulate; the input gradient is returned only when
    /// the forward input was a leaf. The saved forward is consumed. Every kernel
    /// gradient is computed before any is accumulated, so a kernel failure leaves
    /// the parameter gradients untouched.
    pub fn backward(&mut self, grad_output: &Tensor) -> Result<Option<Tensor>, ParityError> {
        let saved = self.saved.take().ok_or(ParityError::MissingForward)?;
        expect_shape("grad_output", saved.output.shape(), grad_output.shape())?;

        let grad = match self.spec.epilogue {
            Epilogue::Identity => grad_output.clone(),
            Epilogue::Relu => relu_mask(grad_output, &saved.output),
        };

        let kernel = self.backend.kernel();
        let grad_weight = kernel.backward_weight(&grad, &saved.input)?;
        let grad_bias = match self.bias {
            Some(_) => Some(kernel.backward_bias(&grad)?),
            None => None,
        };
        let grad_input = if saved.input_is_leaf {
            Some(kernel.backward_input(&grad, self.weight.value())?)
        } else {
            None
        };

        self.weight.accumulate(grad_weight);
        if let (Some(bias), Some(grad_bias)) = (&mut self.bias, grad_bias) {
            bias.accumulate(grad_bias);
        }
        Ok(grad_input)
    }

    /// Replaces parameter values (gradients are kept) and refreshes backend state.
    pub(crate) fn set_parameters(
        &mut self,
        weight: Tensor,
        bias: Option<Tensor>,
    ) -> Result<(), ParityError> {
        expect_shape("weight", self.weight.value().shape(), weight.shape())?;
        self.weight.set_value(weight);
        if let (Some(param), Some(value)) = (&mut self.bias, bias) {
            expect_shape("bias", param.value().shape(), value.shape())?;
            param.set_value(value);
        }
        self.saved = None;
        self.backend.kernel().prepare(self.weight.value())
    }

    fn evaluate(&mut self, batch: &SampleBatch) -> Result<Tensor, ParityError> {
        let input = batch.tensor();
        if input.precision() != self.spec.precision {
            return Err(ParityError::PrecisionMismatch {
                operator: self.spec.precision,
                requested: input.precision(),
            });
        }
        expect_shape(
            "input",
            (input.rows(), self.spec.input_features),
            input.shape(),
        )?;
        let bias = self.bias.as_ref().map(Parameter::value);
        self.backend
            .kernel()
            .forward(input, self.weight.value(), bias, self.spec.epilogue)
    }
}

/// Upstream gradient of `mean(output)`: every element receives `1 / numel`.
pub fn mean_backward(output: &Tensor) -> Tensor {
    let (rows, cols) = output.shape();
    let count = (rows * cols).max(1) as f32;
    Tensor::filled(rows, cols, 1.0 / count, output.precision())
}

fn relu_mask(grad_output: &Tensor, output: &Tensor) -> Tensor {
    let data = grad_output
        .as_slice()
        .iter()
        .zip(output.as_slice())
        .map(|(g, y)| if *y > 0.0 { *g } else { 0.0 })
        .collect();
    Tensor::from_vec(
        grad_output.rows(),
        grad_output.cols(),
        data,
        grad_output.precision(),
    )
}

fn expect_shape(
    context: &'static str,
    expected: (usize, usize),
    found: (usize, usize),
) -> Result<(), ParityError> {
    if expected == found {
        Ok(())
    } else {
        Err(ParityError::ShapeMismatch {
            context,
            expected,
            found,
        })
    }
}
