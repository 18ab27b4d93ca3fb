//! CPU reference implementation of the linear layer.

use linear_core::{config::Epilogue, Tensor};
use tracing::debug;

use crate::{error::ParityError, kernel::LinearKernel};

pub mod linear;

pub use linear::{affine, grad_bias, grad_input, grad_weight, relu};

/// Ground-truth kernel: plain loops, affine rounding first, activation as a separate pass.
#[derive(Debug, Default, Clone)]
pub struct ReferenceKernel;

impl LinearKernel for ReferenceKernel {
    fn forward(
        &mut self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        epilogue: Epilogue,
    ) -> Result<Tensor, ParityError> {
        let (batch, input_features) = input.shape();
        let output_features = weight.rows();
        debug!(batch, input_features, output_features, "reference forward");
        let pre = affine(
            input.as_slice(),
            weight.as_slice(),
            bias.map(Tensor::as_slice),
            batch,
            input_features,
            output_features,
        );
        let pre = Tensor::from_vec(batch, output_features, pre, input.precision());
        Ok(match epilogue {
            Epilogue::Identity => pre,
            Epilogue::Relu => pre.map(relu),
        })
    }

    fn backward_input(
        &mut self,
        grad_output: &Tensor,
        weight: &Tensor,
    ) -> Result<Tensor, ParityError> {
        let (batch, output_features) = grad_output.shape();
        let input_features = weight.cols();
        let data = grad_input(
            grad_output.as_slice(),
            weight.as_slice(),
            batch,
            input_features,
            output_features,
        );
        Ok(Tensor::from_vec(batch, input_features, data, grad_output.precision()))
    }

    fn backward_weight(
        &mut self,
        grad_output: &Tensor,
        input: &Tensor,
    ) -> Result<Tensor, ParityError> {
        let (batch, output_features) = grad_output.shape();
        let input_features = input.cols();
        let data = grad_weight(
            grad_output.as_slice(),
            input.as_slice(),
            batch,
            input_features,
            output_features,
        );
        Ok(Tensor::from_vec(
            output_features,
            input_features,
            data,
            grad_output.precision(),
        ))
    }

    fn backward_bias(&mut self, grad_output: &Tensor) -> Result<Tensor, ParityError> {
        let (batch, output_features) = grad_output.shape();
        let data = grad_bias(grad_output.as_slice(), batch, output_features);
        Ok(Tensor::from_vec(1, output_features, data, grad_output.precision()))
    }
}
