//! GPU-facing data structures shared between host code and WGSL shaders.

use anyhow::{anyhow, bail, Result};

use crate::{config::Epilogue, precision::Precision};

pub const FLAG_HAS_BIAS: u32 = 1 << 0;
pub const FLAG_RELU: u32 = 1 << 1;

pub const PRECISION_F32: u32 = 0;
pub const PRECISION_BF16: u32 = 1;

/// Uniform block describing one linear dispatch (matches `LinearDims` in WGSL).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LinearDimsGpu {
    pub batch: u32,
    pub input_features: u32,
    pub output_features: u32,
    pub flags: u32,
    pub precision: u32,
    pub _pad: [u32; 3],
}

const _: () = assert!(core::mem::size_of::<LinearDimsGpu>() == 32);

impl LinearDimsGpu {
    /// Fails for precisions the shaders cannot emulate and for shapes whose
    /// dimensions or flattened products do not fit the shaders' `u32` indexing.
    pub fn new(
        batch: usize,
        input_features: usize,
        output_features: usize,
        has_bias: bool,
        epilogue: Epilogue,
        precision: Precision,
    ) -> Result<Self> {
        let precision = match precision {
            Precision::Float32 => PRECISION_F32,
            Precision::BFloat16 => PRECISION_BF16,
            Precision::Float16 => bail!("{precision} has no GPU layout"),
        };
        for (name, extent) in [
            ("batch x output_features", batch.checked_mul(output_features)),
            ("batch x input_features", batch.checked_mul(input_features)),
            ("output_features x input_features", output_features.checked_mul(input_features)),
        ] {
            if extent.and_then(|n| u32::try_from(n).ok()).is_none() {
                bail!("{name} exceeds the u32 index range of the linear shaders");
            }
        }
        let mut flags = 0;
        if has_bias {
            flags |= FLAG_HAS_BIAS;
        }
        if epilogue == Epilogue::Relu {
            flags |= FLAG_RELU;
        }
        Ok(Self {
            batch: to_u32("batch", batch)?,
            input_features: to_u32("input_features", input_features)?,
            output_features: to_u32("output_features", output_features)?,
            flags,
            precision,
            _pad: [0; 3],
        })
    }
}

fn to_u32(name: &str, value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{name} = {value} does not fit in u32"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_encode_bias_and_relu() {
        let dims = LinearDimsGpu::new(28, 16, 1, true, Epilogue::Relu, Precision::BFloat16).unwrap();
        assert_eq!(dims.flags, FLAG_HAS_BIAS | FLAG_RELU);
        assert_eq!(dims.precision, PRECISION_BF16);
        assert_eq!(bytemuck::bytes_of(&dims).len(), 32);
    }

    #[test]
    fn half_precision_has_no_gpu_layout() {
        assert!(LinearDimsGpu::new(1, 1, 1, false, Epilogue::Identity, Precision::Float16).is_err());
    }

    #[test]
    fn oversized_shapes_are_rejected_instead_of_truncated() {
        let too_wide = u32::MAX as usize + 1;
        assert!(LinearDimsGpu::new(1, too_wide, 1, false, Epilogue::Identity, Precision::Float32).is_err());
        // Each extent fits, but batch x output_features does not.
        let err = LinearDimsGpu::new(1 << 16, 1, 1 << 16, false, Epilogue::Identity, Precision::Float32)
            .unwrap_err();
        assert!(err.to_string().contains("batch x output_features"), "{err}");
        assert!(LinearDimsGpu::new(2, 4096, 1100, true, Epilogue::Identity, Precision::BFloat16).is_ok());
    }
}
