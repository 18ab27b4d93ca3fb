//! Floating-point precisions a linear operator can run in.

use std::{fmt, str::FromStr};

use anyhow::{anyhow, Result};
use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    #[serde(rename = "f32")]
    Float32,
    #[serde(rename = "bf16")]
    BFloat16,
    #[serde(rename = "f16")]
    Float16,
}

impl Precision {
    pub const ALL: [Precision; 3] = [Precision::Float32, Precision::BFloat16, Precision::Float16];

    /// Rounds an `f32` to the nearest value representable in this precision (ties to even).
    pub fn round(self, value: Scalar) -> Scalar {
        match self {
            Precision::Float32 => value,
            Precision::BFloat16 => bf16::from_f32(value).to_f32(),
            Precision::Float16 => f16::from_f32(value).to_f32(),
        }
    }

    /// Maximum absolute gradient difference tolerated when comparing two operators.
    pub fn tolerance(self) -> Scalar {
        match self {
            Precision::Float32 => 1e-5,
            Precision::BFloat16 => 1.2e-2,
            Precision::Float16 => 1e-3,
        }
    }

    pub fn is_reduced(self) -> bool {
        !matches!(self, Precision::Float32)
    }

    pub fn label(self) -> &'static str {
        match self {
            Precision::Float32 => "f32",
            Precision::BFloat16 => "bf16",
            Precision::Float16 => "f16",
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Precision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f32" | "float32" | "fp32" => Ok(Precision::Float32),
            "bf16" | "bfloat16" => Ok(Precision::BFloat16),
            "f16" | "float16" | "fp16" | "half" => Ok(Precision::Float16),
            other => Err(anyhow!("unknown precision '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_precision_round_is_identity() {
        for value in [0.1f32, -3.75, 1e-30, 12345.678] {
            assert_eq!(Precision::Float32.round(value), value);
        }
    }

    #[test]
    fn bf16_round_keeps_eight_mantissa_bits() {
        let rounded = Precision::BFloat16.round(1.0 + 1.0 / 512.0);
        assert_eq!(rounded, 1.0);
        let rounded = Precision::BFloat16.round(1.0 + 3.0 / 256.0);
        assert_eq!(rounded.to_bits() & 0xFFFF, 0);
        assert!((rounded - (1.0 + 3.0 / 256.0)).abs() <= 1.0 / 256.0);
    }

    #[test]
    fn rounding_is_idempotent() {
        for precision in Precision::ALL {
            let once = precision.round(0.123_456_7);
            assert_eq!(precision.round(once), once);
        }
    }

    #[test]
    fn parses_aliases() {
        assert_eq!("fp32".parse::<Precision>().unwrap(), Precision::Float32);
        assert_eq!("BF16".parse::<Precision>().unwrap(), Precision::BFloat16);
        assert_eq!("half".parse::<Precision>().unwrap(), Precision::Float16);
        assert!("int8".parse::<Precision>().is_err());
    }

    #[test]
    fn reduced_precisions_tolerate_more() {
        assert_eq!(Precision::Float32.tolerance(), 1e-5);
        assert_eq!(Precision::BFloat16.tolerance(), 1.2e-2);
        assert!(Precision::Float16.tolerance() > Precision::Float32.tolerance());
    }
}
