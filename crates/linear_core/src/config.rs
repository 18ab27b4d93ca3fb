//! Shared configuration for parity runs, loadable from JSON and overridable from the CLI.

use std::{fs, path::Path};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::precision::Precision;

/// Activation fused after the affine transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Epilogue {
    #[default]
    Identity,
    Relu,
}

/// Settings for one equivalence run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParityConfig {
    pub input_features: usize,
    pub output_features: usize,
    pub batch_size: usize,
    pub precisions: Vec<Precision>,
    /// Fixed construction seed; `None` draws a fresh wall-clock seed per iteration.
    pub seed: Option<u64>,
    /// Fixed batch seed; `None` draws a fresh wall-clock seed per iteration.
    pub batch_seed: Option<u64>,
    pub iterations: usize,
    pub bias: bool,
    pub epilogue: Epilogue,
}

impl Default for ParityConfig {
    fn default() -> Self {
        Self {
            input_features: 16,
            output_features: 1,
            batch_size: 28,
            precisions: vec![Precision::Float32, Precision::BFloat16],
            seed: None,
            batch_seed: None,
            iterations: 1,
            bias: true,
            epilogue: Epilogue::Identity,
        }
    }
}

impl ParityConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.as_ref().display()))?;
        let config: ParityConfig = serde_json::from_str(&text)
            .with_context(|| format!("invalid config JSON in {}", path.as_ref().display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.input_features > 0, "input_features must be positive");
        ensure!(self.output_features > 0, "output_features must be positive");
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(!self.precisions.is_empty(), "at least one precision is required");
        ensure!(self.iterations > 0, "iterations must be positive");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_literal_configuration() {
        let cfg = ParityConfig::default();
        assert_eq!(cfg.input_features, 16);
        assert_eq!(cfg.output_features, 1);
        assert_eq!(cfg.batch_size, 28);
        assert_eq!(cfg.precisions, vec![Precision::Float32, Precision::BFloat16]);
        assert!(cfg.bias);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: ParityConfig =
            serde_json::from_str(r#"{"batch_size": 4, "precisions": ["bf16"], "epilogue": "relu"}"#)
                .unwrap();
        assert_eq!(cfg.batch_size, 4);
        assert_eq!(cfg.input_features, 16);
        assert_eq!(cfg.precisions, vec![Precision::BFloat16]);
        assert_eq!(cfg.epilogue, Epilogue::Relu);
    }

    #[test]
    fn zero_sized_shapes_are_rejected() {
        let cfg = ParityConfig {
            batch_size: 0,
            ..ParityConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
