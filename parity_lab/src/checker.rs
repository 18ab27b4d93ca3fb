//! Gradient equivalence checking between two linear operator kinds.
//!
//! Both operators are built from the same construction seed and fed the same
//! batch seed, so the only remaining source of difference is the kernel's
//! computation path. Comparison is absolute: a tensor passes when
//! `max |a - b| <= precision.tolerance()`.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use linear_core::{config::ParityConfig, metrics, Precision, Scalar, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    error::ParityError,
    kernel::OperatorKind,
    operator::{mean_backward, LinearSpec, Operator, SampleBatch},
};

/// Gradients produced by one forward + backward pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientTriple {
    pub input: Option<Tensor>,
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl GradientTriple {
    pub fn get(&self, kind: GradientKind) -> Option<&Tensor> {
        match kind {
            GradientKind::Input => self.input.as_ref(),
            GradientKind::Weight => Some(&self.weight),
            GradientKind::Bias => self.bias.as_ref(),
        }
    }

    pub fn bit_eq(&self, other: &GradientTriple) -> bool {
        GradientKind::ALL.iter().all(|kind| match (self.get(*kind), other.get(*kind)) {
            (Some(a), Some(b)) => a.bit_eq(b),
            (None, None) => true,
            _ => false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradientKind {
    Input,
    Weight,
    Bias,
}

impl GradientKind {
    pub const ALL: [GradientKind; 3] = [GradientKind::Input, GradientKind::Weight, GradientKind::Bias];

    pub fn label(self) -> &'static str {
        match self {
            GradientKind::Input => "input",
            GradientKind::Weight => "weight",
            GradientKind::Bias => "bias",
        }
    }
}

impl fmt::Display for GradientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    BothAbsent,
    Matched {
        max_abs_diff: Scalar,
    },
    Diverged {
        max_abs_diff: Scalar,
        index: usize,
        lhs: Scalar,
        rhs: Scalar,
    },
    PresenceMismatch {
        lhs_present: bool,
        rhs_present: bool,
    },
    ShapeMismatch {
        lhs: (usize, usize),
        rhs: (usize, usize),
    },
}

impl Outcome {
    pub fn passed(&self) -> bool {
        matches!(self, Outcome::BothAbsent | Outcome::Matched { .. })
    }

    pub fn max_abs_diff(&self) -> Option<Scalar> {
        match self {
            Outcome::Matched { max_abs_diff } | Outcome::Diverged { max_abs_diff, .. } => {
                Some(*max_abs_diff)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorComparison {
    pub tensor: GradientKind,
    pub outcome: Outcome,
}

/// Per-tensor verdicts for one pair of gradient triples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub precision: Precision,
    pub tolerance: Scalar,
    pub tensors: Vec<TensorComparison>,
}

impl ComparisonReport {
    pub fn passed(&self) -> bool {
        self.tensors.iter().all(|t| t.outcome.passed())
    }

    pub fn outcome(&self, tensor: GradientKind) -> Option<&Outcome> {
        self.tensors
            .iter()
            .find(|t| t.tensor == tensor)
            .map(|t| &t.outcome)
    }

    /// Converts the first failing tensor into an error naming it and the precision.
    pub fn ensure_passed(&self) -> Result<(), ParityError> {
        for comparison in &self.tensors {
            let tensor = comparison.tensor;
            match &comparison.outcome {
                Outcome::BothAbsent | Outcome::Matched { .. } => {}
                Outcome::Diverged { max_abs_diff, .. } => {
                    return Err(ParityError::Divergence {
                        tensor,
                        precision: self.precision,
                        max_abs_diff: *max_abs_diff,
                        tolerance: self.tolerance,
                    })
                }
                Outcome::PresenceMismatch { .. } => {
                    return Err(ParityError::PresenceMismatch {
                        tensor,
                        precision: self.precision,
                    })
                }
                Outcome::ShapeMismatch { lhs, rhs } => {
                    return Err(ParityError::ShapeMismatch {
                        context: tensor.label(),
                        expected: *rhs,
                        found: *lhs,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Builds `kind` with default bias and no epilogue; see [`build_operator_with`].
pub fn build_operator(
    kind: OperatorKind,
    input_features: usize,
    output_features: usize,
    precision: Precision,
    seed: u64,
) -> Result<Operator, ParityError> {
    build_operator_with(
        kind,
        LinearSpec::new(input_features, output_features, precision),
        seed,
    )
}

pub fn build_operator_with(
    kind: OperatorKind,
    spec: LinearSpec,
    seed: u64,
) -> Result<Operator, ParityError> {
    Operator::new(kind, spec, seed)
}

/// Seeds a batch, runs forward, reduces by mean, runs backward, and collects gradients.
///
/// Parameter gradients accumulate on `operator`, so the returned triple covers every
/// backward pass since the last `zero_grad`.
pub fn run_forward_backward(
    operator: &mut Operator,
    seed: u64,
    batch_size: usize,
    precision: Precision,
) -> Result<GradientTriple, ParityError> {
    let batch =
        SampleBatch::generate(seed, batch_size, operator.spec().input_features).cast(precision);
    let output = operator.forward(&batch)?;
    let input = operator.backward(&mean_backward(&output))?;
    let weight = operator
        .weight()
        .grad()
        .cloned()
        .ok_or(ParityError::MissingForward)?;
    let bias = operator.bias().and_then(|b| b.grad().cloned());
    Ok(GradientTriple {
        input,
        weight,
        bias,
    })
}

/// Compares two gradient triples elementwise under `precision`'s tolerance.
pub fn compare(lhs: &GradientTriple, rhs: &GradientTriple, precision: Precision) -> ComparisonReport {
    let tolerance = precision.tolerance();
    let tensors = GradientKind::ALL
        .iter()
        .map(|kind| TensorComparison {
            tensor: *kind,
            outcome: compare_tensor(lhs.get(*kind), rhs.get(*kind), tolerance),
        })
        .collect();
    ComparisonReport {
        precision,
        tolerance,
        tensors,
    }
}

fn compare_tensor(lhs: Option<&Tensor>, rhs: Option<&Tensor>, tolerance: Scalar) -> Outcome {
    let (lhs, rhs) = match (lhs, rhs) {
        (None, None) => return Outcome::BothAbsent,
        (Some(lhs), Some(rhs)) => (lhs, rhs),
        (lhs, rhs) => {
            return Outcome::PresenceMismatch {
                lhs_present: lhs.is_some(),
                rhs_present: rhs.is_some(),
            }
        }
    };
    if lhs.shape() != rhs.shape() {
        return Outcome::ShapeMismatch {
            lhs: lhs.shape(),
            rhs: rhs.shape(),
        };
    }
    match metrics::max_abs_diff(lhs.as_slice(), rhs.as_slice()) {
        None => Outcome::Matched { max_abs_diff: 0.0 },
        Some((max_abs_diff, _)) if max_abs_diff <= tolerance => Outcome::Matched { max_abs_diff },
        Some((max_abs_diff, index)) => Outcome::Diverged {
            max_abs_diff,
            index,
            lhs: lhs.as_slice()[index],
            rhs: rhs.as_slice()[index],
        },
    }
}

/// Wall-clock nanoseconds, used when no seed is configured.
pub fn fresh_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// One candidate-vs-reference comparison together with everything needed to replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquivalenceRun {
    pub iteration: usize,
    pub kind: OperatorKind,
    pub spec: LinearSpec,
    pub batch_size: usize,
    pub seed: u64,
    pub batch_seed: u64,
    pub report: ComparisonReport,
}

/// Runs `kind` against the reference for every configured precision and iteration.
///
/// Construction errors abort immediately; divergences are recorded in the
/// returned runs for the caller to judge.
pub fn check_equivalence(
    config: &ParityConfig,
    kind: OperatorKind,
) -> Result<Vec<EquivalenceRun>, ParityError> {
    let mut runs = Vec::with_capacity(config.iterations * config.precisions.len());
    for iteration in 0..config.iterations {
        for &precision in &config.precisions {
            let spec = LinearSpec::new(config.input_features, config.output_features, precision)
                .with_bias(config.bias)
                .with_epilogue(config.epilogue);
            let seed = config.seed.unwrap_or_else(fresh_seed);
            let mut candidate = build_operator_with(kind, spec, seed)?;
            let mut reference = build_operator_with(OperatorKind::Reference, spec, seed)?;

            let batch_seed = config.batch_seed.unwrap_or_else(fresh_seed);
            let lhs = run_forward_backward(&mut candidate, batch_seed, config.batch_size, precision)?;
            let rhs = run_forward_backward(&mut reference, batch_seed, config.batch_size, precision)?;
            let report = compare(&lhs, &rhs, precision);

            if report.passed() {
                let weight_mass = metrics::abs_sum(lhs.weight.as_slice());
                info!(%kind, %precision, iteration, seed, batch_seed, weight_mass, "gradients match");
            } else {
                warn!(%kind, %precision, iteration, seed, batch_seed, "gradients diverged");
            }
            runs.push(EquivalenceRun {
                iteration,
                kind,
                spec,
                batch_size: config.batch_size,
                seed,
                batch_seed,
                report,
            });
        }
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(values: &[f32]) -> Tensor {
        Tensor::from_vec(1, values.len(), values.to_vec(), Precision::Float32)
    }

    fn triple(input: Option<&[f32]>, weight: &[f32], bias: Option<&[f32]>) -> GradientTriple {
        GradientTriple {
            input: input.map(tensor),
            weight: tensor(weight),
            bias: bias.map(tensor),
        }
    }

    #[test]
    fn tolerance_scales_with_precision() {
        let a = triple(None, &[1.0, 2.0], Some(&[0.5]));
        let b = triple(None, &[1.0, 2.0 + 0.01], Some(&[0.5]));
        assert!(compare(&a, &b, Precision::BFloat16).passed());
        assert!(!compare(&a, &b, Precision::Float32).passed());
    }

    #[test]
    fn absolute_tolerance_is_inclusive() {
        for precision in Precision::ALL {
            let tol = precision.tolerance();
            let zero = triple(None, &[0.0], None);
            let at_limit = triple(None, &[tol], None);
            let report = compare(&zero, &at_limit, precision);
            assert!(report.passed(), "{precision}: |0 - tol| must pass");
            assert_eq!(
                report.outcome(GradientKind::Weight),
                Some(&Outcome::Matched { max_abs_diff: tol })
            );

            let past_limit = triple(None, &[f32::from_bits(tol.to_bits() + 1)], None);
            assert!(
                !compare(&zero, &past_limit, precision).passed(),
                "{precision}: one ulp past tol must fail"
            );
        }
    }

    #[test]
    fn one_sided_input_gradient_fails() {
        let a = triple(Some(&[1.0]), &[1.0], None);
        let b = triple(None, &[1.0], None);
        let report = compare(&a, &b, Precision::Float32);
        assert!(!report.passed());
        assert_eq!(
            report.outcome(GradientKind::Input),
            Some(&Outcome::PresenceMismatch {
                lhs_present: true,
                rhs_present: false
            })
        );
        assert_eq!(report.outcome(GradientKind::Bias), Some(&Outcome::BothAbsent));
        assert!(matches!(
            report.ensure_passed(),
            Err(ParityError::PresenceMismatch {
                tensor: GradientKind::Input,
                ..
            })
        ));
    }

    #[test]
    fn divergence_names_tensor_and_precision() {
        let a = triple(None, &[1.0, 0.0], Some(&[0.0]));
        let b = triple(None, &[1.0, 0.0], Some(&[0.5]));
        let report = compare(&a, &b, Precision::BFloat16);
        let err = report.ensure_passed().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("bias"), "{message}");
        assert!(message.contains("bf16"), "{message}");
        match report.outcome(GradientKind::Bias) {
            Some(Outcome::Diverged { index, lhs, rhs, .. }) => {
                assert_eq!(*index, 0);
                assert_eq!((*lhs, *rhs), (0.0, 0.5));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn shape_disagreement_fails() {
        let a = triple(None, &[1.0, 2.0], None);
        let b = triple(None, &[1.0], None);
        let report = compare(&a, &b, Precision::Float32);
        assert!(matches!(
            report.outcome(GradientKind::Weight),
            Some(Outcome::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn nan_gradients_never_pass() {
        let a = triple(None, &[f32::NAN], None);
        let b = triple(None, &[f32::NAN], None);
        assert!(!compare(&a, &b, Precision::BFloat16).passed());
    }

    #[test]
    fn fixed_seeds_make_runs_reproducible() {
        let config = ParityConfig {
            seed: Some(7),
            batch_seed: Some(8),
            ..ParityConfig::default()
        };
        let first = check_equivalence(&config, OperatorKind::Packed).unwrap();
        let second = check_equivalence(&config, OperatorKind::Packed).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|run| run.report.passed()));
    }
}
