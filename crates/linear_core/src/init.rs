//! Deterministic parameter and batch generation from explicit seeds.
//!
//! Every generator draws in full precision from its own `ChaCha8Rng` and only
//! then casts, so two operators built from the same seed start bit-identical no
//! matter which kernel backs them.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{precision::Precision, tensor::Tensor, Scalar};

const EPSILON: f32 = f32::MIN_POSITIVE;

/// Initial weight `(output_features, input_features)` and optional bias `(1, output_features)`.
#[derive(Debug, Clone)]
pub struct LinearParameters {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

/// Draws weight then bias from `U(-1/sqrt(in), 1/sqrt(in))`, the standard linear-layer init.
pub fn linear_parameters(
    seed: u64,
    input_features: usize,
    output_features: usize,
    bias: bool,
    precision: Precision,
) -> LinearParameters {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let bound = init_bound(input_features);

    let weight: Vec<Scalar> = (0..output_features * input_features)
        .map(|_| uniform(&mut rng, bound))
        .collect();
    let bias = bias.then(|| {
        let values: Vec<Scalar> = (0..output_features)
            .map(|_| uniform(&mut rng, bound))
            .collect();
        Tensor::from_vec(1, output_features, values, Precision::Float32).cast(precision)
    });

    LinearParameters {
        weight: Tensor::from_vec(output_features, input_features, weight, Precision::Float32)
            .cast(precision),
        bias,
    }
}

/// Standard-normal `(rows, cols)` matrix in full precision.
pub fn normal_matrix(seed: u64, rows: usize, cols: usize) -> Tensor {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let data = (0..rows * cols)
        .map(|_| random_normal(&mut rng, 0.0, 1.0))
        .collect();
    Tensor::from_vec(rows, cols, data, Precision::Float32)
}

fn init_bound(input_features: usize) -> f32 {
    if input_features == 0 {
        0.0
    } else {
        1.0 / (input_features as f32).sqrt()
    }
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, bound: f32) -> f32 {
    if bound == 0.0 {
        return 0.0;
    }
    rng.gen_range(-bound..bound)
}

fn random_normal<R: Rng + ?Sized>(rng: &mut R, mean: f32, std_dev: f32) -> f32 {
    let u1 = rng.gen::<f32>().max(EPSILON);
    let u2 = rng.gen::<f32>();
    let radius = (-2.0 * u1.ln()).sqrt();
    let theta = 2.0 * std::f32::consts::PI * u2;
    mean + std_dev * radius * theta.cos()
}
