//! Row-major reference loops for the linear layer and its gradients.
//!
//! Sums run sequentially in `f32` in index order; callers round the results.

use linear_core::Scalar;

/// `out[b][o] = sum_k x[b][k] * w[o][k] (+ bias[o])`.
pub fn affine(
    input: &[Scalar],
    weight: &[Scalar],
    bias: Option<&[Scalar]>,
    batch: usize,
    input_features: usize,
    output_features: usize,
) -> Vec<Scalar> {
    let mut out = vec![0.0; batch * output_features];
    for b in 0..batch {
        let x = &input[b * input_features..(b + 1) * input_features];
        for o in 0..output_features {
            let w = &weight[o * input_features..(o + 1) * input_features];
            let mut acc = 0.0f32;
            for k in 0..input_features {
                acc += x[k] * w[k];
            }
            if let Some(bias) = bias {
                acc += bias[o];
            }
            out[b * output_features + o] = acc;
        }
    }
    out
}

/// `grad_x[b][k] = sum_o grad[b][o] * w[o][k]`.
pub fn grad_input(
    grad_output: &[Scalar],
    weight: &[Scalar],
    batch: usize,
    input_features: usize,
    output_features: usize,
) -> Vec<Scalar> {
    let mut out = vec![0.0; batch * input_features];
    for b in 0..batch {
        for k in 0..input_features {
            let mut acc = 0.0f32;
            for o in 0..output_features {
                acc += grad_output[b * output_features + o] * weight[o * input_features + k];
            }
            out[b * input_features + k] = acc;
        }
    }
    out
}

/// `grad_w[o][k] = sum_b grad[b][o] * x[b][k]`.
pub fn grad_weight(
    grad_output: &[Scalar],
    input: &[Scalar],
    batch: usize,
    input_features: usize,
    output_features: usize,
) -> Vec<Scalar> {
    let mut out = vec![0.0; output_features * input_features];
    for o in 0..output_features {
        for k in 0..input_features {
            let mut acc = 0.0f32;
            for b in 0..batch {
                acc += grad_output[b * output_features + o] * input[b * input_features + k];
            }
            out[o * input_features + k] = acc;
        }
    }
    out
}

/// `grad_b[o] = sum_b grad[b][o]`.
pub fn grad_bias(grad_output: &[Scalar], batch: usize, output_features: usize) -> Vec<Scalar> {
    let mut out = vec![0.0; output_features];
    for o in 0..output_features {
        let mut acc = 0.0f32;
        for b in 0..batch {
            acc += grad_output[b * output_features + o];
        }
        out[o] = acc;
    }
    out
}

pub fn relu(value: Scalar) -> Scalar {
    value.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affine_matches_hand_computation() {
        // x = [[1, 2], [3, 4]], W = [[1, 0], [1, -1], [0.5, 0.5]], b = [1, 0, -1]
        let x = [1.0, 2.0, 3.0, 4.0];
        let w = [1.0, 0.0, 1.0, -1.0, 0.5, 0.5];
        let b = [1.0, 0.0, -1.0];
        let y = affine(&x, &w, Some(&b), 2, 2, 3);
        assert_eq!(y, vec![2.0, -1.0, 0.5, 4.0, -1.0, 2.5]);
        let y = affine(&x, &w, None, 2, 2, 3);
        assert_eq!(y, vec![1.0, -1.0, 1.5, 3.0, -1.0, 3.5]);
    }

    #[test]
    fn gradients_match_hand_computation() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let w = [1.0, 0.0, 1.0, -1.0, 0.5, 0.5];
        let g = [1.0, 0.0, 2.0, 0.0, 1.0, 1.0];
        assert_eq!(grad_input(&g, &w, 2, 2, 3), vec![2.0, 1.0, 1.5, -0.5]);
        assert_eq!(
            grad_weight(&g, &x, 2, 2, 3),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 8.0]
        );
        assert_eq!(grad_bias(&g, 2, 3), vec![1.0, 1.0, 3.0]);
    }

    #[test]
    fn relu_clamps_negatives() {
        assert_eq!(relu(-2.0), 0.0);
        assert_eq!(relu(3.5), 3.5);
    }
}
