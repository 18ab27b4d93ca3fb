//! Numeric comparison helpers for checking one operator's output against another's.

use crate::Scalar;

/// Largest absolute elementwise difference and the index where it occurs.
///
/// A `NaN` on either side counts as an infinite difference so it can never pass a
/// tolerance check. Returns `None` for empty or mismatched-length inputs.
pub fn max_abs_diff(lhs: &[Scalar], rhs: &[Scalar]) -> Option<(Scalar, usize)> {
    if lhs.len() != rhs.len() || lhs.is_empty() {
        return None;
    }
    let mut worst = (0.0f32, 0usize);
    for (idx, (a, b)) in lhs.iter().zip(rhs.iter()).enumerate() {
        let delta = if a.is_nan() || b.is_nan() {
            Scalar::INFINITY
        } else {
            (a - b).abs()
        };
        if delta > worst.0 {
            worst = (delta, idx);
        }
    }
    Some(worst)
}

/// L1 mass of a gradient, logged with passing comparisons.
pub fn abs_sum(values: &[Scalar]) -> Scalar {
    values.iter().map(|v| v.abs()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abs_sum_ignores_sign() {
        assert_eq!(abs_sum(&[1.0, -2.0, 3.0]), 6.0);
        assert_eq!(abs_sum(&[]), 0.0);
    }

    #[test]
    fn max_abs_diff_reports_worst_index() {
        let (delta, idx) = max_abs_diff(&[1.0, 2.0, 3.0], &[1.0, 2.5, 2.9]).unwrap();
        assert_eq!(idx, 1);
        assert!((delta - 0.5).abs() < 1e-6);
    }

    #[test]
    fn nan_never_matches() {
        let (delta, idx) = max_abs_diff(&[0.0, f32::NAN], &[0.0, f32::NAN]).unwrap();
        assert!(delta.is_infinite());
        assert_eq!(idx, 1);
    }

    #[test]
    fn mismatched_lengths_have_no_diff() {
        assert!(max_abs_diff(&[1.0], &[1.0, 2.0]).is_none());
        assert!(max_abs_diff(&[], &[]).is_none());
    }
}
