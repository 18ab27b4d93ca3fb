//! Dense row-major 2-D tensors tagged with a logical precision.

use serde::{Deserialize, Serialize};

use crate::{precision::Precision, Scalar};

/// Row-major matrix whose values are always representable in `precision`.
///
/// Values are stored as `f32` regardless of precision; constructors and
/// [`Tensor::cast`] round every element so reduced-precision tensors never carry
/// extra mantissa bits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    rows: usize,
    cols: usize,
    precision: Precision,
    data: Vec<Scalar>,
}

impl Tensor {
    pub fn zeros(rows: usize, cols: usize, precision: Precision) -> Self {
        Self {
            rows,
            cols,
            precision,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn filled(rows: usize, cols: usize, value: Scalar, precision: Precision) -> Self {
        Self {
            rows,
            cols,
            precision,
            data: vec![precision.round(value); rows * cols],
        }
    }

    /// Wraps `data` and rounds every element into `precision`.
    ///
    /// Panics when `data.len() != rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, mut data: Vec<Scalar>, precision: Precision) -> Self {
        assert_eq!(
            data.len(),
            rows * cols,
            "tensor data length does not match {rows}x{cols}"
        );
        if precision.is_reduced() {
            for value in &mut data {
                *value = precision.round(*value);
            }
        }
        Self {
            rows,
            cols,
            precision,
            data,
        }
    }

    /// Converts to another precision, rounding each element.
    pub fn cast(&self, precision: Precision) -> Self {
        Self::from_vec(self.rows, self.cols, self.data.clone(), precision)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn as_slice(&self) -> &[Scalar] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<Scalar> {
        self.data
    }

    pub fn get(&self, row: usize, col: usize) -> Scalar {
        self.data[row * self.cols + col]
    }

    pub fn row(&self, row: usize) -> &[Scalar] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Elementwise `self + other`, rounded into `self`'s precision.
    ///
    /// Panics on shape mismatch.
    pub fn add(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape(), other.shape(), "tensor add shape mismatch");
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Tensor::from_vec(self.rows, self.cols, data, self.precision)
    }

    /// Applies `f` to every element and rounds the result into `self`'s precision.
    pub fn map(&self, f: impl Fn(Scalar) -> Scalar) -> Tensor {
        let data = self.data.iter().copied().map(f).collect();
        Tensor::from_vec(self.rows, self.cols, data, self.precision)
    }

    /// Bitwise equality, including shape and precision (`NaN`s compare by payload).
    pub fn bit_eq(&self, other: &Tensor) -> bool {
        self.shape() == other.shape()
            && self.precision == other.precision
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}
