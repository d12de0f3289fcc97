// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of Strand — Licensed under AGPL-3.0-or-later.

//! Pure Rust tensor primitives for the Strand embedding refiner.
//!
//! Everything here is a dense, row-major `f32` matrix with the handful of
//! kernels the refiner actually needs: matmul, elementwise arithmetic,
//! activations, a temperature softmax, whole-tensor layer normalisation, and
//! cosine similarity. There are no native bindings and no accelerator
//! backends; the goal is a small, auditable numeric core.

use core::fmt;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::error::Error;

/// Result alias used throughout the tensor crate.
pub type TensorResult<T> = Result<T, TensorError>;

/// Epsilon floor applied to vector norms before division.
const NORM_EPSILON: f32 = 1e-8;

/// Errors emitted by tensor kernels.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received an invalid shape.
    InvalidDimensions { rows: usize, cols: usize },
    /// Data provided to a constructor does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Computation received an empty input that would otherwise panic.
    EmptyInput(&'static str),
    /// Softmax and contrastive temperatures must stay positive.
    NonPositiveTemperature { temperature: f32 },
    /// Learning rates pushed into optimizers must stay positive.
    NonPositiveLearningRate { rate: f32 },
    /// Attempted to load a parameter missing from a snapshot.
    MissingParameter { name: String },
    /// Wrapper around I/O failures when persisting parameters.
    IoError { message: String },
    /// Wrapper around serde failures when encoding or decoding snapshots.
    SerializationError { message: String },
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidDimensions { rows, cols } => {
                write!(
                    f,
                    "invalid tensor dimensions ({rows} x {cols}); both axes must be non-zero"
                )
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(
                    f,
                    "shape mismatch: left={left:?}, right={right:?} cannot be combined"
                )
            }
            TensorError::EmptyInput(label) => {
                write!(f, "{label} must not be empty for this computation")
            }
            TensorError::NonPositiveTemperature { temperature } => {
                write!(f, "temperature must be positive, got {temperature}")
            }
            TensorError::NonPositiveLearningRate { rate } => {
                write!(f, "learning rate must be positive, got {rate}")
            }
            TensorError::MissingParameter { name } => {
                write!(f, "missing parameter '{name}' while loading module state")
            }
            TensorError::IoError { message } => {
                write!(f, "i/o error while handling tensor data: {message}")
            }
            TensorError::SerializationError { message } => {
                write!(
                    f,
                    "serialization error while handling tensor data: {message}"
                )
            }
            TensorError::InvalidValue { label } => {
                write!(f, "invalid value: {label}")
            }
        }
    }
}

impl Error for TensorError {}

/// Dense row-major matrix of `f32` values.
///
/// Invariant: `data.len() == rows * cols`. Operations return fresh tensors
/// unless explicitly documented as in-place; `Clone` is a deep copy.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    data: Vec<f32>,
    rows: usize,
    cols: usize,
}

impl Tensor {
    fn guarded(rows: usize, cols: usize, data: Vec<f32>) -> TensorResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if data.len() != rows * cols {
            return Err(TensorError::DataLength {
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(Self { data, rows, cols })
    }

    fn seedable_rng(seed: Option<u64>) -> StdRng {
        match seed {
            Some(value) => StdRng::seed_from_u64(value),
            None => StdRng::from_entropy(),
        }
    }

    /// Creates a tensor filled with zeros.
    pub fn zeros(rows: usize, cols: usize) -> TensorResult<Self> {
        Self::guarded(rows, cols, vec![0.0; rows * cols])
    }

    /// Creates a tensor from raw data; the vector must hold `rows * cols`
    /// elements.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> TensorResult<Self> {
        Self::guarded(rows, cols, data)
    }

    /// Builds a tensor by applying a generator to every coordinate.
    pub fn from_fn<F>(rows: usize, cols: usize, mut f: F) -> TensorResult<Self>
    where
        F: FnMut(usize, usize) -> f32,
    {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self::guarded(rows, cols, data)
    }

    /// Samples a uniform distribution in `[min, max)`. A seed makes the draw
    /// deterministic; otherwise entropy from the host is used.
    pub fn random_uniform(
        rows: usize,
        cols: usize,
        min: f32,
        max: f32,
        seed: Option<u64>,
    ) -> TensorResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        if !(min < max) {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let mut rng = Self::seedable_rng(seed);
        let distribution = Uniform::new(min, max);
        let mut data = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            data.push(distribution.sample(&mut rng));
        }
        Self::guarded(rows, cols, data)
    }

    /// Xavier/Glorot initialisation: uniform in `[-s, s]` with
    /// `s = sqrt(2 / (fan_in + fan_out))`, where `fan_in = rows` and
    /// `fan_out = cols`.
    pub fn xavier(rows: usize, cols: usize, seed: Option<u64>) -> TensorResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(TensorError::InvalidDimensions { rows, cols });
        }
        let scale = (2.0 / (rows + cols) as f32).sqrt();
        Self::random_uniform(rows, cols, -scale, scale, seed)
    }

    /// Returns the `(rows, cols)` pair of the tensor.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of stored elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// Always false for a constructed tensor; kept for API completeness.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Immutable view of the backing buffer.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view of the backing buffer.
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    fn assert_same_shape(&self, other: &Tensor) -> TensorResult<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        Ok(())
    }

    fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32,
    {
        Tensor {
            data: self.data.iter().map(|&v| f(v)).collect(),
            rows: self.rows,
            cols: self.cols,
        }
    }

    /// Elementwise addition.
    pub fn add(&self, other: &Tensor) -> TensorResult<Tensor> {
        self.assert_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a + b)
            .collect();
        Ok(Tensor {
            data,
            rows: self.rows,
            cols: self.cols,
        })
    }

    /// Elementwise subtraction.
    pub fn sub(&self, other: &Tensor) -> TensorResult<Tensor> {
        self.assert_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a - b)
            .collect();
        Ok(Tensor {
            data,
            rows: self.rows,
            cols: self.cols,
        })
    }

    /// Elementwise (Hadamard) product.
    pub fn hadamard(&self, other: &Tensor) -> TensorResult<Tensor> {
        self.assert_same_shape(other)?;
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .collect();
        Ok(Tensor {
            data,
            rows: self.rows,
            cols: self.cols,
        })
    }

    /// Multiplies every element by a scalar.
    pub fn scale(&self, value: f32) -> Tensor {
        self.map(|v| v * value)
    }

    /// In-place `self += other * factor`.
    pub fn add_scaled(&mut self, other: &Tensor, factor: f32) -> TensorResult<()> {
        self.assert_same_shape(other)?;
        for (dst, src) in self.data.iter_mut().zip(other.data.iter()) {
            *dst += src * factor;
        }
        Ok(())
    }

    /// Matrix product; inner dimensions must agree.
    pub fn matmul(&self, other: &Tensor) -> TensorResult<Tensor> {
        if self.cols != other.rows {
            return Err(TensorError::ShapeMismatch {
                left: self.shape(),
                right: other.shape(),
            });
        }
        let mut data = vec![0.0f32; self.rows * other.cols];
        for r in 0..self.rows {
            for k in 0..self.cols {
                let lhs = self.data[r * self.cols + k];
                if lhs == 0.0 {
                    continue;
                }
                let row_offset = r * other.cols;
                let rhs_offset = k * other.cols;
                for c in 0..other.cols {
                    data[row_offset + c] += lhs * other.data[rhs_offset + c];
                }
            }
        }
        Tensor::guarded(self.rows, other.cols, data)
    }

    /// Returns the transpose as a new tensor.
    pub fn transpose(&self) -> Tensor {
        let mut data = vec![0.0f32; self.len()];
        for r in 0..self.rows {
            for c in 0..self.cols {
                data[c * self.rows + r] = self.data[r * self.cols + c];
            }
        }
        Tensor {
            data,
            rows: self.cols,
            cols: self.rows,
        }
    }

    /// Elementwise rectified linear unit.
    pub fn relu(&self) -> Tensor {
        self.map(|v| v.max(0.0))
    }

    /// Elementwise logistic sigmoid.
    pub fn sigmoid(&self) -> Tensor {
        self.map(|v| 1.0 / (1.0 + (-v).exp()))
    }

    /// Elementwise hyperbolic tangent.
    pub fn tanh(&self) -> Tensor {
        self.map(|v| v.tanh())
    }

    /// Temperature-scaled softmax over all elements, with max subtraction for
    /// numerical stability. The result sums to 1.
    pub fn softmax(&self, temperature: f32) -> TensorResult<Tensor> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(TensorError::NonPositiveTemperature { temperature });
        }
        if self.data.is_empty() {
            return Err(TensorError::EmptyInput("softmax"));
        }
        let max = self
            .data
            .iter()
            .fold(f32::NEG_INFINITY, |acc, &v| acc.max(v / temperature));
        let mut data: Vec<f32> = self
            .data
            .iter()
            .map(|&v| (v / temperature - max).exp())
            .collect();
        let sum: f32 = data.iter().sum();
        for value in &mut data {
            *value /= sum;
        }
        Ok(Tensor {
            data,
            rows: self.rows,
            cols: self.cols,
        })
    }

    /// Layer normalisation over **all** elements of the tensor:
    /// `gamma * (x - mean) / sqrt(var + eps) + beta`. `gamma` and `beta`
    /// must match the tensor's shape.
    pub fn layer_norm(&self, gamma: &Tensor, beta: &Tensor, eps: f32) -> TensorResult<Tensor> {
        self.assert_same_shape(gamma)?;
        self.assert_same_shape(beta)?;
        if !eps.is_finite() || eps <= 0.0 {
            return Err(TensorError::InvalidValue {
                label: "layer_norm_epsilon",
            });
        }
        let n = self.len() as f32;
        let mean = self.data.iter().sum::<f32>() / n;
        let variance = self
            .data
            .iter()
            .map(|&v| {
                let centered = v - mean;
                centered * centered
            })
            .sum::<f32>()
            / n;
        let inv_std = 1.0 / (variance + eps).sqrt();
        let data = self
            .data
            .iter()
            .zip(gamma.data.iter().zip(beta.data.iter()))
            .map(|(&v, (&g, &b))| g * (v - mean) * inv_std + b)
            .collect();
        Ok(Tensor {
            data,
            rows: self.rows,
            cols: self.cols,
        })
    }

    /// Dot product over flattened elements; shapes must agree.
    pub fn dot(&self, other: &Tensor) -> TensorResult<f32> {
        self.assert_same_shape(other)?;
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .sum())
    }

    /// Squared L2 norm over all elements.
    pub fn squared_l2_norm(&self) -> f32 {
        self.data.iter().map(|&v| v * v).sum()
    }

    /// L2 norm over all elements.
    pub fn l2_norm(&self) -> f32 {
        self.squared_l2_norm().sqrt()
    }

    /// Cosine similarity between two same-shaped tensors, guarding zero
    /// norms with a small epsilon instead of dividing by zero.
    pub fn cosine_similarity(&self, other: &Tensor) -> TensorResult<f32> {
        self.assert_same_shape(other)?;
        let dot = self.dot(other)?;
        let denom = self.l2_norm().max(NORM_EPSILON) * other.l2_norm().max(NORM_EPSILON);
        Ok(dot / denom)
    }

}
