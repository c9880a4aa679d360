// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Small dense neural building blocks used by the Encore residual corrector.
//!
//! Everything operates on row-major batches stored as `nalgebra::DMatrix<f64>`:
//! rows index samples and columns index features. Layers compute their own
//! gradients by hand and accumulate them into [`module::Parameter`] buffers,
//! which an [`optim::Optimizer`] then consumes.

pub mod layers;
pub mod loss;
pub mod module;
pub mod optim;

use core::fmt;

pub use layers::{ElmanCell, Linear};
pub use loss::{Loss, MeanSquaredError};
pub use module::{Module, Parameter, StateLoadReport};
pub use optim::{Adam, Optimizer, Sgd};

/// Dense matrix type shared by every layer.
pub type Tensor = nalgebra::DMatrix<f64>;

/// Result alias used across the crate.
pub type PureResult<T> = Result<T, NnError>;

/// Errors raised by layers, losses and optimisers.
#[derive(Clone, Debug, PartialEq)]
pub enum NnError {
    /// A layer was requested with a zero-sized dimension.
    InvalidDimensions { rows: usize, cols: usize },
    /// Two operands disagree on shape.
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },
    /// Optimisers require a strictly positive, finite learning rate.
    NonPositiveLearningRate { rate: f64 },
    /// A named hyperparameter is outside its admissible range.
    InvalidHyperparameter { name: &'static str, value: f64 },
    /// A state dictionary did not contain the requested parameter.
    MissingParameter { name: String },
    /// A computation produced NaN or infinity.
    NonFiniteValue { label: &'static str, value: f64 },
}

impl fmt::Display for NnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NnError::InvalidDimensions { rows, cols } => {
                write!(f, "invalid dimensions ({rows} x {cols})")
            }
            NnError::ShapeMismatch { left, right } => write!(
                f,
                "shape mismatch: ({}, {}) vs ({}, {})",
                left.0, left.1, right.0, right.1
            ),
            NnError::NonPositiveLearningRate { rate } => {
                write!(f, "learning rate must be positive and finite, got {rate}")
            }
            NnError::InvalidHyperparameter { name, value } => {
                write!(f, "hyperparameter {name} is out of range: {value}")
            }
            NnError::MissingParameter { name } => {
                write!(f, "state dictionary is missing parameter {name}")
            }
            NnError::NonFiniteValue { label, value } => {
                write!(f, "{label} produced a non-finite value ({value})")
            }
        }
    }
}

impl std::error::Error for NnError {}

/// Concatenates two batches along the feature axis.
pub fn concat_columns(left: &Tensor, right: &Tensor) -> PureResult<Tensor> {
    if left.nrows() != right.nrows() {
        return Err(NnError::ShapeMismatch {
            left: left.shape(),
            right: right.shape(),
        });
    }
    let split = left.ncols();
    Ok(Tensor::from_fn(
        left.nrows(),
        split + right.ncols(),
        |r, c| {
            if c < split {
                left[(r, c)]
            } else {
                right[(r, c - split)]
            }
        },
    ))
}

/// Sums a batch over its rows and scales the result, yielding a `1 x cols` row.
pub(crate) fn mean_rows(tensor: &Tensor) -> Tensor {
    let rows = tensor.nrows().max(1) as f64;
    Tensor::from_fn(1, tensor.ncols(), |_, c| tensor.column(c).sum() / rows)
}

/// Repeats a `1 x cols` row `rows` times.
pub(crate) fn broadcast_row(row: &Tensor, rows: usize) -> Tensor {
    Tensor::from_fn(rows, row.ncols(), |_, c| row[(0, c)])
}
