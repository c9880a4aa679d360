// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::Loss;
use crate::{NnError, PureResult, Tensor};

/// Classic mean squared error loss with mean reduction.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanSquaredError;

impl MeanSquaredError {
    /// Creates a new mean squared error loss instance.
    pub fn new() -> Self {
        Self
    }

    fn guard(prediction: &Tensor, target: &Tensor) -> PureResult<()> {
        if prediction.shape() != target.shape() {
            return Err(NnError::ShapeMismatch {
                left: prediction.shape(),
                right: target.shape(),
            });
        }
        if prediction.is_empty() {
            return Err(NnError::InvalidDimensions {
                rows: prediction.nrows(),
                cols: prediction.ncols(),
            });
        }
        Ok(())
    }
}

impl Loss for MeanSquaredError {
    fn forward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<f64> {
        Self::guard(prediction, target)?;
        let mean = (prediction - target).norm_squared() / prediction.len() as f64;
        if !mean.is_finite() {
            return Err(NnError::NonFiniteValue {
                label: "mean_squared_error",
                value: mean,
            });
        }
        Ok(mean)
    }

    fn backward(&mut self, prediction: &Tensor, target: &Tensor) -> PureResult<Tensor> {
        Self::guard(prediction, target)?;
        let inv = 2.0 / prediction.len() as f64;
        Ok((prediction - target) * inv)
    }
}
