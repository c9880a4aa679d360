// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

mod adam;
mod sgd;

pub use adam::Adam;
pub use sgd::Sgd;

use crate::module::Module;
use crate::{NnError, PureResult};

/// Consumes the gradients accumulated on a module's parameters.
pub trait Optimizer {
    /// Applies one update to every parameter carrying a gradient and clears
    /// the consumed gradients.
    fn step(&mut self, module: &mut dyn Module) -> PureResult<()>;

    /// Resets any per-parameter state (moments, step counters).
    fn reset(&mut self);

    /// Returns the current learning rate.
    fn learning_rate(&self) -> f64;

    /// Overrides the learning rate.
    fn set_learning_rate(&mut self, learning_rate: f64) -> PureResult<()>;
}

pub(crate) fn validate_learning_rate(rate: f64) -> PureResult<f64> {
    if rate <= 0.0 || !rate.is_finite() {
        return Err(NnError::NonPositiveLearningRate { rate });
    }
    Ok(rate)
}
