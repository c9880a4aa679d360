// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{validate_learning_rate, Optimizer};
use crate::module::Module;
use crate::PureResult;

/// Plain stochastic gradient descent.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate: f64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> PureResult<Self> {
        Ok(Self {
            learning_rate: validate_learning_rate(learning_rate)?,
        })
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, module: &mut dyn Module) -> PureResult<()> {
        module.apply_step(self.learning_rate)
    }

    fn reset(&mut self) {}

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) -> PureResult<()> {
        self.learning_rate = validate_learning_rate(learning_rate)?;
        Ok(())
    }
}
