// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{validate_learning_rate, Optimizer};
use crate::module::Module;
use crate::{NnError, PureResult, Tensor};
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Moments {
    first: Tensor,
    second: Tensor,
}

/// Adam optimiser with bias correction. Moments are tracked per parameter
/// name so a single instance can drive several modules.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    moments: HashMap<String, Moments>,
    step: u64,
}

impl Adam {
    /// Builds Adam with the usual defaults (`β₁ = 0.9`, `β₂ = 0.999`, `ε = 1e-8`).
    pub fn new(learning_rate: f64) -> PureResult<Self> {
        Ok(Self {
            learning_rate: validate_learning_rate(learning_rate)?,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            moments: HashMap::new(),
            step: 0,
        })
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> PureResult<Self> {
        for (name, value) in [("beta1", beta1), ("beta2", beta2)] {
            if !(0.0..1.0).contains(&value) {
                return Err(NnError::InvalidHyperparameter { name, value });
            }
        }
        self.beta1 = beta1;
        self.beta2 = beta2;
        Ok(self)
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> PureResult<Self> {
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(NnError::InvalidHyperparameter {
                name: "epsilon",
                value: epsilon,
            });
        }
        self.epsilon = epsilon;
        Ok(self)
    }

    /// Number of steps taken since construction or the last reset.
    pub fn steps(&self) -> u64 {
        self.step
    }
}

impl Optimizer for Adam {
    fn step(&mut self, module: &mut dyn Module) -> PureResult<()> {
        self.step += 1;
        let t = self.step as i32;
        let correction1 = 1.0 - self.beta1.powi(t);
        let correction2 = 1.0 - self.beta2.powi(t);
        let (beta1, beta2, epsilon, lr) = (self.beta1, self.beta2, self.epsilon, self.learning_rate);
        let moments = &mut self.moments;

        module.visit_parameters_mut(&mut |param| {
            let Some(grad) = param.take_gradient() else {
                return Ok(());
            };
            let shape = param.value().shape();
            let state = moments
                .entry(param.name().to_string())
                .or_insert_with(|| Moments {
                    first: Tensor::zeros(shape.0, shape.1),
                    second: Tensor::zeros(shape.0, shape.1),
                });
            if state.first.shape() != shape {
                // Parameter was reloaded with a new shape.
                state.first = Tensor::zeros(shape.0, shape.1);
                state.second = Tensor::zeros(shape.0, shape.1);
            }

            state.first = &state.first * beta1 + &grad * (1.0 - beta1);
            state.second = &state.second * beta2 + grad.map(|g| g * g) * (1.0 - beta2);

            let update = state.first.zip_map(&state.second, |m, v| {
                let m_hat = m / correction1;
                let v_hat = v / correction2;
                lr * m_hat / (v_hat.sqrt() + epsilon)
            });
            if let Some(bad) = update.iter().find(|value| !value.is_finite()) {
                return Err(NnError::NonFiniteValue {
                    label: "adam_update",
                    value: *bad,
                });
            }
            *param.value_mut() -= update;
            Ok(())
        })
    }

    fn reset(&mut self) {
        self.moments.clear();
        self.step = 0;
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) -> PureResult<()> {
        self.learning_rate = validate_learning_rate(learning_rate)?;
        Ok(())
    }
}
