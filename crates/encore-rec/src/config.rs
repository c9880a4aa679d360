// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{RecError, RecResult};
use crate::selection::Policy;
use encore_config::LayeredConfig;
use serde::{Deserialize, Serialize};

/// Optimiser driving the residual corrector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResidualOptimizer {
    #[default]
    Adam,
    Sgd,
}

/// Hyperparameters for a [`crate::Learner`].
///
/// Deserialises from the `[learner]` section of the layered configuration;
/// every field is optional there and falls back to [`Default`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    /// Context dimension `d` shared by every arm.
    pub dimension: usize,
    /// Exploration weight of the confidence bonus.
    pub alpha: f64,
    /// Ridge weight; arms start from `l2 · I`.
    pub l2: f64,
    /// Multiplier in `(0, 1]` applied to the last selected arm's score.
    pub discount: f64,
    pub policy: Policy,
    /// Hidden width of the residual corrector.
    pub hidden_size: usize,
    pub learning_rate: f64,
    pub residual_optimizer: ResidualOptimizer,
    /// Reward applied once when an item is added.
    pub seed_reward: f64,
    /// Reward applied once before an item is removed.
    pub removal_reward: f64,
    /// Explicit seed for parameter initialisation. Falls back to the
    /// process-wide determinism settings when absent.
    pub seed: Option<u64>,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            dimension: 32,
            alpha: 1.0,
            l2: 1.0,
            discount: 0.7,
            policy: Policy::LinUcb,
            hidden_size: 64,
            learning_rate: 1e-3,
            residual_optimizer: ResidualOptimizer::Adam,
            seed_reward: 1e-3,
            removal_reward: -5.0,
            seed: None,
        }
    }
}

impl LearnerConfig {
    /// Default configuration for the given context dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_l2(mut self, l2: f64) -> Self {
        self.l2 = l2;
        self
    }

    pub fn with_discount(mut self, discount: f64) -> Self {
        self.discount = discount;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Reads the `[learner]` section of a layered configuration and
    /// validates it.
    pub fn from_layers(layers: &LayeredConfig) -> RecResult<Self> {
        let config = layers
            .section::<LearnerConfig>(&["learner"])?
            .unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Rejects hyperparameters that would break the learner's invariants.
    pub fn validate(&self) -> RecResult<()> {
        if self.dimension == 0 {
            return Err(RecError::configuration("dimension", "must be at least 1"));
        }
        if self.hidden_size == 0 {
            return Err(RecError::configuration("hidden_size", "must be at least 1"));
        }
        if !self.l2.is_finite() || self.l2 <= 0.0 {
            return Err(RecError::configuration(
                "l2",
                format!("ridge weight must be positive, got {}", self.l2),
            ));
        }
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(RecError::configuration(
                "alpha",
                format!("exploration weight must be non-negative, got {}", self.alpha),
            ));
        }
        if !self.discount.is_finite() || self.discount <= 0.0 || self.discount > 1.0 {
            return Err(RecError::configuration(
                "discount",
                format!("must lie in (0, 1], got {}", self.discount),
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(RecError::configuration(
                "learning_rate",
                format!("must be positive, got {}", self.learning_rate),
            ));
        }
        if !self.seed_reward.is_finite() {
            return Err(RecError::configuration("seed_reward", "must be finite"));
        }
        if !self.removal_reward.is_finite() {
            return Err(RecError::configuration("removal_reward", "must be finite"));
        }
        Ok(())
    }
}
