// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Synthetic listener whose taste mixes a slowly drifting long-term
//! preference with a short-term memory of what was just played.

use crate::error::{SimError, SimResult};
use encore_config::determinism;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

const NORM_EPS: f64 = 1e-8;

/// How utility `⟨β, x⟩` is turned into a reward.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardMode {
    /// `⟨β, x⟩ + noise`
    Dot,
    /// `sigmoid(⟨β, x⟩ / temperature) + noise`, clipped to `[0, 1]`.
    Logistic { temperature: f64 },
}

impl Default for RewardMode {
    fn default() -> Self {
        RewardMode::Logistic { temperature: 0.5 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserSimulatorConfig {
    pub dimension: usize,
    /// Standard deviation of the per-step drift of the long-term preference.
    pub global_drift_std: f64,
    /// EMA decay of the short-term preference, in `(0, 1)`.
    pub temp_decay: f64,
    /// Weight of the short-term preference in `β`, in `[0, 1]`.
    pub merge_lambda: f64,
    pub noise_std: f64,
    pub reward_mode: RewardMode,
    pub seed: Option<u64>,
}

impl UserSimulatorConfig {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            global_drift_std: 0.01,
            temp_decay: 0.9,
            merge_lambda: 0.3,
            noise_std: 0.05,
            reward_mode: RewardMode::default(),
            seed: None,
        }
    }

    pub fn with_reward_mode(mut self, mode: RewardMode) -> Self {
        self.reward_mode = mode;
        self
    }

    pub fn with_noise_std(mut self, noise_std: f64) -> Self {
        self.noise_std = noise_std;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn validate(&self) -> SimResult<()> {
        if self.dimension == 0 {
            return Err(SimError::invalid("dimension", "must be at least 1"));
        }
        if !(self.temp_decay > 0.0 && self.temp_decay < 1.0) {
            return Err(SimError::invalid(
                "temp_decay",
                format!("must lie in (0, 1), got {}", self.temp_decay),
            ));
        }
        if !(0.0..=1.0).contains(&self.merge_lambda) {
            return Err(SimError::invalid(
                "merge_lambda",
                format!("must lie in [0, 1], got {}", self.merge_lambda),
            ));
        }
        for (name, value) in [
            ("global_drift_std", self.global_drift_std),
            ("noise_std", self.noise_std),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(SimError::invalid(name, format!("must be non-negative, got {value}")));
            }
        }
        if let RewardMode::Logistic { temperature } = self.reward_mode {
            if !temperature.is_finite() || temperature <= 0.0 {
                return Err(SimError::invalid(
                    "reward_mode",
                    format!("logistic temperature must be positive, got {temperature}"),
                ));
            }
        }
        Ok(())
    }
}

/// Internal state exposed after each step.
#[derive(Clone, Debug, PartialEq)]
pub struct StepInfo {
    pub t: u64,
    pub global_preference: DVector<f64>,
    pub temporary_preference: DVector<f64>,
    /// Real-time preference `β_t` used for the reward.
    pub preference: DVector<f64>,
    pub utility: f64,
}

#[derive(Debug)]
pub struct UserSimulator {
    config: UserSimulatorConfig,
    rng: StdRng,
    t: u64,
    global: DVector<f64>,
    temporary: DVector<f64>,
}

impl UserSimulator {
    pub fn new(config: UserSimulatorConfig) -> SimResult<Self> {
        config.validate()?;
        let rng = determinism::rng_from_optional(config.seed, "encore-sim::user");
        let dimension = config.dimension;
        let mut user = Self {
            config,
            rng,
            t: 0,
            global: DVector::zeros(dimension),
            temporary: DVector::zeros(dimension),
        };
        user.resample_global();
        Ok(user)
    }

    pub fn config(&self) -> &UserSimulatorConfig {
        &self.config
    }

    pub fn t(&self) -> u64 {
        self.t
    }

    pub fn global_preference(&self) -> &DVector<f64> {
        &self.global
    }

    fn gaussian(&mut self, std: f64) -> DVector<f64> {
        let rng = &mut self.rng;
        DVector::from_fn(self.config.dimension, |_, _| {
            std * rng.sample::<f64, _>(StandardNormal)
        })
    }

    fn resample_global(&mut self) {
        self.global = normalise(self.gaussian(1.0));
        self.temporary = DVector::zeros(self.config.dimension);
        self.t = 0;
    }

    /// Starts a new session. With `resample_global` the long-term preference
    /// is redrawn, which amounts to a different listener.
    pub fn reset(&mut self, resample_global: bool) {
        if resample_global {
            self.resample_global();
        } else {
            self.temporary = DVector::zeros(self.config.dimension);
            self.t = 0;
        }
    }

    /// `β = normalise((1 − λ)·global + λ·temporary)`
    pub fn realtime_preference(&self) -> DVector<f64> {
        let lambda = self.config.merge_lambda;
        normalise(&self.global * (1.0 - lambda) + &self.temporary * lambda)
    }

    /// Plays one song with the given features and returns the reward.
    pub fn step(&mut self, features: &DVector<f64>) -> SimResult<(f64, StepInfo)> {
        if features.len() != self.config.dimension {
            return Err(SimError::DimensionMismatch {
                expected: self.config.dimension,
                actual: features.len(),
            });
        }
        let norm = features.norm();
        let x = if norm > NORM_EPS {
            features / norm
        } else {
            features.clone()
        };

        self.t += 1;
        let drift = self.gaussian(self.config.global_drift_std);
        self.global = normalise(&self.global + drift);
        let decay = self.config.temp_decay;
        self.temporary = normalise(&self.temporary * decay + &x * (1.0 - decay));

        let preference = self.realtime_preference();
        let utility = preference.dot(&x);
        let noise = self.config.noise_std * self.rng.sample::<f64, _>(StandardNormal);
        let reward = match self.config.reward_mode {
            RewardMode::Dot => utility + noise,
            RewardMode::Logistic { temperature } => {
                let mean = 1.0 / (1.0 + (-utility / temperature).exp());
                (mean + noise).clamp(0.0, 1.0)
            }
        };

        Ok((
            reward,
            StepInfo {
                t: self.t,
                global_preference: self.global.clone(),
                temporary_preference: self.temporary.clone(),
                preference,
                utility,
            },
        ))
    }
}

pub(crate) fn normalise(vector: DVector<f64>) -> DVector<f64> {
    let norm = vector.norm() + NORM_EPS;
    vector / norm
}
