// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::catalog::CatalogSimulator;
use crate::error::{SimError, SimResult};
use crate::user::UserSimulator;
use encore_config::determinism;
use encore_rec::{Candidate, Learner, TrainOutcome};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PretrainConfig {
    pub episodes: usize,
    pub steps_per_episode: usize,
    /// Fit the residual corrector to the blended reward/preference objective
    /// instead of the plain linear residual.
    pub dual_loss: bool,
    pub lambda_reward: f64,
    pub lambda_pref: f64,
    /// Single-listener pools redraw the long-term preference every this many
    /// episodes; `0` disables.
    pub resample_global: usize,
    pub seed: Option<u64>,
}

impl Default for PretrainConfig {
    fn default() -> Self {
        Self {
            episodes: 500,
            steps_per_episode: 100,
            dual_loss: true,
            lambda_reward: 1.0,
            lambda_pref: 1.0,
            resample_global: 100,
            seed: None,
        }
    }
}

/// Totals of one simulated listening session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EpisodeStats {
    pub episode: usize,
    /// Index of the simulated listener in the pool.
    pub user: usize,
    pub steps: usize,
    pub reward: f64,
    /// Squared error of the `linear + residual` reward prediction made before
    /// each feedback.
    pub proxy_error: f64,
    pub loss: f64,
    pub reward_loss: f64,
    pub preference_loss: f64,
    /// Residual updates applied (the first call on a fresh trajectory only
    /// seeds it).
    pub updates: usize,
}

impl EpisodeStats {
    fn per_step(&self, total: f64) -> f64 {
        total / self.steps.max(1) as f64
    }

    pub fn mean_reward(&self) -> f64 {
        self.per_step(self.reward)
    }

    pub fn mean_proxy_error(&self) -> f64 {
        self.per_step(self.proxy_error)
    }

    pub fn mean_loss(&self) -> f64 {
        self.per_step(self.loss)
    }

    pub fn mean_reward_loss(&self) -> f64 {
        self.per_step(self.reward_loss)
    }

    pub fn mean_preference_loss(&self) -> f64 {
        self.per_step(self.preference_loss)
    }
}

/// Drives a [`Learner`] against simulated listeners so the arm statistics and
/// the residual corrector are warmed up before deployment.
#[derive(Debug)]
pub struct Pretrainer {
    config: PretrainConfig,
    candidates: Vec<Candidate>,
    users: Vec<UserSimulator>,
    rng: StdRng,
}

impl Pretrainer {
    pub fn new(
        config: PretrainConfig,
        catalog: &CatalogSimulator,
        users: Vec<UserSimulator>,
    ) -> SimResult<Self> {
        if users.is_empty() {
            return Err(SimError::invalid("users", "pool must hold at least one listener"));
        }
        for (name, value) in [
            ("lambda_reward", config.lambda_reward),
            ("lambda_pref", config.lambda_pref),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(SimError::invalid(name, format!("must be non-negative, got {value}")));
            }
        }
        let dimension = catalog.config().dimension;
        if let Some(user) = users.iter().find(|user| user.config().dimension != dimension) {
            return Err(SimError::DimensionMismatch {
                expected: dimension,
                actual: user.config().dimension,
            });
        }
        let rng = determinism::rng_from_optional(
            determinism::derive_seed(config.seed, "encore-sim::pretrain"),
            "encore-sim::pretrain",
        );
        Ok(Self {
            config,
            candidates: catalog.candidates(),
            users,
            rng,
        })
    }

    pub fn config(&self) -> &PretrainConfig {
        &self.config
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn users(&self) -> &[UserSimulator] {
        &self.users
    }

    /// Picks the listener for `episode` (1-based) and resets their session.
    fn begin_episode(&mut self, episode: usize) -> usize {
        if self.users.len() == 1 {
            let every = self.config.resample_global;
            let resample = every > 0 && episode % every == 0;
            self.users[0].reset(resample);
            0
        } else {
            let user = self.rng.gen_range(0..self.users.len());
            self.users[user].reset(false);
            user
        }
    }

    /// One session: repeatedly recommend the top song, play it to the
    /// simulated listener and feed the reward back.
    pub fn run_episode(&mut self, learner: &mut Learner, episode: usize) -> SimResult<EpisodeStats> {
        let user = self.begin_episode(episode);
        let _span = info_span!("episode", episode, user).entered();
        learner.reset_session();

        let mut stats = EpisodeStats {
            episode,
            user,
            ..EpisodeStats::default()
        };
        for _ in 0..self.config.steps_per_episode {
            let ranked = learner.select_with_rng(&self.candidates, 1, &mut self.rng)?;
            let Some(choice) = ranked.first() else {
                break;
            };
            let candidate = &self.candidates[choice.position];
            let Some(features) = candidate.features.as_ref() else {
                continue;
            };

            let (reward, info) = self.users[user].step(features)?;
            let linear = learner.estimate(&candidate.id, features)?.exploit;
            let correction = if learner.policy().uses_residual() {
                learner
                    .residual_model()
                    .correction(learner.residual_state(), features)?
            } else {
                0.0
            };
            stats.proxy_error += (linear + correction - reward).powi(2);

            let report = if self.config.dual_loss {
                learner.feedback_with_preference(
                    candidate,
                    reward,
                    &info.preference,
                    self.config.lambda_reward,
                    self.config.lambda_pref,
                )?
            } else {
                learner.feedback(candidate, reward)?
            };
            if let Some(TrainOutcome::Trained(train)) = report.training {
                stats.loss += train.loss;
                stats.reward_loss += train.reward_loss;
                stats.preference_loss += train.preference_loss;
                stats.updates += 1;
            }
            stats.reward += reward;
            stats.steps += 1;
        }
        debug!(
            steps = stats.steps,
            mean_reward = stats.mean_reward(),
            mean_loss = stats.mean_loss(),
            "episode finished"
        );
        Ok(stats)
    }

    /// Runs every configured episode, handing each summary to `on_episode`.
    pub fn run<F>(&mut self, learner: &mut Learner, mut on_episode: F) -> SimResult<Vec<EpisodeStats>>
    where
        F: FnMut(&EpisodeStats),
    {
        let mut history = Vec::with_capacity(self.config.episodes);
        for episode in 1..=self.config.episodes {
            let stats = self.run_episode(learner, episode)?;
            on_episode(&stats);
            history.push(stats);
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogConfig, Popularity};
    use crate::user::{RewardMode, UserSimulatorConfig};
    use encore_rec::{LearnerConfig, Policy};

    fn setup(users: usize, dual_loss: bool) -> (Pretrainer, Learner) {
        let catalog = CatalogSimulator::new(
            CatalogConfig::new(4)
                .with_songs(12)
                .with_genres(2)
                .with_popularity(Popularity::Uniform)
                .with_seed(3),
        )
        .unwrap();
        let pool = (0..users)
            .map(|i| {
                UserSimulator::new(
                    UserSimulatorConfig::new(4)
                        .with_reward_mode(RewardMode::Dot)
                        .with_seed(10 + i as u64),
                )
                .unwrap()
            })
            .collect();
        let config = PretrainConfig {
            episodes: 3,
            steps_per_episode: 8,
            dual_loss,
            resample_global: 2,
            seed: Some(1),
            ..PretrainConfig::default()
        };
        let pretrainer = Pretrainer::new(config, &catalog, pool).unwrap();
        let mut learner_config = LearnerConfig::new(4).with_policy(Policy::LinUcbResidual);
        learner_config.hidden_size = 8;
        let learner = Learner::new(learner_config.with_seed(2)).unwrap();
        (pretrainer, learner)
    }

    #[test]
    fn episodes_feed_back_every_step() {
        let (mut pretrainer, mut learner) = setup(1, true);
        let mut seen = 0;
        let history = pretrainer.run(&mut learner, |_| seen += 1).unwrap();
        assert_eq!(seen, 3);
        assert_eq!(history.len(), 3);
        for stats in &history {
            assert_eq!(stats.steps, 8);
            assert_eq!(stats.user, 0);
            assert!(stats.proxy_error.is_finite());
        }
        // The first residual call only seeds the trajectory.
        let updates: usize = history.iter().map(|stats| stats.updates).sum();
        assert_eq!(updates, 3 * 8 - 1);
        assert!(history[1].preference_loss > 0.0);
        let pulls: u64 = learner
            .arms()
            .iter()
            .map(|(_, record)| record.stats().pulls())
            .sum();
        assert_eq!(pulls, 24);
    }

    #[test]
    fn residual_only_mode_has_no_preference_loss() {
        let (mut pretrainer, mut learner) = setup(1, false);
        let stats = pretrainer.run_episode(&mut learner, 1).unwrap();
        assert_eq!(stats.preference_loss, 0.0);
        assert!(stats.loss > 0.0);
    }

    #[test]
    fn multi_user_pools_pick_listeners_from_the_pool() {
        let (mut pretrainer, mut learner) = setup(3, true);
        let history = pretrainer.run(&mut learner, |_| {}).unwrap();
        assert!(history.iter().all(|stats| stats.user < 3));
    }

    #[test]
    fn rejects_mismatched_pool() {
        let catalog = CatalogSimulator::new(CatalogConfig::new(4).with_songs(3).with_seed(1)).unwrap();
        let users = vec![UserSimulator::new(UserSimulatorConfig::new(5).with_seed(1)).unwrap()];
        assert!(matches!(
            Pretrainer::new(PretrainConfig::default(), &catalog, users),
            Err(SimError::DimensionMismatch { expected: 4, actual: 5 })
        ));
        assert!(matches!(
            Pretrainer::new(PretrainConfig::default(), &catalog, Vec::new()),
            Err(SimError::InvalidParameter { name: "users", .. })
        ));
    }
}
