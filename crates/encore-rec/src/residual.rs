// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Recurrent corrector predicting a global bias vector `β ∈ ℝ^d` that is
//! shared by every arm.
//!
//! Training follows a one-step-delayed bootstrap: the prediction scored by a
//! training call is rebuilt from the *previous* call's input and hidden state,
//! never from the input that arrives with the target. The trajectory lives in
//! a [`ResidualState`] owned by the caller, so the model itself is just
//! parameters plus an optimiser.

use crate::config::ResidualOptimizer;
use crate::error::{RecError, RecResult};
use encore_config::determinism;
use encore_nn::{
    concat_columns, Adam, ElmanCell, Linear, Loss, MeanSquaredError, Module, NnError, Optimizer,
    Parameter, PureResult, Sgd, StateLoadReport, Tensor,
};
use nalgebra::DVector;
use std::collections::BTreeMap;
use tracing::trace;

/// Elman cell followed by a linear head.
///
/// As a [`Module`] it maps `[x | h]` to `[h' | β]`.
#[derive(Debug, Clone)]
pub struct ResidualNetwork {
    cell: ElmanCell,
    head: Linear,
}

impl ResidualNetwork {
    fn split_output(&self, output: &Tensor) -> (Tensor, Tensor) {
        let hidden = self.cell.hidden_dim();
        let next = output.columns(0, hidden).clone_owned();
        let beta = output.columns(hidden, output.ncols() - hidden).clone_owned();
        (next, beta)
    }
}

impl Module for ResidualNetwork {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let next = self.cell.forward(input)?;
        let beta = self.head.forward(&next)?;
        concat_columns(&next, &beta)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let width = self.cell.hidden_dim() + self.head.output_dim();
        if grad_output.shape() != (input.nrows(), width) {
            return Err(NnError::ShapeMismatch {
                left: grad_output.shape(),
                right: (input.nrows(), width),
            });
        }
        let next = self.cell.forward(input)?;
        let (grad_next, grad_beta) = self.split_output(grad_output);
        let grad_hidden = self.head.backward(&next, &grad_beta)? + grad_next;
        self.cell.backward(input, &grad_hidden)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.cell.visit_parameters(visitor)?;
        self.head.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.cell.visit_parameters_mut(visitor)?;
        self.head.visit_parameters_mut(visitor)
    }
}

/// Input and hidden state that produced the most recent prediction.
#[derive(Clone, Debug, PartialEq)]
pub struct DeferredStep {
    pub input: DVector<f64>,
    pub hidden: DVector<f64>,
}

/// Trajectory of the corrector: uninitialised until the first training call,
/// then holding the deferred step the next call bootstraps from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResidualState {
    deferred: Option<DeferredStep>,
    updates: u64,
}

impl ResidualState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a state from persisted parts.
    pub fn from_parts(deferred: Option<DeferredStep>, updates: u64) -> Self {
        Self { deferred, updates }
    }

    /// Whether the first training call has happened.
    pub fn is_seeded(&self) -> bool {
        self.deferred.is_some()
    }

    pub fn deferred(&self) -> Option<&DeferredStep> {
        self.deferred.as_ref()
    }

    /// Number of parameter updates performed along this trajectory.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Hidden state used for inference: the deferred hidden state, or zeros
    /// before the trajectory is seeded.
    pub fn hidden(&self, width: usize) -> DVector<f64> {
        match &self.deferred {
            Some(step) if step.hidden.len() == width => step.hidden.clone(),
            _ => DVector::zeros(width),
        }
    }

    /// Returns to the uninitialised state.
    pub fn reset(&mut self) {
        self.deferred = None;
        self.updates = 0;
    }
}

/// What a training call regresses towards.
#[derive(Clone, Debug, PartialEq)]
pub enum TrainTarget {
    /// Reward left unexplained by the linear model, `r − θᵀx`. The prediction
    /// `β̂ᵀx` is fitted to it directly.
    Residual(f64),
    /// Training-only blend of the full reward and a known
    /// preference vector:
    /// `λr · (linear + β̂ᵀx − reward)² + λp · mean((β̂ − preference)²)`.
    Blended {
        reward: f64,
        linear: f64,
        preference: DVector<f64>,
        lambda_reward: f64,
        lambda_pref: f64,
    },
}

/// Loss terms of one parameter update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrainReport {
    pub loss: f64,
    /// Scalar prediction compared against the reward target.
    pub prediction: f64,
    pub reward_loss: f64,
    pub preference_loss: f64,
}

/// Result of [`ResidualModel::train_step`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrainOutcome {
    /// First call on a fresh trajectory: deferred state seeded, parameters
    /// untouched.
    Seeded,
    Trained(TrainReport),
}

/// Parameters and optimiser of the residual corrector.
pub struct ResidualModel {
    dimension: usize,
    hidden_size: usize,
    network: ResidualNetwork,
    optimizer: Box<dyn Optimizer + Send>,
    loss: MeanSquaredError,
}

impl core::fmt::Debug for ResidualModel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResidualModel")
            .field("dimension", &self.dimension)
            .field("hidden_size", &self.hidden_size)
            .field("learning_rate", &self.optimizer.learning_rate())
            .finish()
    }
}

/// Prefix of the cell parameters inside a state dictionary.
pub const CELL_NAME: &str = "residual_cell";
/// Prefix of the head parameters inside a state dictionary.
pub const HEAD_NAME: &str = "residual_head";

impl ResidualModel {
    /// Builds a corrector for `dimension`-sized contexts with `hidden_size`
    /// recurrent units. Parameters are drawn from `seed` or, without one, from
    /// the process determinism settings.
    pub fn new(
        dimension: usize,
        hidden_size: usize,
        learning_rate: f64,
        optimizer: ResidualOptimizer,
        seed: Option<u64>,
    ) -> RecResult<Self> {
        if dimension == 0 || hidden_size == 0 {
            return Err(RecError::configuration(
                "hidden_size",
                format!("residual model needs non-zero sizes, got d={dimension}, H={hidden_size}"),
            ));
        }
        let mut rng = determinism::rng_from_optional(
            determinism::derive_seed(seed, "encore-rec::residual"),
            "encore-rec::residual",
        );
        let cell = ElmanCell::new(CELL_NAME, dimension, hidden_size, &mut rng)?;
        let head = Linear::new(HEAD_NAME, hidden_size, dimension, &mut rng)?;
        let optimizer: Box<dyn Optimizer + Send> = match optimizer {
            ResidualOptimizer::Adam => Box::new(Adam::new(learning_rate)?),
            ResidualOptimizer::Sgd => Box::new(Sgd::new(learning_rate)?),
        };
        Ok(Self {
            dimension,
            hidden_size,
            network: ResidualNetwork { cell, head },
            optimizer,
            loss: MeanSquaredError::new(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn network(&self) -> &ResidualNetwork {
        &self.network
    }

    fn guard_input(&self, input: &DVector<f64>) -> RecResult<()> {
        if input.len() != self.dimension {
            return Err(RecError::DimensionMismatch {
                id: "residual".to_string(),
                expected: self.dimension,
                actual: input.len(),
            });
        }
        Ok(())
    }

    fn guard_hidden(&self, hidden: &DVector<f64>) -> RecResult<()> {
        if hidden.len() != self.hidden_size {
            return Err(NnError::ShapeMismatch {
                left: (1, hidden.len()),
                right: (1, self.hidden_size),
            }
            .into());
        }
        Ok(())
    }

    fn joined(input: &DVector<f64>, hidden: &DVector<f64>) -> PureResult<Tensor> {
        concat_columns(&row(input), &row(hidden))
    }

    /// Pure inference: `(h', β)` for input `x` from hidden state `h`.
    pub fn forward(
        &self,
        input: &DVector<f64>,
        hidden: &DVector<f64>,
    ) -> RecResult<(DVector<f64>, DVector<f64>)> {
        self.guard_input(input)?;
        self.guard_hidden(hidden)?;
        let output = self.network.forward(&Self::joined(input, hidden)?)?;
        let (next, beta) = self.network.split_output(&output);
        Ok((column(&next), column(&beta)))
    }

    /// Correction `βᵀx` for `input` given the trajectory in `state`.
    pub fn correction(&self, state: &ResidualState, input: &DVector<f64>) -> RecResult<f64> {
        let (_, beta) = self.forward(input, &state.hidden(self.hidden_size))?;
        Ok(beta.dot(input))
    }

    /// One delayed-bootstrap training call.
    ///
    /// On a fresh trajectory this only records `(input, 0)` as the deferred
    /// step. Afterwards it recomputes `(h, β̂)` from the deferred step, scores
    /// `β̂ᵀ x_prev` against `target`, applies one optimiser step and then
    /// advances the deferred step to `(input, h)`.
    pub fn train_step(
        &mut self,
        state: &mut ResidualState,
        input: &DVector<f64>,
        target: &TrainTarget,
    ) -> RecResult<TrainOutcome> {
        self.guard_input(input)?;
        let Some(deferred) = state.deferred.as_ref() else {
            state.deferred = Some(DeferredStep {
                input: input.clone(),
                hidden: DVector::zeros(self.hidden_size),
            });
            trace!(dimension = self.dimension, "residual trajectory seeded");
            return Ok(TrainOutcome::Seeded);
        };
        if deferred.input.len() != self.dimension || deferred.hidden.len() != self.hidden_size {
            // Foreign trajectory; restart it from this input.
            state.reset();
            return self.train_step(state, input, target);
        }

        let joined = Self::joined(&deferred.input, &deferred.hidden)?;
        let output = self.network.forward(&joined)?;
        let (next, beta) = self.network.split_output(&output);
        let previous = row(&deferred.input);
        let predicted = beta.dot(&previous);

        let (report, grad_beta) = match target {
            TrainTarget::Residual(residual) => {
                let prediction = Tensor::from_element(1, 1, predicted);
                let goal = Tensor::from_element(1, 1, *residual);
                let loss = self.loss.forward(&prediction, &goal)?;
                let grad = self.loss.backward(&prediction, &goal)?[(0, 0)];
                let report = TrainReport {
                    loss,
                    prediction: predicted,
                    reward_loss: loss,
                    preference_loss: 0.0,
                };
                (report, &previous * grad)
            }
            TrainTarget::Blended {
                reward,
                linear,
                preference,
                lambda_reward,
                lambda_pref,
            } => {
                if preference.len() != self.dimension {
                    return Err(RecError::DimensionMismatch {
                        id: "preference".to_string(),
                        expected: self.dimension,
                        actual: preference.len(),
                    });
                }
                let total = linear + predicted;
                let prediction = Tensor::from_element(1, 1, total);
                let goal = Tensor::from_element(1, 1, *reward);
                let reward_loss = self.loss.forward(&prediction, &goal)?;
                let reward_grad = self.loss.backward(&prediction, &goal)?[(0, 0)];
                let wanted = row(preference);
                let preference_loss = self.loss.forward(&beta, &wanted)?;
                let preference_grad = self.loss.backward(&beta, &wanted)?;
                let report = TrainReport {
                    loss: lambda_reward * reward_loss + lambda_pref * preference_loss,
                    prediction: total,
                    reward_loss,
                    preference_loss,
                };
                let grad = &previous * (lambda_reward * reward_grad) + preference_grad * *lambda_pref;
                (report, grad)
            }
        };

        // The prior hidden state is detached, so h' receives no direct gradient.
        let grad_output = concat_columns(&Tensor::zeros(1, self.hidden_size), &grad_beta)?;
        self.network.zero_accumulators()?;
        self.network.backward(&joined, &grad_output)?;
        self.optimizer.step(&mut self.network)?;

        state.deferred = Some(DeferredStep {
            input: input.clone(),
            hidden: column(&next),
        });
        state.updates += 1;
        trace!(loss = report.loss, updates = state.updates, "residual update");
        Ok(TrainOutcome::Trained(report))
    }

    /// Parameter tensors keyed by their canonical names.
    pub fn state_dict(&self) -> RecResult<BTreeMap<String, Tensor>> {
        Ok(self.network.state_dict()?)
    }

    /// Restores every parameter whose name and shape match; the rest keep
    /// their freshly initialised values.
    pub fn load_state_dict(&mut self, state: &BTreeMap<String, Tensor>) -> RecResult<StateLoadReport> {
        let report = self.network.load_state_dict_lenient(state)?;
        if !report.loaded.is_empty() {
            self.optimizer.reset();
        }
        Ok(report)
    }
}

fn row(vector: &DVector<f64>) -> Tensor {
    Tensor::from_row_slice(1, vector.len(), vector.as_slice())
}

fn column(tensor: &Tensor) -> DVector<f64> {
    DVector::from_iterator(tensor.len(), tensor.iter().copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn model(seed: u64) -> ResidualModel {
        ResidualModel::new(3, 5, 1e-2, ResidualOptimizer::Adam, Some(seed)).unwrap()
    }

    #[test]
    fn forward_is_pure_and_shaped() {
        let model = model(1);
        let x = DVector::from_vec(vec![0.2, -0.4, 0.9]);
        let h = DVector::from_element(5, 0.1);
        let (next, beta) = model.forward(&x, &h).unwrap();
        assert_eq!(next.len(), 5);
        assert_eq!(beta.len(), 3);
        assert_eq!(model.forward(&x, &h).unwrap(), (next, beta));
    }

    #[test]
    fn forward_rejects_wrong_context_length() {
        let model = model(1);
        let err = model
            .forward(&DVector::zeros(4), &DVector::zeros(5))
            .unwrap_err();
        assert!(matches!(err, RecError::DimensionMismatch { expected: 3, actual: 4, .. }));
    }

    #[test]
    fn first_call_only_seeds() {
        let mut model = model(2);
        let before = model.state_dict().unwrap();
        let mut state = ResidualState::new();
        let x = DVector::from_vec(vec![1.0, 0.0, 0.0]);

        let outcome = model
            .train_step(&mut state, &x, &TrainTarget::Residual(1.0))
            .unwrap();
        assert_eq!(outcome, TrainOutcome::Seeded);
        assert_eq!(model.state_dict().unwrap(), before);
        let deferred = state.deferred().unwrap();
        assert_eq!(deferred.input, x);
        assert_eq!(deferred.hidden, DVector::zeros(5));
        assert_eq!(state.updates(), 0);
    }

    #[test]
    fn second_call_scores_the_first_input() {
        let mut model = model(3);
        let mut state = ResidualState::new();
        let first = DVector::from_vec(vec![0.5, -0.5, 1.0]);
        let second = DVector::from_vec(vec![-1.0, 2.0, 0.25]);

        model
            .train_step(&mut state, &first, &TrainTarget::Residual(0.0))
            .unwrap();
        let before = model.state_dict().unwrap();

        // Expected prediction from the *first* input and the zero hidden state.
        let (expected_hidden, beta) = model.forward(&first, &DVector::zeros(5)).unwrap();
        let expected_prediction = beta.dot(&first);
        let (_, beta_second) = model.forward(&second, &DVector::zeros(5)).unwrap();
        assert!((beta_second.dot(&second) - expected_prediction).abs() > 1e-9);

        let outcome = model
            .train_step(&mut state, &second, &TrainTarget::Residual(0.7))
            .unwrap();
        let TrainOutcome::Trained(report) = outcome else {
            panic!("second call must train, got {outcome:?}");
        };
        assert_relative_eq!(report.prediction, expected_prediction, epsilon = 1e-12);
        assert_relative_eq!(
            report.loss,
            (expected_prediction - 0.7).powi(2),
            epsilon = 1e-12
        );
        assert_ne!(model.state_dict().unwrap(), before);

        let deferred = state.deferred().unwrap();
        assert_eq!(deferred.input, second);
        assert_eq!(deferred.hidden, expected_hidden);
        assert_eq!(state.updates(), 1);
    }

    #[test]
    fn repeated_training_reduces_residual_error() {
        let mut model = ResidualModel::new(2, 8, 5e-2, ResidualOptimizer::Adam, Some(9)).unwrap();
        let mut state = ResidualState::new();
        let x = DVector::from_vec(vec![1.0, 0.5]);
        model
            .train_step(&mut state, &x, &TrainTarget::Residual(0.8))
            .unwrap();
        let mut losses = Vec::new();
        for _ in 0..200 {
            if let TrainOutcome::Trained(report) = model
                .train_step(&mut state, &x, &TrainTarget::Residual(0.8))
                .unwrap()
            {
                losses.push(report.loss);
            }
        }
        let tail: f64 = losses[190..].iter().sum::<f64>() / 10.0;
        assert!(tail < losses[0], "{tail} vs {}", losses[0]);
        assert!(tail < 5e-2, "tail loss {tail}");
    }

    #[test]
    fn blended_target_reports_both_terms() {
        let mut model = model(4);
        let mut state = ResidualState::new();
        let x = DVector::from_vec(vec![0.3, 0.3, 0.3]);
        let target = TrainTarget::Blended {
            reward: 1.0,
            linear: 0.25,
            preference: DVector::from_vec(vec![1.0, 0.0, 0.0]),
            lambda_reward: 1.0,
            lambda_pref: 0.5,
        };
        model.train_step(&mut state, &x, &target).unwrap();
        let TrainOutcome::Trained(report) = model.train_step(&mut state, &x, &target).unwrap()
        else {
            panic!("expected a parameter update");
        };
        assert!(report.preference_loss > 0.0);
        assert_relative_eq!(
            report.loss,
            report.reward_loss + 0.5 * report.preference_loss,
            epsilon = 1e-12
        );
    }

    #[test]
    fn foreign_trajectory_is_reseeded() {
        let mut model = model(5);
        let mut state = ResidualState::from_parts(
            Some(DeferredStep {
                input: DVector::zeros(7),
                hidden: DVector::zeros(2),
            }),
            4,
        );
        let x = DVector::from_vec(vec![1.0, 1.0, 1.0]);
        let outcome = model
            .train_step(&mut state, &x, &TrainTarget::Residual(0.0))
            .unwrap();
        assert_eq!(outcome, TrainOutcome::Seeded);
        assert_eq!(state.updates(), 0);
    }

    #[test]
    fn state_dict_round_trip_keeps_mismatched_parameters() {
        let source = model(6);
        let mut target = model(7);
        let mut state = source.state_dict().unwrap();
        state.insert(format!("{HEAD_NAME}::bias"), Tensor::zeros(1, 9));
        let report = target.load_state_dict(&state).unwrap();
        assert_eq!(report.kept, vec![format!("{HEAD_NAME}::bias")]);
        let restored = target.state_dict().unwrap();
        assert_eq!(
            restored[&format!("{CELL_NAME}::weight_ih")],
            state[&format!("{CELL_NAME}::weight_ih")]
        );
        assert_ne!(restored[&format!("{HEAD_NAME}::bias")].shape(), (1, 9));
    }
}
