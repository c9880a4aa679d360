// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::arms::{ArmHandle, ArmStatistics, ArmStore};
use crate::config::LearnerConfig;
use crate::error::{RecError, RecResult};
use crate::linucb::{LinUcbScorer, UcbEstimate};
use crate::residual::{DeferredStep, ResidualModel, ResidualState, TrainOutcome, TrainTarget};
use crate::selection::{resolve_features, Candidate, Policy, RankedItem, SelectionContext};
use crate::snapshot::{ArmEntry, SnapshotArchive, StoredArray};
use encore_config::determinism;
use encore_nn::Tensor;
use nalgebra::DVector;
use rand::Rng;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const RNN_PREFIX: &str = "rnn_";
const STATE_INPUT: &str = "state_input";
const STATE_HIDDEN: &str = "state_hidden";
const STATE_UPDATES: &str = "rnn_state_updates";

/// Outcome of one feedback event.
#[derive(Clone, Debug, PartialEq)]
pub struct FeedbackReport {
    pub handle: ArmHandle,
    /// `reward − θᵀx` before the update, when the residual policy is active.
    pub residual: Option<f64>,
    pub training: Option<TrainOutcome>,
}

/// Outcome of [`Learner::save`].
#[derive(Clone, Debug, PartialEq)]
pub struct SaveReport {
    pub path: PathBuf,
    /// Arms written from the working set.
    pub written: usize,
    /// Arms recorded in the file after the merge.
    pub total: usize,
    /// Removed arms dropped from the file.
    pub dropped: usize,
}

/// Outcome of [`Learner::load`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadReport {
    /// Working-set arms restored from the snapshot.
    pub restored: usize,
    /// Working-set arms re-initialised because the snapshot had no entry.
    pub initialised: usize,
    /// Working-set arms re-initialised because their entry was unusable.
    pub corrupt: Vec<String>,
    /// Residual parameters that kept their fresh values.
    pub residual_kept: Vec<String>,
    /// Whether the snapshot could not be read at all.
    pub cold_start: bool,
}

struct PreferenceBlend<'a> {
    preference: &'a DVector<f64>,
    lambda_reward: f64,
    lambda_pref: f64,
}

/// Per-partition online learner: arm statistics, LinUCB scoring, residual
/// corrector and repeat avoidance.
#[derive(Debug)]
pub struct Learner {
    config: LearnerConfig,
    arms: ArmStore,
    scorer: LinUcbScorer,
    residual: ResidualModel,
    residual_state: ResidualState,
    last_selected: Option<String>,
}

impl Learner {
    /// Validates `config` and builds an empty learner.
    pub fn new(config: LearnerConfig) -> RecResult<Self> {
        config.validate()?;
        let scorer = LinUcbScorer::new(config.alpha)?;
        let residual = ResidualModel::new(
            config.dimension,
            config.hidden_size,
            config.learning_rate,
            config.residual_optimizer,
            config.seed,
        )?;
        Ok(Self {
            arms: ArmStore::new(config.dimension, config.l2),
            scorer,
            residual,
            residual_state: ResidualState::new(),
            last_selected: None,
            config,
        })
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub fn policy(&self) -> Policy {
        self.config.policy
    }

    pub fn set_policy(&mut self, policy: Policy) {
        self.config.policy = policy;
    }

    pub fn arms(&self) -> &ArmStore {
        &self.arms
    }

    pub fn residual_model(&self) -> &ResidualModel {
        &self.residual
    }

    pub fn residual_state(&self) -> &ResidualState {
        &self.residual_state
    }

    /// Swaps in an externally owned trajectory, returning the previous one.
    pub fn replace_residual_state(&mut self, state: ResidualState) -> ResidualState {
        std::mem::replace(&mut self.residual_state, state)
    }

    pub fn last_selected(&self) -> Option<&str> {
        self.last_selected.as_deref()
    }

    /// Forgets the last selection so no repeat discount applies.
    pub fn reset_session(&mut self) {
        self.last_selected = None;
    }

    /// Adds a candidate to the working set without feedback.
    pub fn register(&mut self, candidate: &Candidate) -> RecResult<ArmHandle> {
        let features = resolve_features(&self.arms, candidate)?.cloned();
        let dimension = features
            .as_ref()
            .map_or(self.config.dimension, DVector::len);
        let handle = self.arms.ensure(&candidate.id, dimension)?;
        if let Some(features) = features {
            self.arms.set_features(handle, features)?;
        }
        Ok(handle)
    }

    pub fn register_all(&mut self, candidates: &[Candidate]) -> RecResult<()> {
        for candidate in candidates {
            self.register(candidate)?;
        }
        Ok(())
    }

    /// Ridge estimate `θ` of a registered arm.
    pub fn theta(&self, id: &str) -> RecResult<DVector<f64>> {
        let record = self
            .arms
            .by_id(id)
            .ok_or_else(|| RecError::UnknownArm { id: id.to_string() })?;
        self.scorer.theta(id, record.stats())
    }

    /// LinUCB estimate for `features` against the arm's current statistics,
    /// or cold-start statistics when the arm is unknown.
    pub fn estimate(&self, id: &str, features: &DVector<f64>) -> RecResult<UcbEstimate> {
        match self.arms.by_id(id) {
            Some(record) => self.scorer.score(id, record.stats(), features),
            None => self.scorer.score(id, &self.arms.cold_statistics(), features),
        }
    }

    /// Ranks `candidates` and returns the best `n` (fewer when there are not
    /// enough candidates, none when `n == 0`). Randomness comes from the
    /// process determinism settings.
    pub fn select(&self, candidates: &[Candidate], n: usize) -> RecResult<Vec<RankedItem>> {
        let mut rng = determinism::rng_from_label("encore-rec::selection");
        self.select_with_rng(candidates, n, &mut rng)
    }

    /// [`Learner::select`] with caller-supplied randomness.
    pub fn select_with_rng<R: Rng + ?Sized>(
        &self,
        candidates: &[Candidate],
        n: usize,
        rng: &mut R,
    ) -> RecResult<Vec<RankedItem>> {
        SelectionContext {
            policy: self.config.policy,
            discount: self.config.discount,
            arms: &self.arms,
            scorer: &self.scorer,
            residual: &self.residual,
            residual_state: &self.residual_state,
            last_selected: self.last_selected.as_deref(),
        }
        .select(candidates, n, rng)
    }

    /// Records `reward` for `candidate`: initialises the arm if needed,
    /// trains the residual corrector on `reward − θᵀx` (residual policy only),
    /// applies the rank-1 update and marks the arm as last selected.
    pub fn feedback(&mut self, candidate: &Candidate, reward: f64) -> RecResult<FeedbackReport> {
        self.apply_feedback(candidate, reward, None)
    }

    /// Training-time feedback: like [`Learner::feedback`], but the residual
    /// corrector is fitted to the blended reward/preference objective with a
    /// known preference vector.
    pub fn feedback_with_preference(
        &mut self,
        candidate: &Candidate,
        reward: f64,
        preference: &DVector<f64>,
        lambda_reward: f64,
        lambda_pref: f64,
    ) -> RecResult<FeedbackReport> {
        self.apply_feedback(
            candidate,
            reward,
            Some(PreferenceBlend {
                preference,
                lambda_reward,
                lambda_pref,
            }),
        )
    }

    fn apply_feedback(
        &mut self,
        candidate: &Candidate,
        reward: f64,
        blend: Option<PreferenceBlend<'_>>,
    ) -> RecResult<FeedbackReport> {
        if !reward.is_finite() {
            return Err(RecError::NonFiniteReward { reward });
        }
        let features = resolve_features(&self.arms, candidate)?
            .cloned()
            .ok_or_else(|| RecError::MissingFeatureContext {
                id: candidate.id.clone(),
            })?;
        let handle = self.arms.ensure(&candidate.id, features.len())?;

        let (residual, training) = if self.config.policy.uses_residual() {
            let stats = self.stats(handle)?;
            let theta = self.scorer.theta(&candidate.id, stats)?;
            let linear = theta.dot(&features);
            let residual = reward - linear;
            let target = match blend {
                Some(blend) => TrainTarget::Blended {
                    reward,
                    linear,
                    preference: blend.preference.clone(),
                    lambda_reward: blend.lambda_reward,
                    lambda_pref: blend.lambda_pref,
                },
                None => TrainTarget::Residual(residual),
            };
            let outcome =
                self.residual
                    .train_step(&mut self.residual_state, &features, &target)?;
            (Some(residual), Some(outcome))
        } else {
            (None, None)
        };

        self.arms.update(handle, &features, reward)?;
        self.arms.set_features(handle, features)?;
        self.last_selected = Some(candidate.id.clone());
        debug!(id = %candidate.id, reward, residual, "feedback applied");
        Ok(FeedbackReport {
            handle,
            residual,
            training,
        })
    }

    /// [`Learner::feedback`] for an arm whose features the learner already
    /// knows.
    pub fn feedback_by_id(&mut self, id: &str, reward: f64) -> RecResult<FeedbackReport> {
        if !self.arms.contains(id) {
            return Err(RecError::UnknownArm { id: id.to_string() });
        }
        self.feedback(&Candidate::without_features(id), reward)
    }

    /// Adds a new arm and applies the small seed reward so it keeps some
    /// exploration mass. Does not change the last selected arm.
    pub fn add_item(&mut self, candidate: &Candidate) -> RecResult<FeedbackReport> {
        let previous = self.last_selected.take();
        let report = self.feedback(candidate, self.config.seed_reward);
        self.last_selected = previous;
        report
    }

    /// Applies the large negative removal reward, then drops the arm's
    /// statistics. The next save removes the arm from disk too.
    pub fn remove_item(&mut self, candidate: &Candidate) -> RecResult<FeedbackReport> {
        let previous = self.last_selected.take();
        let report = self.feedback(candidate, self.config.removal_reward)?;
        self.arms.remove(&candidate.id);
        self.last_selected = previous.filter(|id| id != &candidate.id);
        info!(id = %candidate.id, "arm removed");
        Ok(report)
    }

    fn stats(&self, handle: ArmHandle) -> RecResult<&ArmStatistics> {
        self.arms
            .get(handle)
            .map(|record| record.stats())
            .ok_or_else(|| RecError::UnknownArm {
                id: format!("#{}", handle.index()),
            })
    }

    /// Merge-on-save: reads whatever is on disk at `path`, overlays the
    /// working set and the residual model, drops removed arms and writes the
    /// union back atomically.
    pub fn save(&mut self, path: impl AsRef<Path>) -> RecResult<SaveReport> {
        let path = path.as_ref();
        let mut archive = SnapshotArchive::read_or_empty(path);
        if let Some(stored) = archive.scalar("dimension") {
            if stored as usize != self.config.dimension {
                return Err(RecError::DimensionMismatch {
                    id: path.display().to_string(),
                    expected: stored as usize,
                    actual: self.config.dimension,
                });
            }
        }

        let mut dropped = 0;
        for id in self.arms.tombstones() {
            if archive.remove_arm(id) {
                dropped += 1;
            }
        }
        for (_, record) in self.arms.iter() {
            archive.insert_arm(record.id(), record.stats());
        }

        let mut rnn = BTreeMap::new();
        for (name, tensor) in self.residual.state_dict()? {
            rnn.insert(name, StoredArray::from_matrix(&tensor));
        }
        if let Some(step) = self.residual_state.deferred() {
            rnn.insert(STATE_INPUT.to_string(), StoredArray::from_vector(&step.input));
            rnn.insert(STATE_HIDDEN.to_string(), StoredArray::from_vector(&step.hidden));
        }
        archive.replace_prefixed(RNN_PREFIX, rnn);
        archive.set_scalar(STATE_UPDATES, self.residual_state.updates() as f64);

        archive.set_scalar("alpha", self.config.alpha);
        archive.set_scalar("l2", self.config.l2);
        archive.set_scalar("discount", self.config.discount);
        archive.set_scalar("dimension", self.config.dimension as f64);
        archive.set_scalar("hidden_size", self.config.hidden_size as f64);
        archive.set_label("policy", self.config.policy.as_str());

        archive.write_atomic(path)?;
        self.arms.clear_tombstones();

        let report = SaveReport {
            path: path.to_path_buf(),
            written: self.arms.len(),
            total: archive.arm_count(),
            dropped,
        };
        info!(
            path = %path.display(),
            written = report.written,
            total = report.total,
            dropped = report.dropped,
            "snapshot saved"
        );
        Ok(report)
    }

    /// Restores the working set from `path`: arms present in the snapshot get
    /// their statistics back, the rest are re-initialised, and arms outside
    /// the working set are never added. An unreadable snapshot degrades to a
    /// cold start; a snapshot recorded for another context dimension is an
    /// error and leaves the learner untouched.
    pub fn load(&mut self, path: impl AsRef<Path>) -> RecResult<LoadReport> {
        let path = path.as_ref();
        let archive = match SnapshotArchive::read(path) {
            Ok(archive) => archive,
            Err(err) if err.is_storage() => {
                match &err {
                    RecError::StorageUnavailable { source, .. }
                        if source.kind() == std::io::ErrorKind::NotFound =>
                    {
                        debug!(path = %path.display(), "no snapshot, cold start");
                    }
                    _ => warn!(path = %path.display(), error = %err, "snapshot unreadable, cold start"),
                }
                return Ok(self.cold_start());
            }
            Err(err) => return Err(err),
        };

        if let Some(stored) = archive.scalar("dimension") {
            if stored as usize != self.config.dimension {
                return Err(RecError::DimensionMismatch {
                    id: path.display().to_string(),
                    expected: self.config.dimension,
                    actual: stored as usize,
                });
            }
        }

        // Validate every working-set entry before touching any of them.
        let mut entries = Vec::with_capacity(self.arms.len());
        for (handle, record) in self.arms.iter() {
            let entry = archive.arm(record.id());
            if let ArmEntry::Present(stats) = &entry {
                if stats.dimension() != self.config.dimension {
                    return Err(RecError::DimensionMismatch {
                        id: record.id().to_string(),
                        expected: self.config.dimension,
                        actual: stats.dimension(),
                    });
                }
            }
            entries.push((handle, record.id().to_string(), entry));
        }

        let mut report = LoadReport::default();
        for (handle, id, entry) in entries {
            let stats = match entry {
                ArmEntry::Present(stats) => {
                    report.restored += 1;
                    stats
                }
                ArmEntry::Absent => {
                    report.initialised += 1;
                    self.arms.cold_statistics()
                }
                ArmEntry::Corrupt(reason) => {
                    warn!(id = %id, reason = %reason, "corrupt arm entry, re-initialising");
                    report.corrupt.push(id);
                    self.arms.cold_statistics()
                }
            };
            self.arms.replace_statistics(handle, stats)?;
        }

        let rnn = archive.arrays_with_prefix(RNN_PREFIX);
        let mut params: BTreeMap<String, Tensor> = BTreeMap::new();
        for (name, stored) in &rnn {
            if name.starts_with("state_") {
                continue;
            }
            if let Some(tensor) = stored.to_matrix() {
                params.insert(name.clone(), tensor);
            }
        }
        if !params.is_empty() {
            let restored = self.residual.load_state_dict(&params)?;
            if !restored.kept.is_empty() {
                warn!(kept = ?restored.kept, "residual parameters kept fresh values");
            }
            report.residual_kept = restored.kept;
        }
        self.residual_state = self.restore_residual_state(&archive, &rnn);

        self.log_hyperparameter_drift(&archive);
        info!(
            path = %path.display(),
            restored = report.restored,
            initialised = report.initialised,
            corrupt = report.corrupt.len(),
            "snapshot loaded"
        );
        Ok(report)
    }

    fn cold_start(&mut self) -> LoadReport {
        let handles: Vec<ArmHandle> = self.arms.iter().map(|(handle, _)| handle).collect();
        let cold = self.arms.cold_statistics();
        for handle in &handles {
            if self.arms.replace_statistics(*handle, cold.clone()).is_err() {
                warn!(handle = handle.index(), "arm vanished during cold start");
            }
        }
        LoadReport {
            initialised: handles.len(),
            cold_start: true,
            ..LoadReport::default()
        }
    }

    fn restore_residual_state(
        &self,
        archive: &SnapshotArchive,
        rnn: &BTreeMap<String, &StoredArray>,
    ) -> ResidualState {
        let input = rnn.get(STATE_INPUT).and_then(|stored| stored.to_vector());
        let hidden = rnn.get(STATE_HIDDEN).and_then(|stored| stored.to_vector());
        let updates = archive
            .scalar(STATE_UPDATES)
            .map(|value| value.max(0.0) as u64)
            .unwrap_or(0);
        match (input, hidden) {
            (Some(input), Some(hidden))
                if input.len() == self.residual.dimension()
                    && hidden.len() == self.residual.hidden_size() =>
            {
                ResidualState::from_parts(Some(DeferredStep { input, hidden }), updates)
            }
            (None, None) => ResidualState::new(),
            _ => {
                warn!("persisted residual trajectory has the wrong shape, starting fresh");
                ResidualState::new()
            }
        }
    }

    fn log_hyperparameter_drift(&self, archive: &SnapshotArchive) {
        for (name, current) in [
            ("alpha", self.config.alpha),
            ("l2", self.config.l2),
            ("discount", self.config.discount),
        ] {
            if let Some(stored) = archive.scalar(name) {
                if stored != current {
                    debug!(name, stored, current, "configured value overrides snapshot");
                }
            }
        }
        if let Some(stored) = archive.label("policy") {
            if stored != self.config.policy.as_str() {
                debug!(stored, current = %self.config.policy, "configured policy overrides snapshot");
            }
        }
    }
}
