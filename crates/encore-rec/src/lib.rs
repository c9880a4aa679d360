// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Online song recommender built around a disjoint LinUCB bandit.
//!
//! Each song is an arm with its own ridge-regression statistics `(A, b)`.
//! Selection ranks candidates by `θᵀx + α·sqrt(xᵀA⁻¹x)`, optionally adding a
//! global correction `βᵀx` predicted by a small recurrent model that follows
//! the listener's drifting taste, and discounts the song that was picked last.
//! Learner state lives in per-partition snapshot files which are merged on
//! save so requests with overlapping candidate subsets never clobber each
//! other's arms.

pub mod arms;
pub mod config;
pub mod error;
pub mod learner;
pub mod linucb;
pub mod partition;
pub mod residual;
pub mod selection;
pub mod snapshot;

pub use arms::{ArmHandle, ArmRecord, ArmStatistics, ArmStore, StatisticsDefect};
pub use config::{LearnerConfig, ResidualOptimizer};
pub use error::{RecError, RecResult};
pub use learner::{FeedbackReport, Learner, LoadReport, SaveReport};
pub use linucb::{LinUcbScorer, UcbEstimate};
pub use partition::PartitionStore;
pub use residual::{
    DeferredStep, ResidualModel, ResidualState, TrainOutcome, TrainReport, TrainTarget,
};
pub use selection::{Candidate, Policy, RankedItem, ScoreBreakdown};
pub use snapshot::{ArmEntry, SnapshotArchive, StoredArray};
