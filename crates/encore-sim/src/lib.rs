// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Synthetic listeners and song catalogs used to pretrain an
//! [`encore_rec::Learner`] offline.

pub mod catalog;
pub mod error;
pub mod pretrain;
pub mod user;

pub use catalog::{CatalogConfig, CatalogSimulator, Popularity, Song};
pub use error::{SimError, SimResult};
pub use pretrain::{EpisodeStats, PretrainConfig, Pretrainer};
pub use user::{RewardMode, StepInfo, UserSimulator, UserSimulatorConfig};
