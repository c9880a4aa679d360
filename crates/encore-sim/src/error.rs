// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use encore_rec::RecError;
use thiserror::Error;

/// Errors raised while building or driving simulators.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid simulator parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("feature vector has length {actual}, simulator expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("cannot draw {requested} distinct songs from a catalog of {available}")]
    PlaylistTooLong { requested: usize, available: usize },

    #[error("popularity weights are unusable: {reason}")]
    Popularity { reason: String },

    #[error(transparent)]
    Learner(#[from] RecError),
}

impl SimError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        SimError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

impl From<rand::distributions::WeightedError> for SimError {
    fn from(value: rand::distributions::WeightedError) -> Self {
        SimError::Popularity {
            reason: value.to_string(),
        }
    }
}

pub type SimResult<T> = Result<T, SimError>;
