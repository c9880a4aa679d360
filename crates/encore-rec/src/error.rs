// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use encore_nn::NnError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the learner.
#[derive(Debug, Error)]
pub enum RecError {
    /// Hyperparameters rejected at construction time.
    #[error("invalid configuration for `{field}`: {reason}")]
    Configuration { field: &'static str, reason: String },

    /// A feature vector disagrees with the arm's statistics or the configured
    /// context dimension.
    #[error("arm `{id}` expects {expected}-dimensional features but received {actual}")]
    DimensionMismatch {
        id: String,
        expected: usize,
        actual: usize,
    },

    /// The arm was referenced without a usable feature vector.
    #[error("arm `{id}` has no usable feature vector")]
    MissingFeatureContext { id: String },

    #[error("snapshot storage at {path:?} is unavailable: {source}")]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot at {path:?} could not be processed: {reason}")]
    Snapshot { path: PathBuf, reason: String },

    #[error("reward must be a finite real, got {reward}")]
    NonFiniteReward { reward: f64 },

    #[error("statistics for arm `{id}` are not positive definite")]
    NotPositiveDefinite { id: String },

    #[error("arm `{id}` is not registered")]
    UnknownArm { id: String },

    #[error("failed to decode configuration section: {0}")]
    ConfigSection(#[from] serde_json::Error),

    #[error(transparent)]
    Residual(#[from] NnError),
}

impl RecError {
    pub(crate) fn configuration(field: &'static str, reason: impl Into<String>) -> Self {
        RecError::Configuration {
            field,
            reason: reason.into(),
        }
    }

    /// Returns `true` for failures that a load treats as a cold start.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            RecError::StorageUnavailable { .. } | RecError::Snapshot { .. }
        )
    }
}

/// Convenient result alias for learner operations.
pub type RecResult<T> = Result<T, RecError>;
