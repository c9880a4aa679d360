// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::arms::ArmStatistics;
use crate::error::{RecError, RecResult};
use nalgebra::{Cholesky, DVector, Dyn};

/// Point estimate and confidence bonus for one arm/context pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UcbEstimate {
    /// `θᵀx`
    pub exploit: f64,
    /// `α · sqrt(xᵀ A⁻¹ x)`
    pub bonus: f64,
    pub score: f64,
}

/// Disjoint LinUCB scoring:
///
/// ```text
///   θ     = A⁻¹ b
///   score = θᵀx + α · sqrt(xᵀ A⁻¹ x)
/// ```
///
/// Solves go through a Cholesky factor of `A`; no inverse is cached across
/// rounds because `A` changes with every feedback event.
#[derive(Clone, Copy, Debug)]
pub struct LinUcbScorer {
    alpha: f64,
}

impl LinUcbScorer {
    pub fn new(alpha: f64) -> RecResult<Self> {
        if !alpha.is_finite() || alpha < 0.0 {
            return Err(RecError::configuration(
                "alpha",
                format!("exploration weight must be non-negative, got {alpha}"),
            ));
        }
        Ok(Self { alpha })
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    fn factor(id: &str, stats: &ArmStatistics) -> RecResult<Cholesky<f64, Dyn>> {
        stats
            .design()
            .clone()
            .cholesky()
            .ok_or_else(|| RecError::NotPositiveDefinite { id: id.to_string() })
    }

    fn guard(id: &str, stats: &ArmStatistics, features: &DVector<f64>) -> RecResult<()> {
        if features.len() != stats.dimension() {
            return Err(RecError::DimensionMismatch {
                id: id.to_string(),
                expected: stats.dimension(),
                actual: features.len(),
            });
        }
        Ok(())
    }

    /// Ridge coefficient estimate `θ = A⁻¹ b`.
    pub fn theta(&self, id: &str, stats: &ArmStatistics) -> RecResult<DVector<f64>> {
        Ok(Self::factor(id, stats)?.solve(stats.response()))
    }

    /// Scores `features` against the arm's statistics.
    pub fn score(
        &self,
        id: &str,
        stats: &ArmStatistics,
        features: &DVector<f64>,
    ) -> RecResult<UcbEstimate> {
        Self::guard(id, stats, features)?;
        let factor = Self::factor(id, stats)?;
        let theta = factor.solve(stats.response());
        let exploit = theta.dot(features);
        let spread = features.dot(&factor.solve(features)).max(0.0);
        let bonus = self.alpha * spread.sqrt();
        Ok(UcbEstimate {
            exploit,
            bonus,
            score: exploit + bonus,
        })
    }
}
