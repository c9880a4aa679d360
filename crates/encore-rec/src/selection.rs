// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::arms::ArmStore;
use crate::error::{RecError, RecResult};
use crate::linucb::LinUcbScorer;
use crate::residual::{ResidualModel, ResidualState};
use nalgebra::DVector;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Scoring strategy used by selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Policy {
    /// Uniform random order, no scores.
    #[serde(rename = "random", alias = "Random")]
    Random,
    /// Plain disjoint LinUCB.
    #[default]
    #[serde(rename = "linucb", alias = "LinUCB")]
    LinUcb,
    /// LinUCB plus the residual correction `βᵀx`.
    #[serde(rename = "linucb+", alias = "LinUCB+")]
    LinUcbResidual,
}

impl Policy {
    /// Whether feedback trains the residual corrector and selection adds its
    /// correction.
    pub fn uses_residual(self) -> bool {
        matches!(self, Policy::LinUcbResidual)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Policy::Random => "random",
            Policy::LinUcb => "linucb",
            Policy::LinUcbResidual => "linucb+",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Policy {
    type Err = RecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(Policy::Random),
            "linucb" => Ok(Policy::LinUcb),
            "linucb+" | "linucb-residual" => Ok(Policy::LinUcbResidual),
            other => Err(RecError::configuration(
                "policy",
                format!("unknown policy `{other}`, expected random, linucb or linucb+"),
            )),
        }
    }
}

/// An item offered for ranking.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub id: String,
    /// Context vector. When absent the learner falls back to the last vector
    /// it saw for this id.
    pub features: Option<DVector<f64>>,
}

impl Candidate {
    pub fn new(id: impl Into<String>, features: DVector<f64>) -> Self {
        Self {
            id: id.into(),
            features: Some(features),
        }
    }

    pub fn from_slice(id: impl Into<String>, features: &[f64]) -> Self {
        Self::new(id, DVector::from_column_slice(features))
    }

    /// Candidate referenced by id only.
    pub fn without_features(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            features: None,
        }
    }
}

/// How a ranked score was assembled.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreBreakdown {
    pub exploit: f64,
    pub bonus: f64,
    /// `βᵀx`, zero unless the residual policy is active.
    pub residual: f64,
    /// Whether the repeat discount was applied.
    pub discounted: bool,
}

/// One entry of a selection result.
#[derive(Clone, Debug, PartialEq)]
pub struct RankedItem {
    pub id: String,
    /// Position of the item in the candidate slice.
    pub position: usize,
    /// Final score; `None` for random picks.
    pub score: Option<f64>,
    pub breakdown: Option<ScoreBreakdown>,
}

/// Read-only view of the learner needed to rank candidates.
pub(crate) struct SelectionContext<'a> {
    pub policy: Policy,
    pub discount: f64,
    pub arms: &'a ArmStore,
    pub scorer: &'a LinUcbScorer,
    pub residual: &'a ResidualModel,
    pub residual_state: &'a ResidualState,
    pub last_selected: Option<&'a str>,
}

/// Resolves the usable feature vector for a candidate: its own vector, or the
/// one remembered by the store. Vectors with non-finite entries count as
/// missing; vectors of the wrong length are errors.
pub(crate) fn resolve_features<'c>(
    arms: &'c ArmStore,
    candidate: &'c Candidate,
) -> RecResult<Option<&'c DVector<f64>>> {
    let features = candidate
        .features
        .as_ref()
        .or_else(|| arms.by_id(&candidate.id).and_then(|record| record.features()));
    let Some(features) = features else {
        return Ok(None);
    };
    if features.len() != arms.dimension() {
        return Err(RecError::DimensionMismatch {
            id: candidate.id.clone(),
            expected: arms.dimension(),
            actual: features.len(),
        });
    }
    if features.iter().any(|value| !value.is_finite()) {
        return Ok(None);
    }
    Ok(Some(features))
}

impl SelectionContext<'_> {
    /// Ranks `candidates` and returns the best `n`.
    pub fn select<R: Rng + ?Sized>(
        &self,
        candidates: &[Candidate],
        n: usize,
        rng: &mut R,
    ) -> RecResult<Vec<RankedItem>> {
        if n == 0 || candidates.is_empty() {
            return Ok(Vec::new());
        }
        if self.policy == Policy::Random {
            return Ok(random_pick(candidates, n, rng));
        }

        let cold = self.arms.cold_statistics();
        let mut scored = Vec::with_capacity(candidates.len());
        for (position, candidate) in candidates.iter().enumerate() {
            let Some(features) = resolve_features(self.arms, candidate)? else {
                debug!(id = %candidate.id, "skipping candidate without feature context");
                continue;
            };
            // Unknown arms are scored against virtual cold-start statistics.
            let stats = self
                .arms
                .by_id(&candidate.id)
                .map(|record| record.stats())
                .unwrap_or(&cold);
            let estimate = self.scorer.score(&candidate.id, stats, features)?;
            let residual = if self.policy.uses_residual() {
                self.residual.correction(self.residual_state, features)?
            } else {
                0.0
            };
            let mut score = estimate.score + residual;
            let discounted = self.last_selected == Some(candidate.id.as_str());
            if discounted {
                score *= self.discount;
            }
            scored.push(RankedItem {
                id: candidate.id.clone(),
                position,
                score: Some(score),
                breakdown: Some(ScoreBreakdown {
                    exploit: estimate.exploit,
                    bonus: estimate.bonus,
                    residual,
                    discounted,
                }),
            });
        }

        if scored.is_empty() {
            debug!(
                candidates = candidates.len(),
                "no candidate carries feature context, falling back to uniform choice"
            );
            return Ok(random_pick(candidates, n, rng));
        }

        Ok(rank(scored, n))
    }
}

/// Stable descending sort by score; ties keep candidate order.
pub(crate) fn rank(mut scored: Vec<RankedItem>, n: usize) -> Vec<RankedItem> {
    scored.sort_by(|left, right| {
        let l = left.score.unwrap_or(f64::NEG_INFINITY);
        let r = right.score.unwrap_or(f64::NEG_INFINITY);
        r.total_cmp(&l)
    });
    scored.truncate(n);
    scored
}

/// Uniformly random choice of up to `n` distinct candidates.
pub(crate) fn random_pick<R: Rng + ?Sized>(
    candidates: &[Candidate],
    n: usize,
    rng: &mut R,
) -> Vec<RankedItem> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.shuffle(rng);
    order
        .into_iter()
        .take(n)
        .map(|position| RankedItem {
            id: candidates[position].id.clone(),
            position,
            score: None,
            breakdown: None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn item(id: &str, position: usize, score: f64) -> RankedItem {
        RankedItem {
            id: id.to_string(),
            position,
            score: Some(score),
            breakdown: None,
        }
    }

    #[test]
    fn rank_is_stable_for_ties() {
        let ranked = rank(
            vec![item("a", 0, 1.0), item("b", 1, 2.0), item("c", 2, 1.0), item("d", 3, 2.0)],
            4,
        );
        let ids: Vec<_> = ranked.iter().map(|entry| entry.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn rank_truncates_without_complaint() {
        assert_eq!(rank(vec![item("a", 0, 1.0)], 5).len(), 1);
        assert!(rank(vec![item("a", 0, 1.0)], 0).is_empty());
    }

    #[test]
    fn random_pick_returns_distinct_candidates() {
        let candidates: Vec<_> = (0..6)
            .map(|i| Candidate::without_features(format!("song-{i}")))
            .collect();
        let mut rng = StdRng::seed_from_u64(12);
        let picked = random_pick(&candidates, 4, &mut rng);
        assert_eq!(picked.len(), 4);
        let mut positions: Vec<_> = picked.iter().map(|entry| entry.position).collect();
        positions.sort_unstable();
        positions.dedup();
        assert_eq!(positions.len(), 4);
        assert!(picked.iter().all(|entry| entry.score.is_none()));
    }

    #[test]
    fn policy_parses_legacy_names() {
        assert_eq!("LinUCB".parse::<Policy>().unwrap(), Policy::LinUcb);
        assert_eq!("LinUCB+".parse::<Policy>().unwrap(), Policy::LinUcbResidual);
        assert_eq!("random".parse::<Policy>().unwrap(), Policy::Random);
        assert!("thompson".parse::<Policy>().is_err());
        assert_eq!(Policy::LinUcbResidual.to_string(), "linucb+");
    }

    #[test]
    fn missing_and_non_finite_features_resolve_to_none() {
        let store = ArmStore::new(2, 1.0);
        let absent = Candidate::without_features("a");
        assert!(resolve_features(&store, &absent).unwrap().is_none());
        let nan = Candidate::from_slice("b", &[f64::NAN, 1.0]);
        assert!(resolve_features(&store, &nan).unwrap().is_none());
        let wrong = Candidate::from_slice("c", &[1.0, 2.0, 3.0]);
        assert!(matches!(
            resolve_features(&store, &wrong),
            Err(RecError::DimensionMismatch { expected: 2, actual: 3, .. })
        ));
    }
}
