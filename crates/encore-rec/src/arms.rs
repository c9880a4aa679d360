// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{RecError, RecResult};
use nalgebra::{DMatrix, DVector};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

/// Stable index of an arm inside an [`ArmStore`]. Handles are never reused
/// within the lifetime of a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArmHandle(u32);

impl ArmHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Why persisted statistics could not be rebuilt.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StatisticsDefect {
    #[error("design matrix is {rows}x{cols}, expected square")]
    NotSquare { rows: usize, cols: usize },
    #[error("design matrix is {dimension}x{dimension} but response has length {len}")]
    ResponseLength { dimension: usize, len: usize },
    #[error("statistics contain non-finite values")]
    NonFinite,
    #[error("design matrix is not positive definite")]
    NotPositiveDefinite,
}

/// Ridge-regression sufficient statistics for one arm.
///
/// `A` starts at `l2 · I` and only ever gains rank-1 outer products, so it
/// stays symmetric positive definite.
#[derive(Clone, Debug, PartialEq)]
pub struct ArmStatistics {
    design: DMatrix<f64>,
    response: DVector<f64>,
    pulls: u64,
    cumulative_reward: f64,
}

impl ArmStatistics {
    /// Cold-start statistics `A = l2 · I`, `b = 0`.
    pub fn cold(dimension: usize, l2: f64) -> Self {
        Self {
            design: DMatrix::identity(dimension, dimension) * l2,
            response: DVector::zeros(dimension),
            pulls: 0,
            cumulative_reward: 0.0,
        }
    }

    /// Rebuilds statistics from persisted parts, checking that they agree on
    /// shape and that `A` is still positive definite.
    pub fn from_parts(
        design: DMatrix<f64>,
        response: DVector<f64>,
        pulls: u64,
        cumulative_reward: f64,
    ) -> Result<Self, StatisticsDefect> {
        if !design.is_square() {
            return Err(StatisticsDefect::NotSquare {
                rows: design.nrows(),
                cols: design.ncols(),
            });
        }
        if design.nrows() != response.len() {
            return Err(StatisticsDefect::ResponseLength {
                dimension: design.nrows(),
                len: response.len(),
            });
        }
        if design.iter().chain(response.iter()).any(|v| !v.is_finite()) {
            return Err(StatisticsDefect::NonFinite);
        }
        if design.clone().cholesky().is_none() {
            return Err(StatisticsDefect::NotPositiveDefinite);
        }
        Ok(Self {
            design,
            response,
            pulls,
            cumulative_reward,
        })
    }

    pub fn dimension(&self) -> usize {
        self.response.len()
    }

    /// The design matrix `A`.
    pub fn design(&self) -> &DMatrix<f64> {
        &self.design
    }

    /// The response vector `b`.
    pub fn response(&self) -> &DVector<f64> {
        &self.response
    }

    pub fn pulls(&self) -> u64 {
        self.pulls
    }

    pub fn cumulative_reward(&self) -> f64 {
        self.cumulative_reward
    }

    /// Rank-1 update `A += x xᵀ`, `b += r · x`. Callers check the length of
    /// `x` beforehand.
    pub fn update(&mut self, features: &DVector<f64>, reward: f64) {
        self.design += features * features.transpose();
        self.response += features * reward;
        self.pulls += 1;
        self.cumulative_reward += reward;
    }
}

/// One arm of the working set.
#[derive(Clone, Debug)]
pub struct ArmRecord {
    id: String,
    features: Option<DVector<f64>>,
    stats: ArmStatistics,
}

impl ArmRecord {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Most recent feature vector seen for this arm, if any.
    pub fn features(&self) -> Option<&DVector<f64>> {
        self.features.as_ref()
    }

    pub fn stats(&self) -> &ArmStatistics {
        &self.stats
    }
}

/// Arena of arm records addressed by [`ArmHandle`], with a side index from
/// external id to handle. Iteration follows insertion order.
#[derive(Clone, Debug)]
pub struct ArmStore {
    dimension: usize,
    l2: f64,
    slots: Vec<Option<ArmRecord>>,
    index: HashMap<String, ArmHandle>,
    tombstones: BTreeSet<String>,
}

impl ArmStore {
    pub fn new(dimension: usize, l2: f64) -> Self {
        Self {
            dimension,
            l2,
            slots: Vec::new(),
            index: HashMap::new(),
            tombstones: BTreeSet::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn l2(&self) -> f64 {
        self.l2
    }

    /// Fresh statistics for an arm that has never received feedback.
    pub fn cold_statistics(&self) -> ArmStatistics {
        ArmStatistics::cold(self.dimension, self.l2)
    }

    /// Returns the handle for `id`, initialising `A = l2·I_d`, `b = 0_d` when
    /// the arm is absent. Idempotent. `dimension` must match the store's
    /// context dimension and any statistics already held for the arm.
    pub fn ensure(&mut self, id: &str, dimension: usize) -> RecResult<ArmHandle> {
        if let Some(handle) = self.index.get(id).copied() {
            let held = self.slot(handle)?.stats.dimension();
            if held != dimension {
                return Err(RecError::DimensionMismatch {
                    id: id.to_string(),
                    expected: held,
                    actual: dimension,
                });
            }
            return Ok(handle);
        }
        if dimension != self.dimension {
            return Err(RecError::DimensionMismatch {
                id: id.to_string(),
                expected: self.dimension,
                actual: dimension,
            });
        }
        let handle = ArmHandle(self.slots.len() as u32);
        self.slots.push(Some(ArmRecord {
            id: id.to_string(),
            features: None,
            stats: self.cold_statistics(),
        }));
        self.index.insert(id.to_string(), handle);
        self.tombstones.remove(id);
        Ok(handle)
    }

    pub fn handle(&self, id: &str) -> Option<ArmHandle> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, handle: ArmHandle) -> Option<&ArmRecord> {
        self.slots.get(handle.index()).and_then(Option::as_ref)
    }

    pub fn by_id(&self, id: &str) -> Option<&ArmRecord> {
        self.handle(id).and_then(|handle| self.get(handle))
    }

    fn slot(&self, handle: ArmHandle) -> RecResult<&ArmRecord> {
        self.get(handle).ok_or_else(|| RecError::UnknownArm {
            id: format!("#{}", handle.index()),
        })
    }

    fn slot_mut(&mut self, handle: ArmHandle) -> RecResult<&mut ArmRecord> {
        self.slots
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| RecError::UnknownArm {
                id: format!("#{}", handle.index()),
            })
    }

    /// Remembers the latest feature vector for an arm.
    pub fn set_features(&mut self, handle: ArmHandle, features: DVector<f64>) -> RecResult<()> {
        self.slot_mut(handle)?.features = Some(features);
        Ok(())
    }

    /// Applies one rank-1 update.
    pub fn update(
        &mut self,
        handle: ArmHandle,
        features: &DVector<f64>,
        reward: f64,
    ) -> RecResult<()> {
        let record = self.slot_mut(handle)?;
        if features.len() != record.stats.dimension() {
            return Err(RecError::DimensionMismatch {
                id: record.id.clone(),
                expected: record.stats.dimension(),
                actual: features.len(),
            });
        }
        record.stats.update(features, reward);
        Ok(())
    }

    /// Replaces the statistics of an arm wholesale (used when loading).
    pub fn replace_statistics(&mut self, handle: ArmHandle, stats: ArmStatistics) -> RecResult<()> {
        self.slot_mut(handle)?.stats = stats;
        Ok(())
    }

    /// Drops an arm from the working set and records a tombstone so the
    /// next save also drops it from disk.
    pub fn remove(&mut self, id: &str) -> Option<ArmRecord> {
        let handle = self.index.remove(id)?;
        let record = self.slots.get_mut(handle.index()).and_then(Option::take);
        self.tombstones.insert(id.to_string());
        record
    }

    /// Ids removed since the last save.
    pub fn tombstones(&self) -> impl Iterator<Item = &str> {
        self.tombstones.iter().map(String::as_str)
    }

    pub fn clear_tombstones(&mut self) {
        self.tombstones.clear();
    }

    /// Live arms in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ArmHandle, &ArmRecord)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|record| (ArmHandle(idx as u32), record)))
    }

    pub fn ids(&self) -> Vec<String> {
        self.iter().map(|(_, record)| record.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_is_idempotent() {
        let mut store = ArmStore::new(3, 2.0);
        let first = store.ensure("song-a", 3).unwrap();
        store
            .update(first, &DVector::from_vec(vec![1.0, 0.0, 0.0]), 1.0)
            .unwrap();
        let second = store.ensure("song-a", 3).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(first).unwrap().stats().pulls(), 1);
    }

    #[test]
    fn cold_statistics_are_scaled_identity() {
        let mut store = ArmStore::new(2, 0.5);
        let handle = store.ensure("x", 2).unwrap();
        let stats = store.get(handle).unwrap().stats();
        assert_eq!(stats.design(), &(DMatrix::identity(2, 2) * 0.5));
        assert_eq!(stats.response(), &DVector::zeros(2));
    }

    #[test]
    fn ensure_rejects_foreign_dimension() {
        let mut store = ArmStore::new(4, 1.0);
        let err = store.ensure("song", 3).unwrap_err();
        assert!(matches!(
            err,
            RecError::DimensionMismatch {
                expected: 4,
                actual: 3,
                ..
            }
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn rank_one_update_accumulates() {
        let mut stats = ArmStatistics::cold(2, 1.0);
        let x = DVector::from_vec(vec![1.0, 2.0]);
        stats.update(&x, 0.5);
        assert_eq!(stats.design(), &DMatrix::from_row_slice(2, 2, &[2.0, 2.0, 2.0, 5.0]));
        assert_eq!(stats.response(), &DVector::from_vec(vec![0.5, 1.0]));
        assert_eq!(stats.cumulative_reward(), 0.5);
    }

    #[test]
    fn removal_leaves_handles_stable_and_records_tombstone() {
        let mut store = ArmStore::new(1, 1.0);
        let a = store.ensure("a", 1).unwrap();
        let b = store.ensure("b", 1).unwrap();
        assert!(store.remove("a").is_some());
        assert!(store.get(a).is_none());
        assert_eq!(store.get(b).unwrap().id(), "b");
        assert_eq!(store.tombstones().collect::<Vec<_>>(), vec!["a"]);

        let c = store.ensure("c", 1).unwrap();
        assert_ne!(c, a);
        assert_eq!(store.ids(), vec!["b".to_string(), "c".to_string()]);

        store.ensure("a", 1).unwrap();
        assert_eq!(store.tombstones().count(), 0);
    }

    #[test]
    fn from_parts_names_the_defect() {
        let rebuild = |design: DMatrix<f64>, len: usize| {
            ArmStatistics::from_parts(design, DVector::zeros(len), 0, 0.0)
        };
        assert_eq!(
            rebuild(DMatrix::identity(2, 3), 2).unwrap_err(),
            StatisticsDefect::NotSquare { rows: 2, cols: 3 }
        );
        assert_eq!(
            rebuild(DMatrix::identity(2, 2), 3).unwrap_err(),
            StatisticsDefect::ResponseLength { dimension: 2, len: 3 }
        );
        let mut poisoned = DMatrix::identity(2, 2);
        poisoned[(0, 1)] = f64::NAN;
        assert_eq!(rebuild(poisoned, 2).unwrap_err(), StatisticsDefect::NonFinite);
        assert_eq!(
            rebuild(-DMatrix::<f64>::identity(2, 2), 2).unwrap_err(),
            StatisticsDefect::NotPositiveDefinite
        );
        assert!(rebuild(DMatrix::identity(2, 2), 2).is_ok());
        assert_eq!(
            StatisticsDefect::ResponseLength { dimension: 2, len: 3 }.to_string(),
            "design matrix is 2x2 but response has length 3"
        );
    }
}
