// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Compressed archive of named arrays backing a storage partition.
//!
//! Layout: gzip stream wrapping a bincode-encoded [`SnapshotArchive`].
//! Arm statistics use the keys `A_<id>` and `b_<id>` (plus the scalars
//! `pulls_<id>` and `reward_<id>`); residual parameters are stored under
//! `rnn_`.

use crate::arms::ArmStatistics;
use crate::error::{RecError, RecResult};
use bincode::Options;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Current archive layout version.
pub const SNAPSHOT_VERSION: u32 = 1;

const DESIGN_PREFIX: &str = "A_";
const RESPONSE_PREFIX: &str = "b_";
const PULLS_PREFIX: &str = "pulls_";
const REWARD_PREFIX: &str = "reward_";

/// Serialisable matrix stored row-major alongside its shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredArray {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl StoredArray {
    pub fn from_matrix(matrix: &DMatrix<f64>) -> Self {
        let (rows, cols) = matrix.shape();
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            data.extend(matrix.row(r).iter().copied());
        }
        Self { rows, cols, data }
    }

    /// Stores a vector as a single column.
    pub fn from_vector(vector: &DVector<f64>) -> Self {
        Self {
            rows: vector.len(),
            cols: 1,
            data: vector.as_slice().to_vec(),
        }
    }

    /// Rebuilds the matrix, or `None` when the payload disagrees with the
    /// recorded shape.
    pub fn to_matrix(&self) -> Option<DMatrix<f64>> {
        (self.rows.checked_mul(self.cols)? == self.data.len())
            .then(|| DMatrix::from_row_slice(self.rows, self.cols, &self.data))
    }

    /// Rebuilds a vector from either a single row or a single column.
    pub fn to_vector(&self) -> Option<DVector<f64>> {
        let consistent = self.rows.checked_mul(self.cols)? == self.data.len();
        (consistent && (self.rows == 1 || self.cols == 1 || self.data.is_empty()))
            .then(|| DVector::from_column_slice(&self.data))
    }
}

/// Statistics for one arm as recorded in an archive.
#[derive(Clone, Debug, PartialEq)]
pub enum ArmEntry {
    Absent,
    /// Present but unusable; the reason is meant for logs.
    Corrupt(String),
    Present(ArmStatistics),
}

/// Union of every array and scalar a partition has persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotArchive {
    pub version: u32,
    pub arrays: BTreeMap<String, StoredArray>,
    pub scalars: BTreeMap<String, f64>,
    pub labels: BTreeMap<String, String>,
}

impl Default for SnapshotArchive {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            arrays: BTreeMap::new(),
            scalars: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }
}

impl SnapshotArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and decodes an archive.
    pub fn read(path: &Path) -> RecResult<Self> {
        let file = File::open(path).map_err(|source| RecError::StorageUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
        let mut bytes = Vec::new();
        GzDecoder::new(BufReader::new(file))
            .read_to_end(&mut bytes)
            .map_err(|err| RecError::Snapshot {
                path: path.to_path_buf(),
                reason: format!("failed to decompress: {err}"),
            })?;
        // Length prefixes are bounded by the decompressed payload.
        let archive: SnapshotArchive = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .allow_trailing_bytes()
            .with_limit(bytes.len() as u64)
            .deserialize(&bytes)
            .map_err(|err| RecError::Snapshot {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        if archive.version > SNAPSHOT_VERSION {
            return Err(RecError::Snapshot {
                path: path.to_path_buf(),
                reason: format!(
                    "archive version {} is newer than supported version {SNAPSHOT_VERSION}",
                    archive.version
                ),
            });
        }
        Ok(archive)
    }

    /// Reads an archive, degrading to an empty one when the file is absent or
    /// unreadable.
    pub fn read_or_empty(path: &Path) -> Self {
        match Self::read(path) {
            Ok(archive) => archive,
            Err(RecError::StorageUnavailable { source, .. })
                if source.kind() == io::ErrorKind::NotFound =>
            {
                debug!(path = %path.display(), "no snapshot yet, starting empty");
                Self::new()
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "discarding unreadable snapshot");
                Self::new()
            }
        }
    }

    /// Writes the archive through a temporary file in the destination
    /// directory, then renames it over `path`.
    pub fn write_atomic(&self, path: &Path) -> RecResult<()> {
        let storage = |source: io::Error| RecError::StorageUnavailable {
            path: path.to_path_buf(),
            source,
        };
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(storage)?;

        let staged = tempfile::NamedTempFile::new_in(parent).map_err(storage)?;
        {
            let mut encoder =
                GzEncoder::new(BufWriter::new(staged.as_file()), Compression::default());
            bincode::serialize_into(&mut encoder, self).map_err(|err| RecError::Snapshot {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
            let mut writer = encoder.finish().map_err(storage)?;
            writer.flush().map_err(storage)?;
        }
        staged.as_file().sync_all().map_err(storage)?;
        staged.persist(path).map_err(|err| storage(err.error))?;
        Ok(())
    }

    /// Ids of every arm with a design matrix in the archive.
    pub fn arm_ids(&self) -> Vec<String> {
        self.arrays
            .keys()
            .filter_map(|key| key.strip_prefix(DESIGN_PREFIX))
            .map(str::to_string)
            .collect()
    }

    pub fn arm_count(&self) -> usize {
        self.arrays
            .keys()
            .filter(|key| key.starts_with(DESIGN_PREFIX))
            .count()
    }

    /// Looks up and validates one arm's statistics.
    pub fn arm(&self, id: &str) -> ArmEntry {
        let design = self.arrays.get(&format!("{DESIGN_PREFIX}{id}"));
        let response = self.arrays.get(&format!("{RESPONSE_PREFIX}{id}"));
        let (design, response) = match (design, response) {
            (None, None) => return ArmEntry::Absent,
            (Some(design), Some(response)) => (design, response),
            _ => return ArmEntry::Corrupt("only one of A/b is present".to_string()),
        };
        let Some(design) = design.to_matrix() else {
            return ArmEntry::Corrupt("design payload does not match its shape".to_string());
        };
        let Some(response) = response.to_vector() else {
            return ArmEntry::Corrupt("response payload is not a vector".to_string());
        };
        let pulls = self
            .scalars
            .get(&format!("{PULLS_PREFIX}{id}"))
            .map(|value| value.max(0.0) as u64)
            .unwrap_or(0);
        let reward = self
            .scalars
            .get(&format!("{REWARD_PREFIX}{id}"))
            .copied()
            .unwrap_or(0.0);
        match ArmStatistics::from_parts(design, response, pulls, reward) {
            Ok(stats) => ArmEntry::Present(stats),
            Err(defect) => ArmEntry::Corrupt(defect.to_string()),
        }
    }

    /// Inserts or overwrites one arm.
    pub fn insert_arm(&mut self, id: &str, stats: &ArmStatistics) {
        self.arrays.insert(
            format!("{DESIGN_PREFIX}{id}"),
            StoredArray::from_matrix(stats.design()),
        );
        self.arrays.insert(
            format!("{RESPONSE_PREFIX}{id}"),
            StoredArray::from_vector(stats.response()),
        );
        self.scalars
            .insert(format!("{PULLS_PREFIX}{id}"), stats.pulls() as f64);
        self.scalars
            .insert(format!("{REWARD_PREFIX}{id}"), stats.cumulative_reward());
    }

    /// Drops one arm; returns whether anything was removed.
    pub fn remove_arm(&mut self, id: &str) -> bool {
        let design = self.arrays.remove(&format!("{DESIGN_PREFIX}{id}")).is_some();
        let response = self.arrays.remove(&format!("{RESPONSE_PREFIX}{id}")).is_some();
        self.scalars.remove(&format!("{PULLS_PREFIX}{id}"));
        self.scalars.remove(&format!("{REWARD_PREFIX}{id}"));
        design || response
    }

    /// Arrays whose key starts with `prefix`, with the prefix stripped.
    pub fn arrays_with_prefix(&self, prefix: &str) -> BTreeMap<String, &StoredArray> {
        self.arrays
            .iter()
            .filter_map(|(key, value)| key.strip_prefix(prefix).map(|name| (name.to_string(), value)))
            .collect()
    }

    /// Replaces every array under `prefix` with `entries`.
    pub fn replace_prefixed<I>(&mut self, prefix: &str, entries: I)
    where
        I: IntoIterator<Item = (String, StoredArray)>,
    {
        self.arrays.retain(|key, _| !key.starts_with(prefix));
        for (name, value) in entries {
            self.arrays.insert(format!("{prefix}{name}"), value);
        }
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.scalars.get(name).copied()
    }

    pub fn set_scalar(&mut self, name: impl Into<String>, value: f64) {
        self.scalars.insert(name.into(), value);
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    pub fn set_label(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(name.into(), value.into());
    }
}
