// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::config::LearnerConfig;
use crate::error::RecResult;
use crate::learner::{Learner, LoadReport, SaveReport};
use crate::selection::Candidate;
use std::path::{Path, PathBuf};
use tracing::debug;

const DEFAULT_FILE_NAME: &str = "learner.snap";

/// Maps storage partitions (one per listener, plus an anonymous default) onto
/// snapshot files below a root directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionStore {
    root: PathBuf,
    file_name: String,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            file_name: DEFAULT_FILE_NAME.to_string(),
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/users/<sanitised user>/<file>` or `<root>/<file>` without a
    /// user.
    pub fn path_for(&self, user: Option<&str>) -> PathBuf {
        match user {
            Some(user) => self
                .root
                .join("users")
                .join(sanitise(user))
                .join(&self.file_name),
            None => self.root.join(&self.file_name),
        }
    }

    /// Builds a learner for `user`, registers the working set and restores
    /// whatever the partition holds for it.
    pub fn open(
        &self,
        user: Option<&str>,
        config: &LearnerConfig,
        candidates: &[Candidate],
    ) -> RecResult<(Learner, LoadReport)> {
        let mut learner = Learner::new(config.clone())?;
        learner.register_all(candidates)?;
        let report = learner.load(self.path_for(user))?;
        Ok((learner, report))
    }

    /// Load, mutate in memory, then one atomic merge-on-save. Nothing is
    /// written when `mutate` fails.
    pub fn transact<T, F>(
        &self,
        user: Option<&str>,
        config: &LearnerConfig,
        candidates: &[Candidate],
        mutate: F,
    ) -> RecResult<(T, SaveReport)>
    where
        F: FnOnce(&mut Learner) -> RecResult<T>,
    {
        let path = self.path_for(user);
        let (mut learner, load) = self.open(user, config, candidates)?;
        debug!(
            path = %path.display(),
            restored = load.restored,
            cold_start = load.cold_start,
            "partition opened"
        );
        let value = mutate(&mut learner)?;
        let saved = learner.save(&path)?;
        Ok((value, saved))
    }
}

/// Keeps ASCII alphanumerics, `-` and `_`; everything else becomes `_`.
fn sanitise(user: &str) -> String {
    let cleaned: String = user
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecError;

    #[test]
    fn paths_are_scoped_per_user() {
        let store = PartitionStore::new("/srv/encore");
        assert_eq!(store.path_for(None), PathBuf::from("/srv/encore/learner.snap"));
        assert_eq!(
            store.path_for(Some("alice")),
            PathBuf::from("/srv/encore/users/alice/learner.snap")
        );
        assert_eq!(
            store.path_for(Some("../etc/passwd")),
            PathBuf::from("/srv/encore/users/___etc_passwd/learner.snap")
        );
        assert_eq!(
            store.path_for(Some("")),
            PathBuf::from("/srv/encore/users/_/learner.snap")
        );
        let custom = PartitionStore::new("/srv").with_file_name("state.bin");
        assert_eq!(custom.path_for(None), PathBuf::from("/srv/state.bin"));
    }

    #[test]
    fn transact_persists_and_partitions_stay_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::new(dir.path());
        let config = LearnerConfig::new(2).with_alpha(0.0).with_seed(3);
        let song = Candidate::from_slice("song", &[1.0, 0.0]);

        let (_, saved) = store
            .transact(Some("u1"), &config, &[song.clone()], |learner| {
                learner.feedback(&song, 1.0).map(|_| ())
            })
            .unwrap();
        assert_eq!(saved.total, 1);
        assert!(saved.path.ends_with("users/u1/learner.snap"));

        let (learner, report) = store.open(Some("u1"), &config, &[song.clone()]).unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(learner.arms().by_id("song").unwrap().stats().pulls(), 1);

        let (_, report) = store.open(Some("u2"), &config, &[song]).unwrap();
        assert!(report.cold_start);
    }

    #[test]
    fn failed_mutation_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = PartitionStore::new(dir.path());
        let config = LearnerConfig::new(2);
        let err = store
            .transact(None, &config, &[], |learner| {
                learner.feedback(&Candidate::without_features("x"), 1.0)
            })
            .unwrap_err();
        assert!(matches!(err, RecError::MissingFeatureContext { .. }));
        assert!(!store.path_for(None).exists());
    }
}
