use encore_config::LayeredConfig;
use encore_rec::{
    ArmEntry, ArmStatistics, Candidate, Learner, LearnerConfig, PartitionStore, Policy, RecError,
    SnapshotArchive, TrainOutcome,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use std::io::Write;
use std::path::Path;

fn config(dimension: usize) -> LearnerConfig {
    LearnerConfig::new(dimension)
        .with_alpha(0.0)
        .with_l2(1.0)
        .with_seed(11)
}

fn basis(id: &str, dimension: usize, axis: usize) -> Candidate {
    let mut features = vec![0.0; dimension];
    features[axis % dimension] = 1.0;
    Candidate::from_slice(id, &features)
}

fn seed_file(path: &Path, ids: &[&str]) {
    let mut learner = Learner::new(config(3)).unwrap();
    for (axis, id) in ids.iter().enumerate() {
        learner.feedback(&basis(id, 3, axis), 1.0).unwrap();
    }
    learner.save(path).unwrap();
}

/// Statistics after one reward on a cold arm.
fn pulled_once(candidate: &Candidate, reward: f64) -> ArmStatistics {
    let mut stats = ArmStatistics::cold(3, 1.0);
    stats.update(candidate.features.as_ref().unwrap(), reward);
    stats
}

#[test]
fn repeated_reward_wins_selection_despite_repeat_discount() {
    let mut learner = Learner::new(config(2)).unwrap();
    let a = Candidate::from_slice("A", &[1.0, 0.0]);
    let b = Candidate::from_slice("B", &[0.0, 1.0]);
    learner.register(&b).unwrap();
    for _ in 0..10 {
        learner.feedback(&a, 1.0).unwrap();
    }
    assert_eq!(learner.last_selected(), Some("A"));

    let ranked = learner.select(&[a, b], 1).unwrap();
    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked[0].id, "A");
    let score = ranked[0].score.expect("scored");
    assert!((score - 0.7 * 10.0 / 11.0).abs() < 1e-12, "score {score}");
}

#[test]
fn merge_on_save_keeps_arms_outside_the_working_set() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("learner.snap");
    seed_file(&path, &["s0", "s1", "s2", "s3", "s4"]);

    let mut learner = Learner::new(config(3)).unwrap();
    let fresh = [basis("s5", 3, 0), basis("s6", 3, 1)];
    learner.register_all(&fresh).unwrap();
    let report = learner.load(&path).unwrap();
    assert_eq!(report.restored, 0);
    assert_eq!(report.initialised, 2);
    for candidate in &fresh {
        learner.feedback(candidate, 0.5).unwrap();
    }
    let saved = learner.save(&path).unwrap();
    assert_eq!(saved.written, 2);
    assert_eq!(saved.total, 7);

    let archive = SnapshotArchive::read(&path).unwrap();
    let mut ids = archive.arm_ids();
    ids.sort();
    assert_eq!(ids, vec!["s0", "s1", "s2", "s3", "s4", "s5", "s6"]);

    // Arms outside the working set come back exactly as they were seeded.
    for (axis, id) in ["s0", "s1", "s2", "s3", "s4"].into_iter().enumerate() {
        assert_eq!(
            archive.arm(id),
            ArmEntry::Present(pulled_once(&basis(id, 3, axis), 1.0)),
            "arm {id}"
        );
    }
    for candidate in &fresh {
        assert_eq!(
            archive.arm(&candidate.id),
            ArmEntry::Present(pulled_once(candidate, 0.5))
        );
    }
}

#[test]
fn overlapping_working_sets_update_only_their_own_arms() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("learner.snap");
    seed_file(&path, &["s0", "s1", "s2"]);

    let mut learner = Learner::new(config(3)).unwrap();
    let s0 = basis("s0", 3, 0);
    learner.register_all(&[s0.clone(), basis("s1", 3, 1)]).unwrap();
    assert_eq!(learner.load(&path).unwrap().restored, 2);
    learner.feedback(&s0, 1.0).unwrap();
    learner.save(&path).unwrap();

    let mut check = Learner::new(config(3)).unwrap();
    check
        .register_all(&[s0, basis("s1", 3, 1), basis("s2", 3, 2)])
        .unwrap();
    check.load(&path).unwrap();
    let pulls = |id: &str| check.arms().by_id(id).unwrap().stats().pulls();
    assert_eq!(pulls("s0"), 2);
    assert_eq!(pulls("s1"), 1);
    assert_eq!(pulls("s2"), 1);
    // Loading never widens the working set beyond what was registered.
    assert_eq!(check.arms().len(), 3);
}

#[test]
fn snapshot_for_another_dimension_is_rejected_on_load_and_save() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("learner.snap");
    seed_file(&path, &["s0"]);

    let mut learner = Learner::new(config(4)).unwrap();
    learner.feedback(&basis("s0", 4, 0), 1.0).unwrap();
    let before = learner.arms().by_id("s0").unwrap().stats().clone();

    let err = learner.load(&path).unwrap_err();
    assert!(matches!(
        err,
        RecError::DimensionMismatch { expected: 4, actual: 3, .. }
    ));
    assert_eq!(learner.arms().by_id("s0").unwrap().stats(), &before);

    let err = learner.save(&path).unwrap_err();
    assert!(matches!(err, RecError::DimensionMismatch { .. }));
}

#[test]
fn truncated_snapshot_degrades_to_cold_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("learner.snap");
    seed_file(&path, &["s0", "s1"]);
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let mut learner = Learner::new(config(3)).unwrap();
    learner.register(&basis("s0", 3, 0)).unwrap();
    let report = learner.load(&path).unwrap();
    assert!(report.cold_start);
    assert_eq!(learner.arms().by_id("s0").unwrap().stats().pulls(), 0);

    // The next save rewrites a readable file.
    learner.feedback(&basis("s0", 3, 0), 1.0).unwrap();
    let saved = learner.save(&path).unwrap();
    assert_eq!(saved.total, 1);
    assert!(SnapshotArchive::read(&path).is_ok());
}

#[test]
fn oversized_length_prefix_degrades_to_cold_start() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("learner.snap");
    let a = basis("a", 3, 0);

    for key_len in [u64::MAX, 1 << 40] {
        // version, one array entry, then a key length far beyond the payload.
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&1u64.to_le_bytes());
        payload.extend_from_slice(&key_len.to_le_bytes());
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).unwrap();
        std::fs::write(&path, encoder.finish().unwrap()).unwrap();

        assert!(matches!(
            SnapshotArchive::read(&path),
            Err(RecError::Snapshot { .. })
        ));

        let mut learner = Learner::new(config(3)).unwrap();
        learner.register(&a).unwrap();
        let report = learner.load(&path).unwrap();
        assert!(report.cold_start);
        assert_eq!(report.initialised, 1);

        learner.feedback(&a, 1.0).unwrap();
        assert_eq!(learner.save(&path).unwrap().total, 1);
    }
}

#[test]
fn removed_arm_is_dropped_from_disk_and_comes_back_cold() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("learner.snap");
    seed_file(&path, &["s0", "s1", "s2"]);

    let mut learner = Learner::new(config(3)).unwrap();
    let s1 = basis("s1", 3, 1);
    learner.register(&s1).unwrap();
    learner.load(&path).unwrap();
    learner.remove_item(&s1).unwrap();
    let saved = learner.save(&path).unwrap();
    assert_eq!(saved.dropped, 1);
    assert_eq!(saved.total, 2);

    let archive = SnapshotArchive::read(&path).unwrap();
    assert!(!archive.arm_ids().contains(&"s1".to_string()));

    let mut again = Learner::new(config(3)).unwrap();
    let report = again.add_item(&s1).unwrap();
    assert!(report.training.is_none());
    let loaded = again.load(&path).unwrap();
    assert_eq!(loaded.initialised, 1);
}

#[test]
fn residual_trajectory_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = PartitionStore::new(dir.path());
    let cfg = config(2).with_policy(Policy::LinUcbResidual);
    let songs = [basis("a", 2, 0), basis("b", 2, 1)];

    let (outcome, _) = store
        .transact(Some("listener"), &cfg, &songs, |learner| {
            learner.feedback(&songs[0], 1.0).map(|report| report.training)
        })
        .unwrap();
    assert_eq!(outcome, Some(TrainOutcome::Seeded));

    // A fresh process continues the delayed bootstrap instead of reseeding.
    let (outcome, _) = store
        .transact(Some("listener"), &cfg, &songs, |learner| {
            assert!(learner.residual_state().is_seeded());
            learner.feedback(&songs[1], 0.0).map(|report| report.training)
        })
        .unwrap();
    assert!(matches!(outcome, Some(TrainOutcome::Trained(_))));

    let (learner, _) = store.open(Some("listener"), &cfg, &songs).unwrap();
    assert_eq!(learner.residual_state().updates(), 1);
}

#[test]
fn identical_seeds_train_identical_residual_models() {
    let cfg = config(3).with_policy(Policy::LinUcbResidual);
    let run = || {
        let mut learner = Learner::new(cfg.clone()).unwrap();
        for step in 0..12 {
            let song = basis(&format!("s{}", step % 4), 3, step);
            learner.feedback(&song, (step % 2) as f64).unwrap();
        }
        learner.residual_model().state_dict().unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn learner_config_comes_from_layered_sections() {
    let layers = LayeredConfig::from_value(json!({
        "learner": { "dimension": 2, "policy": "LinUCB+", "alpha": 0.25 }
    }));
    let cfg = LearnerConfig::from_layers(&layers).unwrap();
    assert_eq!(cfg.dimension, 2);
    assert_eq!(cfg.policy, Policy::LinUcbResidual);
    assert_eq!(cfg.discount, 0.7);

    let bad = LayeredConfig::from_value(json!({ "learner": { "discount": 1.5 } }));
    assert!(matches!(
        LearnerConfig::from_layers(&bad),
        Err(RecError::Configuration { field: "discount", .. })
    ));
}
