use encore_rec::{Candidate, Learner, LearnerConfig, Policy};
use encore_sim::{
    CatalogConfig, CatalogSimulator, PretrainConfig, Pretrainer, RewardMode, UserSimulator,
    UserSimulatorConfig,
};

fn learner_config() -> LearnerConfig {
    let mut config = LearnerConfig::new(5)
        .with_policy(Policy::LinUcbResidual)
        .with_seed(8);
    config.hidden_size = 6;
    config
}

#[test]
fn pretrained_snapshot_warms_up_a_serving_learner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pretrained.snap");

    let catalog = CatalogSimulator::new(
        CatalogConfig::new(5)
            .with_songs(20)
            .with_genres(3)
            .with_seed(4),
    )
    .unwrap();
    let users = vec![UserSimulator::new(
        UserSimulatorConfig::new(5)
            .with_reward_mode(RewardMode::Dot)
            .with_seed(4),
    )
    .unwrap()];
    let mut pretrainer = Pretrainer::new(
        PretrainConfig {
            episodes: 4,
            steps_per_episode: 10,
            seed: Some(4),
            ..PretrainConfig::default()
        },
        &catalog,
        users,
    )
    .unwrap();

    let mut learner = Learner::new(learner_config()).unwrap();
    learner.register_all(pretrainer.candidates()).unwrap();
    pretrainer.run(&mut learner, |_| {}).unwrap();
    let saved = learner.save(&path).unwrap();
    assert_eq!(saved.total, 20);

    // A serving process only knows a slice of the catalog.
    let subset: Vec<Candidate> = catalog.songs()[..5].iter().map(|song| song.candidate()).collect();
    let mut serving = Learner::new(learner_config().with_seed(99)).unwrap();
    serving.register_all(&subset).unwrap();
    let report = serving.load(&path).unwrap();
    assert_eq!(report.restored, 5);
    assert!(report.residual_kept.is_empty());
    assert_eq!(
        serving.residual_model().state_dict().unwrap(),
        learner.residual_model().state_dict().unwrap()
    );
    for candidate in &subset {
        assert_eq!(
            serving.arms().by_id(&candidate.id).unwrap().stats(),
            learner.arms().by_id(&candidate.id).unwrap().stats()
        );
    }

    let ranked = serving.select(&subset, 3).unwrap();
    assert_eq!(ranked.len(), 3);
    assert!(ranked.iter().all(|entry| entry.score.is_some()));

    // Saving the slice keeps the rest of the pretrained catalog.
    serving.feedback(&subset[0], 1.0).unwrap();
    assert_eq!(serving.save(&path).unwrap().total, 20);
}
