// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! `encore-pretrain`: warms up a learner snapshot against simulated
//! listeners.
//!
//! ```bash
//! encore-pretrain --episodes 50 --lambda-reward 1.0 --lambda-pref 0.5 --dual-loss
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use encore_config::{tracing::flush_chrome_trace, tracing::init_tracing, ConfigLayering, LayeredConfig};
use encore_rec::{Learner, LearnerConfig, Policy};
use encore_sim::{
    CatalogConfig, CatalogSimulator, PretrainConfig, Pretrainer, RewardMode, UserSimulator,
    UserSimulatorConfig,
};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

/// Learner flags left unset fall back to the `[learner]` section of the
/// layered configuration.
#[derive(Parser, Debug)]
#[command(
    name = "encore-pretrain",
    version,
    about = "Pretrain the Encore LinUCB + residual recommender on simulated listeners"
)]
struct Args {
    /// Feature dimension of songs and the residual model.
    #[arg(long)]
    dim: Option<usize>,

    /// Songs in the simulated catalog.
    #[arg(long, default_value_t = 500)]
    n_songs: usize,

    /// Latent genre clusters used to generate features.
    #[arg(long, default_value_t = 32)]
    n_genres: usize,

    /// Simulated listening sessions.
    #[arg(long, default_value_t = 500)]
    episodes: usize,

    /// Interactions per session.
    #[arg(long, default_value_t = 100)]
    steps_per_episode: usize,

    /// Hidden width of the residual recurrent cell.
    #[arg(long)]
    hidden_size: Option<usize>,

    /// LinUCB exploration weight.
    #[arg(long)]
    alpha: Option<f64>,

    /// Ridge weight of the initial design matrices.
    #[arg(long)]
    l2: Option<f64>,

    /// Score multiplier for re-recommending the previous song.
    #[arg(long)]
    discount: Option<f64>,

    /// Snapshot written (and read with --resume).
    #[arg(long, value_name = "FILE", default_value = "pretrained/learner.snap")]
    storage: PathBuf,

    #[arg(long, default_value_t = 50)]
    seed: u64,

    /// With a single listener, redraw their long-term preference every N
    /// episodes (0 disables). Ignored for multi-listener pools.
    #[arg(long, default_value_t = 100)]
    resample_global: usize,

    /// Listeners in the pool; each episode picks one at random.
    #[arg(long, default_value_t = 1)]
    num_users: usize,

    /// Restore arm statistics and residual parameters from --storage first.
    #[arg(long)]
    resume: bool,

    /// Weight of the reward term of the blended objective.
    #[arg(long, default_value_t = 1.0)]
    lambda_reward: f64,

    /// Weight of the preference term of the blended objective.
    #[arg(long, default_value_t = 1.0)]
    lambda_pref: f64,

    /// Fit the residual model to reward and simulated preference jointly.
    #[arg(long)]
    dual_loss: bool,
}

fn learner_config(args: &Args) -> Result<LearnerConfig> {
    let layers = LayeredConfig::load(ConfigLayering::discover())
        .context("failed to load layered configuration")?;
    for event in layers.events() {
        debug!(change = %event, "layered config");
    }
    let mut config = LearnerConfig::from_layers(&layers)?;
    if let Some(dim) = args.dim {
        config.dimension = dim;
    }
    if let Some(hidden) = args.hidden_size {
        config.hidden_size = hidden;
    }
    if let Some(alpha) = args.alpha {
        config.alpha = alpha;
    }
    if let Some(l2) = args.l2 {
        config.l2 = l2;
    }
    if let Some(discount) = args.discount {
        config.discount = discount;
    }
    config.policy = Policy::LinUcbResidual;
    config.seed = Some(args.seed);
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing().context("failed to initialise tracing")?;

    let config = learner_config(&args)?;
    let dimension = config.dimension;
    info!(
        dimension,
        hidden_size = config.hidden_size,
        alpha = config.alpha,
        l2 = config.l2,
        discount = config.discount,
        "learner configured"
    );

    let catalog = CatalogSimulator::new(
        CatalogConfig::new(dimension)
            .with_songs(args.n_songs)
            .with_genres(args.n_genres)
            .with_seed(args.seed),
    )?;
    let users = (0..args.num_users.max(1))
        .map(|i| {
            UserSimulator::new(
                UserSimulatorConfig::new(dimension)
                    .with_reward_mode(RewardMode::Dot)
                    .with_seed(args.seed + i as u64),
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut pretrainer = Pretrainer::new(
        PretrainConfig {
            episodes: args.episodes,
            steps_per_episode: args.steps_per_episode,
            dual_loss: args.dual_loss,
            lambda_reward: args.lambda_reward,
            lambda_pref: args.lambda_pref,
            resample_global: args.resample_global,
            seed: Some(args.seed),
        },
        &catalog,
        users,
    )?;

    let mut learner = Learner::new(config)?;
    learner.register_all(pretrainer.candidates())?;
    if args.resume {
        let report = learner
            .load(&args.storage)
            .with_context(|| format!("failed to resume from {}", args.storage.display()))?;
        info!(
            restored = report.restored,
            cold_start = report.cold_start,
            "resumed learner"
        );
    }

    let started = Instant::now();
    let episodes = args.episodes;
    pretrainer.run(&mut learner, |stats| {
        info!(
            episode = stats.episode,
            episodes,
            avg_combined = stats.mean_loss(),
            avg_reward_loss = stats.mean_reward_loss(),
            avg_pref_loss = stats.mean_preference_loss(),
            avg_proxy_error = stats.mean_proxy_error(),
            avg_reward = stats.mean_reward(),
            elapsed_s = started.elapsed().as_secs_f64(),
            "episode complete"
        );
    })?;

    let saved = learner
        .save(&args.storage)
        .with_context(|| format!("failed to save {}", args.storage.display()))?;
    info!(
        path = %saved.path.display(),
        arms = saved.total,
        "pretrained learner saved"
    );
    flush_chrome_trace();
    Ok(())
}
