// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::error::{SimError, SimResult};
use crate::user::normalise;
use encore_config::determinism;
use encore_rec::Candidate;
use nalgebra::{DMatrix, DVector};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sampling weights over the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Popularity {
    Uniform,
    /// `p(rank) ∝ rank^-exponent`
    Zipf { exponent: f64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub dimension: usize,
    pub songs: usize,
    pub genres: usize,
    pub feature_noise_std: f64,
    pub normalize_features: bool,
    pub popularity: Popularity,
    pub artists: usize,
    pub seed: Option<u64>,
}

impl CatalogConfig {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            songs: 500,
            genres: 8,
            feature_noise_std: 0.3,
            normalize_features: true,
            popularity: Popularity::Zipf { exponent: 1.1 },
            artists: 50,
            seed: None,
        }
    }

    pub fn with_songs(mut self, songs: usize) -> Self {
        self.songs = songs;
        self
    }

    pub fn with_genres(mut self, genres: usize) -> Self {
        self.genres = genres;
        self
    }

    pub fn with_popularity(mut self, popularity: Popularity) -> Self {
        self.popularity = popularity;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// One synthetic track.
#[derive(Clone, Debug, PartialEq)]
pub struct Song {
    pub id: String,
    pub name: String,
    pub artist: String,
    pub genre: usize,
    pub features: DVector<f64>,
}

impl Song {
    pub fn candidate(&self) -> Candidate {
        Candidate::new(self.id.clone(), self.features.clone())
    }
}

/// A listener's library with latent genre structure: songs scatter around
/// random unit genre centres.
#[derive(Debug)]
pub struct CatalogSimulator {
    config: CatalogConfig,
    rng: StdRng,
    centres: Vec<DVector<f64>>,
    songs: Vec<Song>,
    by_id: HashMap<String, usize>,
    popularity: Vec<f64>,
    sampler: WeightedIndex<f64>,
}

impl CatalogSimulator {
    pub fn new(config: CatalogConfig) -> SimResult<Self> {
        if config.dimension == 0 {
            return Err(SimError::invalid("dimension", "must be at least 1"));
        }
        if config.songs == 0 {
            return Err(SimError::invalid("songs", "catalog must hold at least one song"));
        }
        if config.genres == 0 {
            return Err(SimError::invalid("genres", "must be at least 1"));
        }
        if config.artists == 0 {
            return Err(SimError::invalid("artists", "must be at least 1"));
        }
        if !config.feature_noise_std.is_finite() || config.feature_noise_std < 0.0 {
            return Err(SimError::invalid(
                "feature_noise_std",
                format!("must be non-negative, got {}", config.feature_noise_std),
            ));
        }

        let mut rng = determinism::rng_from_optional(config.seed, "encore-sim::catalog");
        let centres: Vec<DVector<f64>> = (0..config.genres)
            .map(|_| normalise(standard_normal(&mut rng, config.dimension)))
            .collect();

        let mut songs = Vec::with_capacity(config.songs);
        let mut by_id = HashMap::with_capacity(config.songs);
        for index in 0..config.songs {
            let genre = rng.gen_range(0..config.genres);
            let noise = standard_normal(&mut rng, config.dimension) * config.feature_noise_std;
            let mut features = &centres[genre] + noise;
            if config.normalize_features {
                let norm = features.norm();
                if norm > 1e-8 {
                    features /= norm;
                }
            }
            let artist = rng.gen_range(0..config.artists);
            let id = index.to_string();
            by_id.insert(id.clone(), index);
            songs.push(Song {
                id,
                name: format!("Song_{index}"),
                artist: format!("Artist_{artist}"),
                genre,
                features,
            });
        }

        let popularity = popularity_weights(config.popularity, config.songs)?;
        let sampler = WeightedIndex::new(&popularity)?;
        Ok(Self {
            config,
            rng,
            centres,
            songs,
            by_id,
            popularity,
            sampler,
        })
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn songs(&self) -> &[Song] {
        &self.songs
    }

    pub fn genre_centres(&self) -> &[DVector<f64>] {
        &self.centres
    }

    /// Sampling probability of each song, in catalog order.
    pub fn popularity(&self) -> &[f64] {
        &self.popularity
    }

    pub fn song(&self, id: &str) -> Option<&Song> {
        self.by_id.get(id).map(|&index| &self.songs[index])
    }

    /// Every song as a selection candidate.
    pub fn candidates(&self) -> Vec<Candidate> {
        self.songs.iter().map(Song::candidate).collect()
    }

    /// Songs stacked row-wise, `songs × dimension`.
    pub fn feature_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.songs.len(), self.config.dimension, |row, col| {
            self.songs[row].features[col]
        })
    }

    pub fn sample_song(&mut self, use_popularity: bool) -> &Song {
        let index = if use_popularity {
            self.sampler.sample(&mut self.rng)
        } else {
            self.rng.gen_range(0..self.songs.len())
        };
        &self.songs[index]
    }

    /// Draws `length` songs, optionally without repeats.
    pub fn sample_playlist(
        &mut self,
        length: usize,
        use_popularity: bool,
        replace: bool,
    ) -> SimResult<Vec<&Song>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let indices: Vec<usize> = if replace {
            (0..length)
                .map(|_| {
                    if use_popularity {
                        self.sampler.sample(&mut self.rng)
                    } else {
                        self.rng.gen_range(0..self.songs.len())
                    }
                })
                .collect()
        } else {
            if length > self.songs.len() {
                return Err(SimError::PlaylistTooLong {
                    requested: length,
                    available: self.songs.len(),
                });
            }
            let all: Vec<usize> = (0..self.songs.len()).collect();
            if use_popularity {
                let weights = &self.popularity;
                all.choose_multiple_weighted(&mut self.rng, length, |&index| weights[index])?
                    .copied()
                    .collect()
            } else {
                all.choose_multiple(&mut self.rng, length).copied().collect()
            }
        };
        Ok(indices.into_iter().map(|index| &self.songs[index]).collect())
    }
}

fn standard_normal(rng: &mut StdRng, dimension: usize) -> DVector<f64> {
    DVector::from_fn(dimension, |_, _| rng.sample::<f64, _>(StandardNormal))
}

fn popularity_weights(popularity: Popularity, songs: usize) -> SimResult<Vec<f64>> {
    let weights: Vec<f64> = match popularity {
        Popularity::Uniform => vec![1.0; songs],
        Popularity::Zipf { exponent } => {
            if !exponent.is_finite() || exponent < 0.0 {
                return Err(SimError::invalid(
                    "popularity",
                    format!("zipf exponent must be non-negative, got {exponent}"),
                ));
            }
            (1..=songs).map(|rank| (rank as f64).powf(-exponent)).collect()
        }
    };
    let total: f64 = weights.iter().sum();
    Ok(weights.into_iter().map(|weight| weight / total).collect())
}
