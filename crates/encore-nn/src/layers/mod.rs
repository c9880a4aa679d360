// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

mod elman;
mod linear;

pub use elman::ElmanCell;
pub use linear::Linear;

use crate::Tensor;
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

/// Samples a `rows x cols` tensor uniformly from `[-bound, bound]`.
pub(crate) fn uniform_tensor<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    bound: f64,
    rng: &mut R,
) -> Tensor {
    if bound <= 0.0 {
        return Tensor::zeros(rows, cols);
    }
    let dist = Uniform::new_inclusive(-bound, bound);
    Tensor::from_fn(rows, cols, |_, _| dist.sample(rng))
}
