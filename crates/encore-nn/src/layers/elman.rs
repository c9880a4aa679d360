// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::uniform_tensor;
use crate::module::{Module, Parameter};
use crate::{broadcast_row, concat_columns, mean_rows, NnError, PureResult, Tensor};
use rand::Rng;

/// Single-step Elman cell `h' = tanh(x W_ih + b_ih + h W_hh + b_hh)`.
///
/// As a [`Module`] the cell consumes the concatenation `[x | h]` so the
/// previous hidden state travels alongside the input. The cell keeps no
/// hidden state of its own; callers thread it explicitly.
#[derive(Debug, Clone)]
pub struct ElmanCell {
    input_dim: usize,
    hidden_dim: usize,
    weight_ih: Parameter,
    weight_hh: Parameter,
    bias_ih: Parameter,
    bias_hh: Parameter,
}

impl ElmanCell {
    /// Creates a new cell initialised uniformly in `±1/sqrt(hidden_dim)`.
    pub fn new<R: Rng + ?Sized>(
        name: impl Into<String>,
        input_dim: usize,
        hidden_dim: usize,
        rng: &mut R,
    ) -> PureResult<Self> {
        if input_dim == 0 || hidden_dim == 0 {
            return Err(NnError::InvalidDimensions {
                rows: input_dim,
                cols: hidden_dim,
            });
        }
        let name = name.into();
        let bound = 1.0 / (hidden_dim as f64).sqrt();
        Ok(Self {
            input_dim,
            hidden_dim,
            weight_ih: Parameter::new(
                format!("{name}::weight_ih"),
                uniform_tensor(input_dim, hidden_dim, bound, rng),
            ),
            weight_hh: Parameter::new(
                format!("{name}::weight_hh"),
                uniform_tensor(hidden_dim, hidden_dim, bound, rng),
            ),
            bias_ih: Parameter::new(
                format!("{name}::bias_ih"),
                uniform_tensor(1, hidden_dim, bound, rng),
            ),
            bias_hh: Parameter::new(
                format!("{name}::bias_hh"),
                uniform_tensor(1, hidden_dim, bound, rng),
            ),
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Advances one step from `hidden` given `input`.
    pub fn step(&self, input: &Tensor, hidden: &Tensor) -> PureResult<Tensor> {
        self.forward(&concat_columns(input, hidden)?)
    }

    fn guard_input(&self, joined: &Tensor) -> PureResult<()> {
        if joined.ncols() != self.input_dim + self.hidden_dim {
            return Err(NnError::ShapeMismatch {
                left: joined.shape(),
                right: (joined.nrows(), self.input_dim + self.hidden_dim),
            });
        }
        Ok(())
    }

    fn split(&self, joined: &Tensor) -> (Tensor, Tensor) {
        let input = joined.columns(0, self.input_dim).clone_owned();
        let hidden = joined
            .columns(self.input_dim, self.hidden_dim)
            .clone_owned();
        (input, hidden)
    }
}

impl Module for ElmanCell {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let (x, h) = self.split(input);
        let rows = input.nrows();
        let pre = &x * self.weight_ih.value()
            + &h * self.weight_hh.value()
            + broadcast_row(self.bias_ih.value(), rows)
            + broadcast_row(self.bias_hh.value(), rows);
        Ok(pre.map(f64::tanh))
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        if grad_output.shape() != (input.nrows(), self.hidden_dim) {
            return Err(NnError::ShapeMismatch {
                left: grad_output.shape(),
                right: (input.nrows(), self.hidden_dim),
            });
        }
        let next = self.forward(input)?;
        let (x, h) = self.split(input);
        let batch = input.nrows() as f64;

        // tanh'(z) = 1 - tanh(z)^2
        let grad_pre = grad_output.component_mul(&next.map(|v| 1.0 - v * v));

        self.weight_ih
            .accumulate_euclidean(&(x.transpose() * &grad_pre / batch))?;
        self.weight_hh
            .accumulate_euclidean(&(h.transpose() * &grad_pre / batch))?;
        let grad_b = mean_rows(&grad_pre);
        self.bias_ih.accumulate_euclidean(&grad_b)?;
        self.bias_hh.accumulate_euclidean(&grad_b)?;

        let grad_x = &grad_pre * self.weight_ih.value().transpose();
        let grad_h = &grad_pre * self.weight_hh.value().transpose();
        concat_columns(&grad_x, &grad_h)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight_ih)?;
        visitor(&self.weight_hh)?;
        visitor(&self.bias_ih)?;
        visitor(&self.bias_hh)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight_ih)?;
        visitor(&mut self.weight_hh)?;
        visitor(&mut self.bias_ih)?;
        visitor(&mut self.bias_hh)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::gradcheck::numeric_input_grad;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn zero_state_step_is_bounded() {
        let mut rng = StdRng::seed_from_u64(9);
        let cell = ElmanCell::new("rnn", 3, 4, &mut rng).unwrap();
        let x = Tensor::from_row_slice(1, 3, &[10.0, -10.0, 3.0]);
        let h = cell.step(&x, &Tensor::zeros(1, 4)).unwrap();
        assert_eq!(h.shape(), (1, 4));
        assert!(h.iter().all(|v| v.is_finite() && v.abs() <= 1.0));
    }

    #[test]
    fn forward_is_pure() {
        let mut rng = StdRng::seed_from_u64(2);
        let cell = ElmanCell::new("rnn", 2, 3, &mut rng).unwrap();
        let joined = Tensor::from_row_slice(1, 5, &[0.3, -0.1, 0.2, 0.0, -0.4]);
        let first = cell.forward(&joined).unwrap();
        let second = cell.forward(&joined).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut cell = ElmanCell::new("rnn", 2, 3, &mut rng).unwrap();
        let joined = Tensor::from_row_slice(1, 5, &[0.5, -0.7, 0.1, 0.2, -0.3]);
        let weights = Tensor::from_row_slice(1, 3, &[1.0, 0.5, -1.5]);
        let grad = cell.backward(&joined, &weights).unwrap();
        assert_eq!(grad.shape(), (1, 5));
        for c in 0..5 {
            let numeric = numeric_input_grad(&cell, &joined, &weights, 0, c);
            assert_relative_eq!(grad[(0, c)], numeric, epsilon = 1e-6);
        }
        let mut count = 0;
        cell.visit_parameters(&mut |param| {
            assert!(param.gradient().is_some(), "{} has no gradient", param.name());
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn rejects_wrong_joined_width() {
        let mut rng = StdRng::seed_from_u64(2);
        let cell = ElmanCell::new("rnn", 2, 3, &mut rng).unwrap();
        assert!(matches!(
            cell.forward(&Tensor::zeros(1, 4)),
            Err(NnError::ShapeMismatch { .. })
        ));
    }
}
