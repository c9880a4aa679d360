// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::uniform_tensor;
use crate::module::{Module, Parameter};
use crate::{broadcast_row, mean_rows, NnError, PureResult, Tensor};
use rand::Rng;

/// Fully-connected layer `y = x W + b`.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
}

impl Linear {
    /// Creates a new linear layer initialised uniformly in `±1/sqrt(input_dim)`.
    pub fn new<R: Rng + ?Sized>(
        name: impl Into<String>,
        input_dim: usize,
        output_dim: usize,
        rng: &mut R,
    ) -> PureResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(NnError::InvalidDimensions {
                rows: input_dim,
                cols: output_dim,
            });
        }
        let name = name.into();
        let bound = 1.0 / (input_dim as f64).sqrt();
        let weight = uniform_tensor(input_dim, output_dim, bound, rng);
        let bias = uniform_tensor(1, output_dim, bound, rng);
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
        })
    }

    /// Returns a reference to the weight parameter.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Returns a reference to the bias parameter.
    pub fn bias(&self) -> &Parameter {
        &self.bias
    }

    pub fn input_dim(&self) -> usize {
        self.weight.value().nrows()
    }

    pub fn output_dim(&self) -> usize {
        self.weight.value().ncols()
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.ncols() != self.input_dim() {
            return Err(NnError::ShapeMismatch {
                left: input.shape(),
                right: self.weight.value().shape(),
            });
        }
        let out = input * self.weight.value();
        Ok(out + broadcast_row(self.bias.value(), input.nrows()))
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.nrows() != grad_output.nrows() || grad_output.ncols() != self.output_dim() {
            return Err(NnError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let batch = input.nrows() as f64;
        let grad_w = input.transpose() * grad_output / batch;
        self.weight.accumulate_euclidean(&grad_w)?;
        self.bias.accumulate_euclidean(&mean_rows(grad_output))?;
        Ok(grad_output * self.weight.value().transpose())
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::gradcheck::{numeric_input_grad, weighted_sum};
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn linear_forward_matches_manual() {
        let mut rng = StdRng::seed_from_u64(11);
        let layer = Linear::new("fc", 3, 2, &mut rng).unwrap();
        let input = Tensor::from_row_slice(1, 3, &[1.0, -2.0, 0.5]);
        let output = layer.forward(&input).unwrap();
        for col in 0..2 {
            let mut expected = layer.bias().value()[(0, col)];
            for row in 0..3 {
                expected += input[(0, row)] * layer.weight().value()[(row, col)];
            }
            assert_relative_eq!(output[(0, col)], expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn rejects_wrong_feature_width() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = Linear::new("fc", 3, 2, &mut rng).unwrap();
        assert!(layer.forward(&Tensor::zeros(1, 4)).is_err());
        assert!(Linear::new("fc", 0, 2, &mut rng).is_err());
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer = Linear::new("fc", 4, 3, &mut rng).unwrap();
        let input = Tensor::from_row_slice(1, 4, &[0.1, 0.2, -0.3, 0.4]);
        let weights = Tensor::from_row_slice(1, 3, &[1.0, -0.5, 2.0]);
        let grad_input = layer.backward(&input, &weights).unwrap();
        for c in 0..4 {
            let numeric = numeric_input_grad(&layer, &input, &weights, 0, c);
            assert_relative_eq!(grad_input[(0, c)], numeric, epsilon = 1e-6);
        }

        // dL/dW[i][j] = x_i * w_j for the weighted-sum loss.
        let grad_w = layer.weight().gradient().unwrap();
        assert_relative_eq!(grad_w[(2, 2)], -0.3 * 2.0, epsilon = 1e-12);

        let before = weighted_sum(&layer, &input, &weights);
        layer.apply_step(0.01).unwrap();
        let after = weighted_sum(&layer, &input, &weights);
        assert!(after < before);
    }
}
