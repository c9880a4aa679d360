// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::{NnError, PureResult, Tensor};
use std::collections::BTreeMap;

/// Trainable parameter with a Euclidean gradient accumulator.
#[derive(Clone)]
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.shape();
        write!(
            f,
            "Parameter(name={},shape=({},{}),has_grad={})",
            self.name,
            rows,
            cols,
            self.gradient.is_some()
        )
    }
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Returns the currently accumulated gradient, if any.
    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    fn assert_shape(&self, tensor: &Tensor) -> PureResult<()> {
        if self.value.shape() != tensor.shape() {
            return Err(NnError::ShapeMismatch {
                left: self.value.shape(),
                right: tensor.shape(),
            });
        }
        Ok(())
    }

    /// Adds `update` to the gradient buffer, allocating it on first use.
    pub fn accumulate_euclidean(&mut self, update: &Tensor) -> PureResult<()> {
        self.assert_shape(update)?;
        match self.gradient.as_mut() {
            Some(existing) => *existing += update,
            None => self.gradient = Some(update.clone()),
        }
        Ok(())
    }

    /// Clears the cached gradient.
    pub fn zero_gradient(&mut self) {
        if let Some(grad) = self.gradient.as_mut() {
            grad.fill(0.0);
        }
    }

    /// Removes and returns the accumulated gradient.
    pub fn take_gradient(&mut self) -> Option<Tensor> {
        self.gradient.take()
    }

    /// Plain gradient descent step with the supplied learning rate.
    pub fn apply_step(&mut self, learning_rate: f64) -> PureResult<()> {
        if let Some(grad) = self.gradient.as_mut() {
            self.value -= &*grad * learning_rate;
            grad.fill(0.0);
        }
        Ok(())
    }

    /// Replaces the parameter value with the provided tensor.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        self.assert_shape(value)?;
        self.value.copy_from(value);
        self.gradient = None;
        Ok(())
    }
}

/// Outcome of a lenient state restore.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateLoadReport {
    /// Parameters overwritten from the state dictionary.
    pub loaded: Vec<String>,
    /// Parameters left at their current value because the entry was absent or
    /// had an incompatible shape.
    pub kept: Vec<String>,
}

impl StateLoadReport {
    /// Returns `true` when every parameter was restored.
    pub fn is_complete(&self) -> bool {
        self.kept.is_empty()
    }
}

/// Module trait shared by every layer. Inputs are `batch x features`.
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Propagates a gradient backwards. Implementations populate the relevant
    /// parameter accumulators before returning the gradient with respect to
    /// `input`.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;

    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Applies a plain gradient descent update to every parameter.
    fn apply_step(&mut self, learning_rate: f64) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| param.apply_step(learning_rate))
    }

    /// Clears accumulators across every parameter.
    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<BTreeMap<String, Tensor>> {
        let mut state = BTreeMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by
    /// [`Module::state_dict`]. Every parameter must be present.
    fn load_state_dict(&mut self, state: &BTreeMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(NnError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }

    /// Restores whatever parameters match by name and shape, keeping the
    /// current value for the rest.
    fn load_state_dict_lenient(
        &mut self,
        state: &BTreeMap<String, Tensor>,
    ) -> PureResult<StateLoadReport> {
        let mut report = StateLoadReport::default();
        self.visit_parameters_mut(&mut |param| {
            match state.get(param.name()) {
                Some(value) if value.shape() == param.value().shape() => {
                    param.load_value(value)?;
                    report.loaded.push(param.name().to_string());
                }
                _ => report.kept.push(param.name().to_string()),
            }
            Ok(())
        })?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn accumulate_rejects_foreign_shapes() {
        let mut param = Parameter::new("w", Tensor::zeros(2, 3));
        let err = param.accumulate_euclidean(&Tensor::zeros(3, 2)).unwrap_err();
        assert_eq!(
            err,
            NnError::ShapeMismatch {
                left: (2, 3),
                right: (3, 2)
            }
        );
    }

    #[test]
    fn apply_step_descends_and_clears() {
        let mut param = Parameter::new("w", Tensor::from_element(1, 2, 1.0));
        param
            .accumulate_euclidean(&Tensor::from_row_slice(1, 2, &[0.5, -1.0]))
            .unwrap();
        param.apply_step(0.1).unwrap();
        assert!((param.value()[(0, 0)] - 0.95).abs() < 1e-12);
        assert!((param.value()[(0, 1)] - 1.1).abs() < 1e-12);
        assert_eq!(param.gradient().unwrap().sum(), 0.0);
    }

    #[test]
    fn lenient_restore_keeps_mismatched_entries() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut layer = Linear::new("head", 3, 2, &mut rng).unwrap();
        let original_bias = layer.bias().value().clone();

        let mut state = BTreeMap::new();
        state.insert("head::weight".to_string(), Tensor::from_element(3, 2, 0.5));
        state.insert("head::bias".to_string(), Tensor::zeros(1, 5));

        let report = layer.load_state_dict_lenient(&state).unwrap();
        assert_eq!(report.loaded, vec!["head::weight".to_string()]);
        assert_eq!(report.kept, vec!["head::bias".to_string()]);
        assert!(!report.is_complete());
        assert_eq!(layer.weight().value(), &Tensor::from_element(3, 2, 0.5));
        assert_eq!(layer.bias().value(), &original_bias);
    }

    #[test]
    fn strict_restore_reports_missing_parameters() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut layer = Linear::new("head", 2, 2, &mut rng).unwrap();
        let err = layer.load_state_dict(&BTreeMap::new()).unwrap_err();
        assert!(matches!(err, NnError::MissingParameter { .. }));
    }
}
