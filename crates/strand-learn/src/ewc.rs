// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of Strand — Licensed under AGPL-3.0-or-later.

//! Elastic weight consolidation.
//!
//! After a distribution shift, the trainer estimates a diagonal Fisher
//! information from the squared gradients of a sample batch and anchors the
//! current parameters. Subsequent training pays a quadratic penalty for
//! moving important weights, which slows catastrophic forgetting without
//! freezing the model.

use std::collections::HashMap;
use strand_nn::Module;
use strand_tensor::{Tensor, TensorResult};

/// Quadratic parameter anchor with a task-count-weighted running Fisher mean.
#[derive(Debug)]
pub struct EwcRegularizer {
    lambda: f32,
    fisher: HashMap<String, Tensor>,
    anchors: HashMap<String, Tensor>,
    tasks_seen: u32,
}

impl EwcRegularizer {
    pub fn new(lambda: f32) -> Self {
        Self {
            lambda,
            fisher: HashMap::new(),
            anchors: HashMap::new(),
            tasks_seen: 0,
        }
    }

    pub fn lambda(&self) -> f32 {
        self.lambda
    }

    /// Number of consolidations performed so far.
    pub fn tasks_seen(&self) -> u32 {
        self.tasks_seen
    }

    /// `(λ/2) Σ f_i (p_i - a_i)²`, or exactly 0 before the first
    /// consolidation.
    pub fn penalty<M: Module + ?Sized>(&self, module: &M) -> TensorResult<f32> {
        if self.tasks_seen == 0 {
            return Ok(0.0);
        }
        let mut total = 0.0f32;
        module.visit_parameters(&mut |param| {
            let (Some(fisher), Some(anchor)) = (
                self.fisher.get(param.name()),
                self.anchors.get(param.name()),
            ) else {
                return Ok(());
            };
            for ((value, f), a) in param
                .value()
                .data()
                .iter()
                .zip(fisher.data().iter())
                .zip(anchor.data().iter())
            {
                let drift = value - a;
                total += f * drift * drift;
            }
            Ok(())
        })?;
        Ok(0.5 * self.lambda * total)
    }

    /// Accumulates `λ f_i (p_i - a_i)` into every parameter's gradient
    /// buffer. No-op before the first consolidation.
    pub fn penalty_gradient<M: Module + ?Sized>(&self, module: &mut M) -> TensorResult<()> {
        if self.tasks_seen == 0 {
            return Ok(());
        }
        let lambda = self.lambda;
        module.visit_parameters_mut(&mut |param| {
            let (Some(fisher), Some(anchor)) = (
                self.fisher.get(param.name()),
                self.anchors.get(param.name()),
            ) else {
                return Ok(());
            };
            let (rows, cols) = param.value().shape();
            let mut grad = Tensor::zeros(rows, cols)?;
            for (((g, value), f), a) in grad
                .data_mut()
                .iter_mut()
                .zip(param.value().data().iter())
                .zip(fisher.data().iter())
                .zip(anchor.data().iter())
            {
                *g = lambda * f * (value - a);
            }
            param.accumulate(&grad)
        })
    }

    /// Folds a fresh Fisher estimate (mean squared gradients per parameter,
    /// keyed by name) into the running task-weighted mean, then snapshots
    /// current parameter values as the new anchor.
    pub fn consolidate<M: Module + ?Sized>(
        &mut self,
        module: &M,
        squared_gradients: &HashMap<String, Tensor>,
    ) -> TensorResult<()> {
        let previous_tasks = self.tasks_seen as f32;
        module.visit_parameters(&mut |param| {
            let name = param.name().to_string();
            if let Some(fresh) = squared_gradients.get(&name) {
                let combined = match self.fisher.get(&name) {
                    Some(existing) => {
                        let mut merged = existing.scale(previous_tasks);
                        merged.add_scaled(fresh, 1.0)?;
                        merged.scale(1.0 / (previous_tasks + 1.0))
                    }
                    None => fresh.clone(),
                };
                self.fisher.insert(name.clone(), combined);
            }
            self.anchors.insert(name, param.value().clone());
            Ok(())
        })?;
        self.tasks_seen += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_nn::{GateConfig, RefinerStack};

    fn stack() -> RefinerStack {
        RefinerStack::new("ewc", 4, 3, 1, GateConfig::default(), Some(33)).unwrap()
    }

    fn uniform_fisher(stack: &RefinerStack, value: f32) -> HashMap<String, Tensor> {
        let mut fisher = HashMap::new();
        stack
            .visit_parameters(&mut |param| {
                let (rows, cols) = param.value().shape();
                fisher.insert(
                    param.name().to_string(),
                    Tensor::from_fn(rows, cols, |_, _| value).unwrap(),
                );
                Ok(())
            })
            .unwrap();
        fisher
    }

    #[test]
    fn penalty_is_zero_before_first_consolidation() {
        let stack = stack();
        let ewc = EwcRegularizer::new(10.0);
        assert_eq!(ewc.penalty(&stack).unwrap(), 0.0);
    }

    #[test]
    fn penalty_grows_with_parameter_drift() {
        let mut stack = stack();
        let mut ewc = EwcRegularizer::new(2.0);
        let fisher = uniform_fisher(&stack, 1.0);
        ewc.consolidate(&stack, &fisher).unwrap();
        assert_eq!(ewc.penalty(&stack).unwrap(), 0.0);

        stack
            .visit_parameters_mut(&mut |param| {
                for value in param.value_mut().data_mut() {
                    *value += 0.1;
                }
                Ok(())
            })
            .unwrap();
        let penalty = ewc.penalty(&stack).unwrap();
        assert!(penalty > 0.0);

        // λ/2 * Σ 1.0 * 0.1² over every element.
        let mut elements = 0usize;
        stack
            .visit_parameters(&mut |param| {
                elements += param.value().len();
                Ok(())
            })
            .unwrap();
        let expected = 0.5 * 2.0 * elements as f32 * 0.01;
        assert!((penalty - expected).abs() < expected * 0.01);
    }

    #[test]
    fn penalty_gradient_points_back_toward_the_anchor() {
        let mut stack = stack();
        let mut ewc = EwcRegularizer::new(1.0);
        let fisher = uniform_fisher(&stack, 1.0);
        ewc.consolidate(&stack, &fisher).unwrap();
        stack
            .visit_parameters_mut(&mut |param| {
                for value in param.value_mut().data_mut() {
                    *value += 0.5;
                }
                Ok(())
            })
            .unwrap();
        ewc.penalty_gradient(&mut stack).unwrap();
        stack
            .visit_parameters(&mut |param| {
                let grad = param.gradient().expect("penalty gradient accumulated");
                for g in grad.data() {
                    assert!((g - 0.5).abs() < 1e-6);
                }
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn consolidation_averages_fisher_across_tasks() {
        let stack = stack();
        let mut ewc = EwcRegularizer::new(1.0);
        ewc.consolidate(&stack, &uniform_fisher(&stack, 4.0)).unwrap();
        ewc.consolidate(&stack, &uniform_fisher(&stack, 2.0)).unwrap();
        assert_eq!(ewc.tasks_seen(), 2);
        // Running mean of 4.0 and 2.0 is 3.0.
        let sample = ewc.fisher.values().next().unwrap();
        assert!((sample.data()[0] - 3.0).abs() < 1e-5);
    }
}
