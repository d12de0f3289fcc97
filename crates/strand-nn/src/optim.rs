// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of Strand — Licensed under AGPL-3.0-or-later.

//! Adam optimizer over visitor-traversable modules.

use crate::module::Module;
use std::collections::HashMap;
use strand_tensor::{Tensor, TensorError, TensorResult};

/// Adam with per-parameter moment buffers keyed by parameter name, so the
/// same optimizer instance can follow a module across snapshot reloads.
/// The learning rate is externally mutable; the epoch scheduler pushes a new
/// value before every step.
pub struct AdamOptimizer {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step_count: u64,
    first_moments: HashMap<String, Tensor>,
    second_moments: HashMap<String, Tensor>,
}

impl AdamOptimizer {
    /// Creates an optimizer with the standard `β1=0.9, β2=0.999, eps=1e-8`.
    pub fn new(learning_rate: f32) -> TensorResult<Self> {
        Self::with_betas(learning_rate, 0.9, 0.999, 1e-8)
    }

    pub fn with_betas(
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    ) -> TensorResult<Self> {
        if !learning_rate.is_finite() || learning_rate <= 0.0 {
            return Err(TensorError::NonPositiveLearningRate {
                rate: learning_rate,
            });
        }
        if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) {
            return Err(TensorError::InvalidValue {
                label: "adam_betas_out_of_unit_interval",
            });
        }
        Ok(Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            step_count: 0,
            first_moments: HashMap::new(),
            second_moments: HashMap::new(),
        })
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Replaces the learning rate for subsequent steps.
    pub fn set_learning_rate(&mut self, learning_rate: f32) -> TensorResult<()> {
        if !learning_rate.is_finite() || learning_rate <= 0.0 {
            return Err(TensorError::NonPositiveLearningRate {
                rate: learning_rate,
            });
        }
        self.learning_rate = learning_rate;
        Ok(())
    }

    /// Number of completed optimization steps.
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Applies one update to every parameter carrying an accumulated
    /// gradient, then clears those accumulators. Parameters without
    /// gradients are untouched and do not advance their moment buffers.
    pub fn step(&mut self, module: &mut dyn Module) -> TensorResult<()> {
        self.step_count += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step_count as i32);
        let bias2 = 1.0 - self.beta2.powi(self.step_count as i32);
        let learning_rate = self.learning_rate;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let first_moments = &mut self.first_moments;
        let second_moments = &mut self.second_moments;
        module.visit_parameters_mut(&mut |param| {
            let Some(gradient) = param.gradient().cloned() else {
                return Ok(());
            };
            let (rows, cols) = gradient.shape();
            let first = first_moments
                .entry(param.name().to_string())
                .or_insert(Tensor::zeros(rows, cols)?);
            if first.shape() != gradient.shape() {
                return Err(TensorError::ShapeMismatch {
                    left: first.shape(),
                    right: gradient.shape(),
                });
            }
            for (m, g) in first.data_mut().iter_mut().zip(gradient.data().iter()) {
                *m = beta1 * *m + (1.0 - beta1) * g;
            }
            let first = first.clone();
            let second = second_moments
                .entry(param.name().to_string())
                .or_insert(Tensor::zeros(rows, cols)?);
            for (v, g) in second.data_mut().iter_mut().zip(gradient.data().iter()) {
                *v = beta2 * *v + (1.0 - beta2) * g * g;
            }
            let value = param.value_mut();
            for ((p, m), v) in value
                .data_mut()
                .iter_mut()
                .zip(first.data().iter())
                .zip(second.data().iter())
            {
                let m_hat = m / bias1;
                let v_hat = v / bias2;
                *p -= learning_rate * m_hat / (v_hat.sqrt() + epsilon);
            }
            param.zero_gradient();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Parameter;

    struct Single {
        weight: Parameter,
    }

    impl Single {
        fn new() -> Self {
            Self {
                weight: Parameter::new("weight", Tensor::zeros(1, 3).unwrap()),
            }
        }
    }

    impl Module for Single {
        fn visit_parameters(
            &self,
            visitor: &mut dyn FnMut(&Parameter) -> TensorResult<()>,
        ) -> TensorResult<()> {
            visitor(&self.weight)
        }

        fn visit_parameters_mut(
            &mut self,
            visitor: &mut dyn FnMut(&mut Parameter) -> TensorResult<()>,
        ) -> TensorResult<()> {
            visitor(&mut self.weight)
        }
    }

    #[test]
    fn rejects_non_positive_learning_rates() {
        assert!(AdamOptimizer::new(0.0).is_err());
        assert!(AdamOptimizer::new(-0.1).is_err());
        let mut optimizer = AdamOptimizer::new(0.01).unwrap();
        assert!(optimizer.set_learning_rate(0.0).is_err());
        optimizer.set_learning_rate(0.001).unwrap();
        assert!((optimizer.learning_rate() - 0.001).abs() < f32::EPSILON);
    }

    #[test]
    fn first_step_moves_against_the_gradient_by_about_lr() {
        let mut module = Single::new();
        let grad = Tensor::from_vec(1, 3, vec![1.0, -2.0, 0.5]).unwrap();
        module.weight.accumulate(&grad).unwrap();
        let mut optimizer = AdamOptimizer::new(0.01).unwrap();
        optimizer.step(&mut module).unwrap();
        // Bias correction makes the very first update ≈ lr * sign(g).
        let data = module.weight.value().data();
        assert!((data[0] + 0.01).abs() < 1e-4);
        assert!((data[1] - 0.01).abs() < 1e-4);
        assert!((data[2] + 0.01).abs() < 1e-4);
    }

    #[test]
    fn parameters_without_gradients_are_untouched() {
        let mut module = Single::new();
        let mut optimizer = AdamOptimizer::new(0.05).unwrap();
        optimizer.step(&mut module).unwrap();
        assert_eq!(module.weight.value().data(), &[0.0, 0.0, 0.0]);
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn zero_gradients_leave_parameters_in_place() {
        let mut module = Single::new();
        let start = vec![0.3, -1.2, 4.5];
        module
            .weight
            .load_value(&Tensor::from_vec(1, 3, start.clone()).unwrap())
            .unwrap();
        let zero = Tensor::zeros(1, 3).unwrap();
        let mut optimizer = AdamOptimizer::new(0.01).unwrap();
        // Zero gradients flow through the moment buffers but must not move
        // the parameter, even after repeated bias-corrected updates.
        for _ in 0..10 {
            module.weight.accumulate(&zero).unwrap();
            optimizer.step(&mut module).unwrap();
        }
        for (p, s) in module.weight.value().data().iter().zip(start.iter()) {
            assert!((p - s).abs() < 1e-6);
        }
        assert_eq!(optimizer.step_count(), 10);
    }

    #[test]
    fn moments_persist_across_steps() {
        let mut module = Single::new();
        let grad = Tensor::from_vec(1, 3, vec![1.0, 1.0, 1.0]).unwrap();
        let mut optimizer = AdamOptimizer::new(0.01).unwrap();
        module.weight.accumulate(&grad).unwrap();
        optimizer.step(&mut module).unwrap();
        let after_one = module.weight.value().clone();
        module.weight.accumulate(&grad).unwrap();
        optimizer.step(&mut module).unwrap();
        let after_two = module.weight.value();
        for (a, b) in after_one.data().iter().zip(after_two.data().iter()) {
            assert!(b < a, "updates keep descending while gradients persist");
        }
    }
}
