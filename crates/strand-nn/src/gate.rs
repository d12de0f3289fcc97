// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of Strand — Licensed under AGPL-3.0-or-later.

//! Attention-gated graph layer.
//!
//! One layer scores its neighbors with cosine attention over projected
//! queries/keys, aggregates projected values, then fuses the aggregate into
//! the node's own representation through a single-step GRU-style gate. The
//! fusion is spatial, not temporal: one gate evaluation per layer. Training
//! mode applies inverted dropout before the final layer normalisation.
//!
//! The forward pass caches its intermediates behind a `RefCell` so that
//! `backward` can run the exact analytic gradient without re-deriving the
//! activations, mirroring how the recurrent layers in this workspace replay
//! their gate caches.

use crate::module::{Module, Parameter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use strand_tensor::{Tensor, TensorError, TensorResult};

const NORM_FLOOR: f32 = 1e-8;

/// Hyper-parameters shared by every layer of a refiner stack.
#[derive(Clone, Copy, Debug)]
pub struct GateConfig {
    /// Softmax temperature applied to attention scores.
    pub temperature: f32,
    /// Probability of zeroing an element during training.
    pub dropout_rate: f32,
    /// Layer-normalisation epsilon.
    pub epsilon: f32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            dropout_rate: 0.1,
            epsilon: 1e-5,
        }
    }
}

struct ForwardCache {
    node: Tensor,
    neighbors: Vec<Tensor>,
    edge_weights: Vec<f32>,
    query: Tensor,
    keys: Vec<Tensor>,
    values: Vec<Tensor>,
    cosines: Vec<f32>,
    attention: Vec<f32>,
    gate_input: Tensor,
    candidate_input: Tensor,
    update: Tensor,
    reset: Tensor,
    candidate: Tensor,
    dropout_mask: Option<Tensor>,
    normed: Tensor,
    inv_std: f32,
}

/// A single attention-gated refinement layer.
///
/// `node_dim` is the width of the center-node input (the raw embedding width
/// for the first layer, the hidden width for deeper layers); `neighbor_dim`
/// is always the raw embedding width because stacks feed every layer the
/// original neighbor set.
pub struct AttentionGate {
    node_dim: usize,
    neighbor_dim: usize,
    hidden_dim: usize,
    config: GateConfig,
    w_query: Parameter,
    w_key: Parameter,
    w_value: Parameter,
    // Reserved output projection; loaded and saved but not applied in the
    // current forward contract.
    w_out: Parameter,
    w_update: Parameter,
    w_reset: Parameter,
    w_candidate: Parameter,
    gamma: Parameter,
    beta: Parameter,
    rng: RefCell<StdRng>,
    cache: RefCell<Option<ForwardCache>>,
}

fn concat_cols(a: &Tensor, b: &Tensor) -> TensorResult<Tensor> {
    if a.rows() != 1 || b.rows() != 1 {
        return Err(TensorError::ShapeMismatch {
            left: a.shape(),
            right: b.shape(),
        });
    }
    let mut data = Vec::with_capacity(a.cols() + b.cols());
    data.extend_from_slice(a.data());
    data.extend_from_slice(b.data());
    Tensor::from_vec(1, a.cols() + b.cols(), data)
}

fn split_cols(t: &Tensor, left_cols: usize) -> TensorResult<(Tensor, Tensor)> {
    if t.rows() != 1 || left_cols >= t.cols() {
        return Err(TensorError::InvalidValue {
            label: "split_point_out_of_range",
        });
    }
    let left = Tensor::from_vec(1, left_cols, t.data()[..left_cols].to_vec())?;
    let right = Tensor::from_vec(1, t.cols() - left_cols, t.data()[left_cols..].to_vec())?;
    Ok((left, right))
}

impl AttentionGate {
    /// Builds a layer with Xavier-initialised projections and gates. The
    /// optional seed makes initialisation and dropout masks reproducible.
    pub fn new(
        name: impl Into<String>,
        node_dim: usize,
        neighbor_dim: usize,
        hidden_dim: usize,
        config: GateConfig,
        seed: Option<u64>,
    ) -> TensorResult<Self> {
        if node_dim == 0 || neighbor_dim == 0 || hidden_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: node_dim.min(neighbor_dim),
                cols: hidden_dim,
            });
        }
        if !(0.0..1.0).contains(&config.dropout_rate) {
            return Err(TensorError::InvalidValue {
                label: "dropout_rate_out_of_unit_interval",
            });
        }
        if !config.temperature.is_finite() || config.temperature <= 0.0 {
            return Err(TensorError::NonPositiveTemperature {
                temperature: config.temperature,
            });
        }
        let name = name.into();
        let mut salt = seed;
        let mut next_seed = || {
            // Derive one seed per tensor so layers sharing a base seed do not
            // start with identical matrices.
            salt = salt.map(|value| value.wrapping_mul(6364136223846793005).wrapping_add(1));
            salt
        };
        let gate_rows = 2 * hidden_dim;
        let layer = Self {
            node_dim,
            neighbor_dim,
            hidden_dim,
            config,
            w_query: Parameter::new(
                format!("{name}.w_query"),
                Tensor::xavier(node_dim, hidden_dim, next_seed())?,
            ),
            w_key: Parameter::new(
                format!("{name}.w_key"),
                Tensor::xavier(neighbor_dim, hidden_dim, next_seed())?,
            ),
            w_value: Parameter::new(
                format!("{name}.w_value"),
                Tensor::xavier(neighbor_dim, hidden_dim, next_seed())?,
            ),
            w_out: Parameter::new(
                format!("{name}.w_out"),
                Tensor::xavier(hidden_dim, hidden_dim, next_seed())?,
            ),
            w_update: Parameter::new(
                format!("{name}.w_update"),
                Tensor::xavier(gate_rows, hidden_dim, next_seed())?,
            ),
            w_reset: Parameter::new(
                format!("{name}.w_reset"),
                Tensor::xavier(gate_rows, hidden_dim, next_seed())?,
            ),
            w_candidate: Parameter::new(
                format!("{name}.w_candidate"),
                Tensor::xavier(gate_rows, hidden_dim, next_seed())?,
            ),
            gamma: Parameter::new(
                format!("{name}.gamma"),
                Tensor::from_fn(1, hidden_dim, |_, _| 1.0)?,
            ),
            beta: Parameter::new(format!("{name}.beta"), Tensor::zeros(1, hidden_dim)?),
            rng: RefCell::new(match seed {
                Some(value) => StdRng::seed_from_u64(value ^ 0x9e3779b97f4a7c15),
                None => StdRng::from_entropy(),
            }),
            cache: RefCell::new(None),
        };
        Ok(layer)
    }

    /// Width expected of the center-node input.
    pub fn node_dim(&self) -> usize {
        self.node_dim
    }

    /// Width expected of every neighbor embedding.
    pub fn neighbor_dim(&self) -> usize {
        self.neighbor_dim
    }

    /// Width of the produced embedding.
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    fn check_inputs(
        &self,
        node: &Tensor,
        neighbors: &[Tensor],
        edge_weights: Option<&[f32]>,
    ) -> TensorResult<()> {
        if node.shape() != (1, self.node_dim) {
            return Err(TensorError::ShapeMismatch {
                left: node.shape(),
                right: (1, self.node_dim),
            });
        }
        if neighbors.is_empty() {
            return Err(TensorError::EmptyInput("neighbor_embeddings"));
        }
        for neighbor in neighbors {
            if neighbor.shape() != (1, self.neighbor_dim) {
                return Err(TensorError::ShapeMismatch {
                    left: neighbor.shape(),
                    right: (1, self.neighbor_dim),
                });
            }
        }
        if let Some(weights) = edge_weights {
            if weights.len() != neighbors.len() {
                return Err(TensorError::DataLength {
                    expected: neighbors.len(),
                    got: weights.len(),
                });
            }
        }
        Ok(())
    }

    /// Runs the layer. Returns the refined embedding and the attention weight
    /// assigned to each neighbor (softmax, sums to 1).
    pub fn forward(
        &self,
        node: &Tensor,
        neighbors: &[Tensor],
        edge_weights: Option<&[f32]>,
        training: bool,
    ) -> TensorResult<(Tensor, Vec<f32>)> {
        self.check_inputs(node, neighbors, edge_weights)?;
        let weights: Vec<f32> = match edge_weights {
            Some(values) => values.to_vec(),
            None => vec![1.0; neighbors.len()],
        };

        let query = node.matmul(self.w_query.value())?;
        let mut keys = Vec::with_capacity(neighbors.len());
        let mut values = Vec::with_capacity(neighbors.len());
        let mut cosines = Vec::with_capacity(neighbors.len());
        let mut scores = Vec::with_capacity(neighbors.len());
        for (neighbor, weight) in neighbors.iter().zip(weights.iter()) {
            let key = neighbor.matmul(self.w_key.value())?;
            let value = neighbor.matmul(self.w_value.value())?;
            let cosine = query.cosine_similarity(&key)?;
            cosines.push(cosine);
            scores.push(cosine * weight);
            keys.push(key);
            values.push(value);
        }
        let attention = Tensor::from_vec(1, scores.len(), scores)?
            .softmax(self.config.temperature)?
            .data()
            .to_vec();

        let mut aggregated = Tensor::zeros(1, self.hidden_dim)?;
        for (value, weight) in values.iter().zip(attention.iter()) {
            aggregated.add_scaled(value, *weight)?;
        }

        // Single-step gated fusion: aggregate plays the role of the gate
        // input, the projected query is the prior hidden state.
        let gate_input = concat_cols(&aggregated, &query)?;
        let update = gate_input.matmul(self.w_update.value())?.sigmoid();
        let reset = gate_input.matmul(self.w_reset.value())?.sigmoid();
        let reset_hidden = reset.hadamard(&query)?;
        let candidate_input = concat_cols(&aggregated, &reset_hidden)?;
        let candidate = candidate_input.matmul(self.w_candidate.value())?.tanh();
        let one_minus_update = update.scale(-1.0).add(&Tensor::from_fn(
            1,
            self.hidden_dim,
            |_, _| 1.0,
        )?)?;
        let fused = one_minus_update
            .hadamard(&query)?
            .add(&update.hadamard(&candidate)?)?;

        let (dropped, dropout_mask) = if training && self.config.dropout_rate > 0.0 {
            let keep_scale = 1.0 / (1.0 - self.config.dropout_rate);
            let mut rng = self.rng.borrow_mut();
            let mask = Tensor::from_fn(1, self.hidden_dim, |_, _| {
                if rng.gen::<f32>() < self.config.dropout_rate {
                    0.0
                } else {
                    keep_scale
                }
            })?;
            (fused.hadamard(&mask)?, Some(mask))
        } else {
            (fused.clone(), None)
        };

        // Normalisation statistics are over every element of the vector.
        let n = dropped.len() as f32;
        let mean = dropped.data().iter().sum::<f32>() / n;
        let variance = dropped
            .data()
            .iter()
            .map(|&v| {
                let centered = v - mean;
                centered * centered
            })
            .sum::<f32>()
            / n;
        let inv_std = 1.0 / (variance + self.config.epsilon).sqrt();
        let normed = Tensor::from_vec(
            1,
            self.hidden_dim,
            dropped.data().iter().map(|&v| (v - mean) * inv_std).collect(),
        )?;
        let output = normed.hadamard(self.gamma.value())?.add(self.beta.value())?;

        *self.cache.borrow_mut() = Some(ForwardCache {
            node: node.clone(),
            neighbors: neighbors.to_vec(),
            edge_weights: weights,
            query,
            keys,
            values,
            cosines,
            attention: attention.clone(),
            gate_input,
            candidate_input,
            update,
            reset,
            candidate,
            dropout_mask,
            normed,
            inv_std,
        });

        Ok((output, attention))
    }

    /// Propagates `grad_output` back through the most recent forward pass,
    /// accumulating parameter gradients and returning the gradient with
    /// respect to the center-node input.
    pub fn backward(&mut self, grad_output: &Tensor) -> TensorResult<Tensor> {
        let cache_cell = self.cache.borrow();
        let cache = cache_cell.as_ref().ok_or(TensorError::InvalidValue {
            label: "backward_called_before_forward",
        })?;
        if grad_output.shape() != (1, self.hidden_dim) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (1, self.hidden_dim),
            });
        }

        // Layer norm (statistics over all elements):
        //   dx = (gh - mean(gh) - normed * mean(gh ⊙ normed)) * inv_std
        // with gh = gamma ⊙ grad.
        let grad_gamma = grad_output.hadamard(&cache.normed)?;
        let grad_beta = grad_output.clone();
        let gh = grad_output.hadamard(self.gamma.value())?;
        let n = self.hidden_dim as f32;
        let mean_gh = gh.data().iter().sum::<f32>() / n;
        let mean_gh_normed = gh
            .data()
            .iter()
            .zip(cache.normed.data().iter())
            .map(|(g, x)| g * x)
            .sum::<f32>()
            / n;
        let grad_dropped = Tensor::from_vec(
            1,
            self.hidden_dim,
            gh.data()
                .iter()
                .zip(cache.normed.data().iter())
                .map(|(&g, &x)| (g - mean_gh - x * mean_gh_normed) * cache.inv_std)
                .collect(),
        )?;

        let grad_fused = match cache.dropout_mask.as_ref() {
            Some(mask) => grad_dropped.hadamard(mask)?,
            None => grad_dropped,
        };

        // GRU fusion: fused = (1 - z) ⊙ q + z ⊙ c.
        let grad_update_gate = grad_fused.hadamard(&cache.candidate.sub(&cache.query)?)?;
        let grad_candidate = grad_fused.hadamard(&cache.update)?;
        let ones = Tensor::from_fn(1, self.hidden_dim, |_, _| 1.0)?;
        let mut grad_query = grad_fused.hadamard(&ones.sub(&cache.update)?)?;

        // Candidate branch: c = tanh(c_in · W_c).
        let grad_candidate_pre =
            grad_candidate.hadamard(&ones.sub(&cache.candidate.hadamard(&cache.candidate)?)?)?;
        let grad_w_candidate = cache.candidate_input.transpose().matmul(&grad_candidate_pre)?;
        let grad_candidate_in =
            grad_candidate_pre.matmul(&self.w_candidate.value().transpose())?;
        let (mut grad_aggregated, grad_reset_hidden) =
            split_cols(&grad_candidate_in, self.hidden_dim)?;
        let grad_reset_gate = grad_reset_hidden.hadamard(&cache.query)?;
        grad_query.add_scaled(&grad_reset_hidden.hadamard(&cache.reset)?, 1.0)?;

        // Sigmoid gates share the [aggregate | query] concatenation.
        let grad_update_pre = grad_update_gate
            .hadamard(&cache.update)?
            .hadamard(&ones.sub(&cache.update)?)?;
        let grad_reset_pre = grad_reset_gate
            .hadamard(&cache.reset)?
            .hadamard(&ones.sub(&cache.reset)?)?;
        let grad_w_update = cache.gate_input.transpose().matmul(&grad_update_pre)?;
        let grad_w_reset = cache.gate_input.transpose().matmul(&grad_reset_pre)?;
        let mut grad_gate_input = grad_update_pre.matmul(&self.w_update.value().transpose())?;
        grad_gate_input.add_scaled(
            &grad_reset_pre.matmul(&self.w_reset.value().transpose())?,
            1.0,
        )?;
        let (grad_agg_from_gates, grad_query_from_gates) =
            split_cols(&grad_gate_input, self.hidden_dim)?;
        grad_aggregated.add_scaled(&grad_agg_from_gates, 1.0)?;
        grad_query.add_scaled(&grad_query_from_gates, 1.0)?;

        // Attention: aggregate = Σ a_j v_j with a = softmax(cos(q, k_j) w_j / τ).
        let mut grad_attention = Vec::with_capacity(cache.values.len());
        for value in &cache.values {
            grad_attention.push(grad_aggregated.dot(value)?);
        }
        let weighted_sum: f32 = grad_attention
            .iter()
            .zip(cache.attention.iter())
            .map(|(g, a)| g * a)
            .sum();
        let query_norm = cache.query.l2_norm().max(NORM_FLOOR);

        let mut grad_w_key = Tensor::zeros(self.neighbor_dim, self.hidden_dim)?;
        let mut grad_w_value = Tensor::zeros(self.neighbor_dim, self.hidden_dim)?;
        for (j, neighbor) in cache.neighbors.iter().enumerate() {
            let grad_score = cache.attention[j] * (grad_attention[j] - weighted_sum)
                / self.config.temperature;
            let grad_cosine = grad_score * cache.edge_weights[j];
            let key = &cache.keys[j];
            let key_norm = key.l2_norm().max(NORM_FLOOR);
            let cosine = cache.cosines[j];

            // d cos(q, k) / dq = k / (|q||k|) - cos * q / |q|^2, symmetric in k.
            let mut grad_query_term = key.scale(1.0 / (query_norm * key_norm));
            grad_query_term
                .add_scaled(&cache.query, -cosine / (query_norm * query_norm))?;
            grad_query.add_scaled(&grad_query_term, grad_cosine)?;

            let mut grad_key = cache.query.scale(1.0 / (query_norm * key_norm));
            grad_key.add_scaled(key, -cosine / (key_norm * key_norm))?;
            let grad_key = grad_key.scale(grad_cosine);

            let grad_value = grad_aggregated.scale(cache.attention[j]);
            grad_w_key.add_scaled(&neighbor.transpose().matmul(&grad_key)?, 1.0)?;
            grad_w_value.add_scaled(&neighbor.transpose().matmul(&grad_value)?, 1.0)?;
        }

        let grad_w_query = cache.node.transpose().matmul(&grad_query)?;
        let grad_node = grad_query.matmul(&self.w_query.value().transpose())?;
        drop(cache_cell);

        self.gamma.accumulate(&grad_gamma)?;
        self.beta.accumulate(&grad_beta)?;
        self.w_candidate.accumulate(&grad_w_candidate)?;
        self.w_update.accumulate(&grad_w_update)?;
        self.w_reset.accumulate(&grad_w_reset)?;
        self.w_key.accumulate(&grad_w_key)?;
        self.w_value.accumulate(&grad_w_value)?;
        self.w_query.accumulate(&grad_w_query)?;

        Ok(grad_node)
    }
}

impl Module for AttentionGate {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> TensorResult<()>,
    ) -> TensorResult<()> {
        visitor(&self.w_query)?;
        visitor(&self.w_key)?;
        visitor(&self.w_value)?;
        visitor(&self.w_out)?;
        visitor(&self.w_update)?;
        visitor(&self.w_reset)?;
        visitor(&self.w_candidate)?;
        visitor(&self.gamma)?;
        visitor(&self.beta)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> TensorResult<()>,
    ) -> TensorResult<()> {
        visitor(&mut self.w_query)?;
        visitor(&mut self.w_key)?;
        visitor(&mut self.w_value)?;
        visitor(&mut self.w_out)?;
        visitor(&mut self.w_update)?;
        visitor(&mut self.w_reset)?;
        visitor(&mut self.w_candidate)?;
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inputs(dim: usize) -> (Tensor, Vec<Tensor>, Vec<f32>) {
        let node = Tensor::random_uniform(1, dim, -1.0, 1.0, Some(3)).unwrap();
        let neighbors = (0..3)
            .map(|i| Tensor::random_uniform(1, dim, -1.0, 1.0, Some(10 + i)).unwrap())
            .collect();
        (node, neighbors, vec![0.9, 0.5, 0.7])
    }

    #[test]
    fn forward_emits_hidden_width_and_normalised_attention() {
        let gate = AttentionGate::new("gate", 6, 6, 4, GateConfig::default(), Some(1)).unwrap();
        let (node, neighbors, weights) = sample_inputs(6);
        assert_eq!(gate.node_dim(), 6);
        assert_eq!(gate.neighbor_dim(), 6);
        assert_eq!(gate.hidden_dim(), 4);
        let (output, attention) = gate
            .forward(&node, &neighbors, Some(&weights), false)
            .unwrap();
        assert_eq!(output.shape(), (1, 4));
        assert_eq!(attention.len(), 3);
        let sum: f32 = attention.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(attention.iter().all(|a| *a > 0.0));
    }

    #[test]
    fn eval_mode_is_deterministic() {
        let gate = AttentionGate::new("gate", 5, 5, 3, GateConfig::default(), Some(2)).unwrap();
        let (node, neighbors, weights) = sample_inputs(5);
        let (a, _) = gate
            .forward(&node, &neighbors, Some(&weights), false)
            .unwrap();
        let (b, _) = gate
            .forward(&node, &neighbors, Some(&weights), false)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_misshapen_inputs() {
        let gate = AttentionGate::new("gate", 5, 5, 3, GateConfig::default(), Some(2)).unwrap();
        let bad_node = Tensor::zeros(1, 4).unwrap();
        let neighbors = vec![Tensor::zeros(1, 5).unwrap()];
        assert!(matches!(
            gate.forward(&bad_node, &neighbors, None, false),
            Err(TensorError::ShapeMismatch { .. })
        ));
        let node = Tensor::zeros(1, 5).unwrap();
        assert!(matches!(
            gate.forward(&node, &[], None, false),
            Err(TensorError::EmptyInput(_))
        ));
        assert!(matches!(
            gate.forward(&node, &neighbors, Some(&[1.0, 0.5]), false),
            Err(TensorError::DataLength { .. })
        ));
    }

    #[test]
    fn backward_requires_a_forward_pass() {
        let mut gate = AttentionGate::new("gate", 5, 5, 3, GateConfig::default(), Some(2)).unwrap();
        let grad = Tensor::zeros(1, 3).unwrap();
        assert!(gate.backward(&grad).is_err());
    }

    #[test]
    fn analytic_gradients_match_finite_differences() {
        let mut gate = AttentionGate::new(
            "gate",
            4,
            4,
            3,
            GateConfig {
                dropout_rate: 0.0,
                ..GateConfig::default()
            },
            Some(5),
        )
        .unwrap();
        let (node, neighbors, weights) = sample_inputs(4);
        let direction = Tensor::from_vec(1, 3, vec![0.6, -0.3, 0.8]).unwrap();

        gate.forward(&node, &neighbors, Some(&weights), false)
            .unwrap();
        let grad_node = gate.backward(&direction).unwrap();

        let mut analytic = std::collections::HashMap::new();
        gate.visit_parameters(&mut |param| {
            if let Some(grad) = param.gradient() {
                analytic.insert(param.name().to_string(), grad.clone());
            }
            Ok(())
        })
        .unwrap();

        let h = 1e-2f32;
        let loss_at = |gate: &AttentionGate| -> f32 {
            let (out, _) = gate
                .forward(&node, &neighbors, Some(&weights), false)
                .unwrap();
            out.dot(&direction).unwrap()
        };

        // Probe a handful of coordinates per parameter; f32 central
        // differences are noisy, so the tolerance is loose.
        let bump = |gate: &mut AttentionGate, target: &str, idx: usize, delta: f32| {
            gate.visit_parameters_mut(&mut |param| {
                if param.name() == target {
                    param.value_mut().data_mut()[idx] += delta;
                }
                Ok(())
            })
            .unwrap();
        };
        for target in [
            "gate.w_query",
            "gate.w_key",
            "gate.w_value",
            "gate.w_update",
            "gate.w_reset",
            "gate.w_candidate",
            "gate.gamma",
            "gate.beta",
        ] {
            let expected = analytic.get(target).unwrap().clone();
            for idx in [0usize, expected.len() / 2] {
                bump(&mut gate, target, idx, h);
                let plus = loss_at(&gate);
                bump(&mut gate, target, idx, -2.0 * h);
                let minus = loss_at(&gate);
                bump(&mut gate, target, idx, h);
                let numeric = (plus - minus) / (2.0 * h);
                let got = expected.data()[idx];
                assert!(
                    (numeric - got).abs() < 0.05 + 0.1 * numeric.abs().max(got.abs()),
                    "{target}[{idx}]: numeric {numeric} vs analytic {got}"
                );
            }
        }

        // Gradient w.r.t. the node input, same scheme.
        let mut node_probe = node.clone();
        let idx = 1usize;
        node_probe.data_mut()[idx] += h;
        let (out_plus, _) = gate
            .forward(&node_probe, &neighbors, Some(&weights), false)
            .unwrap();
        node_probe.data_mut()[idx] -= 2.0 * h;
        let (out_minus, _) = gate
            .forward(&node_probe, &neighbors, Some(&weights), false)
            .unwrap();
        let numeric =
            (out_plus.dot(&direction).unwrap() - out_minus.dot(&direction).unwrap()) / (2.0 * h);
        let got = grad_node.data()[idx];
        assert!(
            (numeric - got).abs() < 0.05 + 0.1 * numeric.abs().max(got.abs()),
            "node[{idx}]: numeric {numeric} vs analytic {got}"
        );
    }
}
