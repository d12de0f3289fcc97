// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of Strand — Licensed under AGPL-3.0-or-later.

//! Multi-layer refiner.
//!
//! Layers deepen the center node's transformation only: every layer attends
//! over the same original neighbor embeddings, so depth never widens the
//! receptive field beyond one hop. This shallow-aggregation shape is
//! intentional and callers relying on interpretable per-layer attention
//! depend on it.

use crate::gate::{AttentionGate, GateConfig};
use crate::module::{Module, Parameter};
use strand_tensor::{Tensor, TensorResult};

/// Stack of [`AttentionGate`] layers sharing one neighbor set.
pub struct RefinerStack {
    layers: Vec<AttentionGate>,
    input_dim: usize,
    hidden_dim: usize,
}

impl RefinerStack {
    /// Builds `num_layers` gates. The first layer consumes raw embeddings of
    /// width `input_dim`; deeper layers consume the previous layer's
    /// `hidden_dim` output, while neighbor projections stay sized for the raw
    /// width throughout.
    pub fn new(
        name: impl Into<String>,
        input_dim: usize,
        hidden_dim: usize,
        num_layers: usize,
        config: GateConfig,
        seed: Option<u64>,
    ) -> TensorResult<Self> {
        let name = name.into();
        if num_layers == 0 {
            return Err(strand_tensor::TensorError::InvalidValue {
                label: "refiner_stack_needs_at_least_one_layer",
            });
        }
        let mut layers = Vec::with_capacity(num_layers);
        for index in 0..num_layers {
            let node_dim = if index == 0 { input_dim } else { hidden_dim };
            let layer_seed = seed.map(|value| value.wrapping_add(index as u64 * 7919));
            layers.push(AttentionGate::new(
                format!("{name}.layer{index}"),
                node_dim,
                input_dim,
                hidden_dim,
                config,
                layer_seed,
            )?);
        }
        Ok(Self {
            layers,
            input_dim,
            hidden_dim,
        })
    }

    /// Number of stacked layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Raw embedding width consumed by the stack.
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Width of the refined embedding.
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Runs every layer. Returns the final embedding plus each layer's
    /// attention weights, outermost layer first.
    ///
    /// An empty neighbor set is not an error: the node stands in as its own
    /// sole neighbor with edge weight 1.0.
    pub fn forward(
        &self,
        node: &Tensor,
        neighbors: &[Tensor],
        edge_weights: Option<&[f32]>,
        training: bool,
    ) -> TensorResult<(Tensor, Vec<Vec<f32>>)> {
        let self_neighbor;
        let self_weights;
        let (effective_neighbors, effective_weights): (&[Tensor], Option<&[f32]>) =
            if neighbors.is_empty() {
                self_neighbor = [node.clone()];
                self_weights = [1.0f32];
                (&self_neighbor, Some(&self_weights))
            } else {
                (neighbors, edge_weights)
            };

        let mut current = node.clone();
        let mut attention_per_layer = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (output, attention) =
                layer.forward(&current, effective_neighbors, effective_weights, training)?;
            attention_per_layer.push(attention);
            current = output;
        }
        Ok((current, attention_per_layer))
    }

    /// Chains gradients through the layers in reverse, accumulating parameter
    /// gradients along the way, and returns the gradient with respect to the
    /// raw node embedding.
    pub fn backward(&mut self, grad_output: &Tensor) -> TensorResult<Tensor> {
        let mut grad = grad_output.clone();
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad)?;
        }
        Ok(grad)
    }
}

impl Module for RefinerStack {
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> TensorResult<()>,
    ) -> TensorResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> TensorResult<()>,
    ) -> TensorResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }
}
