// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of Strand — Licensed under AGPL-3.0-or-later.

//! Training orchestrator.
//!
//! Drives the refiner stack through the epoch loop: fresh-versus-replay batch
//! selection, contrastive training with the EWC penalty, scheduler-driven
//! learning rates, nearest-neighbor validation, and shift-gated
//! consolidation. Also owns the motif-weight table that feedback learning
//! adjusts and search scoring reads.

use crate::embed::{EmbeddingProvider, OracleJudgement, ValidationOracle};
use crate::ewc::EwcRegularizer;
use crate::graph::SimilarityGraph;
use crate::replay::{Exemplar, ReplayBuffer};
use crate::{LearnError, LearnResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use strand_nn::{io, AdamOptimizer, GateConfig, InfoNceLoss, LrSchedule, Module, RefinerStack};
use strand_tensor::Tensor;
use tracing::{debug, info, warn};

const POSITIVES_PER_TRIPLE: usize = 3;
const NEGATIVES_PER_TRIPLE: usize = 5;
const CONSOLIDATION_CHECK_INTERVAL: usize = 10;
const MISSED_MATCH_SIMILARITY: f32 = 0.9;
const FALSE_POSITIVE_SIMILARITY: f32 = 0.8;
const MOTIF_WEIGHT_MIN: f32 = 0.1;
const MOTIF_WEIGHT_MAX: f32 = 5.0;

/// Regulatory motifs seeding the weight table before any feedback arrives.
const MOTIF_PRIORS: &[(&str, f32)] = &[
    ("TATA", 1.5),   // TATA box
    ("CAAT", 1.3),   // CAAT box
    ("GGGCGG", 1.4), // GC box
    ("AATAAA", 1.2), // polyadenylation signal
    ("ATG", 1.1),    // start codon
];

/// An identified sequence payload, as supplied by callers.
#[derive(Clone, Debug)]
pub struct CorpusItem {
    pub id: String,
    pub payload: String,
}

impl CorpusItem {
    pub fn new(id: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
        }
    }
}

/// A held-out query labelled with the corpus id it should retrieve first.
#[derive(Clone, Debug)]
pub struct ValidationExample {
    pub payload: String,
    pub expected_id: String,
}

/// One ranked search result.
#[derive(Clone, Debug)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
}

/// Where the trainer currently is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainerPhase {
    Idle,
    BuildingGraph,
    Training(usize),
    Evaluating,
    Consolidating,
    Trained,
}

/// Per-epoch training curves.
#[derive(Clone, Debug, Default)]
pub struct TrainingMetrics {
    pub loss: Vec<f32>,
    pub accuracy: Vec<f32>,
    pub distribution_shift: Vec<f32>,
}

/// Learning-rate policy selector; the concrete schedule is instantiated per
/// `train` call because the horizon is the requested epoch count.
#[derive(Clone, Copy, Debug)]
pub enum ScheduleKind {
    Cosine,
    WarmupLinear { warmup_steps: usize },
    Plateau,
    Constant,
}

#[derive(Clone, Debug)]
pub struct TrainerConfig {
    pub hidden_dim: usize,
    pub num_layers: usize,
    pub gate: GateConfig,
    pub loss_temperature: f32,
    pub base_learning_rate: f32,
    pub min_learning_rate: f32,
    pub schedule: ScheduleKind,
    pub batch_size: usize,
    pub replay_capacity: usize,
    pub replay_probability: f32,
    pub shift_window: usize,
    pub shift_threshold: f32,
    pub ewc_lambda: f32,
    /// Share of the refined cosine in the search blend; the raw cosine gets
    /// the remainder.
    pub blend_weight: f32,
    pub seed: Option<u64>,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 64,
            num_layers: 2,
            gate: GateConfig::default(),
            loss_temperature: 0.5,
            base_learning_rate: 0.01,
            min_learning_rate: 1e-6,
            schedule: ScheduleKind::Cosine,
            batch_size: 4,
            replay_capacity: 256,
            replay_probability: 0.3,
            shift_window: 16,
            shift_threshold: 0.5,
            ewc_lambda: 40.0,
            blend_weight: 0.7,
            seed: None,
        }
    }
}

/// Continual-learning trainer around a [`RefinerStack`].
pub struct RefinerTrainer<E: EmbeddingProvider> {
    embedder: E,
    config: TrainerConfig,
    stack: RefinerStack,
    optimizer: AdamOptimizer,
    loss: InfoNceLoss,
    ewc: EwcRegularizer,
    replay: ReplayBuffer,
    motif_weights: HashMap<String, f32>,
    phase: TrainerPhase,
    rng: StdRng,
}

impl<E: EmbeddingProvider> RefinerTrainer<E> {
    pub fn new(embedder: E, config: TrainerConfig) -> LearnResult<Self> {
        if config.batch_size == 0 {
            return Err(LearnError::InvalidConfig {
                reason: "batch_size must be positive",
            });
        }
        if !(0.0..=1.0).contains(&config.replay_probability) {
            return Err(LearnError::InvalidConfig {
                reason: "replay_probability must lie in [0, 1]",
            });
        }
        if !(0.0..=1.0).contains(&config.blend_weight) {
            return Err(LearnError::InvalidConfig {
                reason: "blend_weight must lie in [0, 1]",
            });
        }
        let stack = RefinerStack::new(
            "refiner",
            embedder.dimension(),
            config.hidden_dim,
            config.num_layers,
            config.gate,
            config.seed,
        )?;
        let optimizer = AdamOptimizer::new(config.base_learning_rate)?;
        let loss = InfoNceLoss::new(config.loss_temperature)?;
        let replay = ReplayBuffer::new(config.replay_capacity, config.seed);
        let motif_weights = MOTIF_PRIORS
            .iter()
            .map(|(motif, weight)| (motif.to_string(), *weight))
            .collect();
        let rng = match config.seed {
            Some(value) => StdRng::seed_from_u64(value.wrapping_add(0x5eed)),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            embedder,
            ewc: EwcRegularizer::new(config.ewc_lambda),
            config,
            stack,
            optimizer,
            loss,
            replay,
            motif_weights,
            phase: TrainerPhase::Idle,
            rng,
        })
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate()
    }

    pub fn replay(&self) -> &ReplayBuffer {
        &self.replay
    }

    pub fn motif_weight(&self, motif: &str) -> Option<f32> {
        self.motif_weights.get(motif).copied()
    }

    fn build_schedule(&self, epochs: usize) -> LearnResult<LrSchedule> {
        let base = self.config.base_learning_rate;
        let min = self.config.min_learning_rate;
        let schedule = match self.config.schedule {
            ScheduleKind::Cosine => LrSchedule::cosine(base, min, epochs.max(1))?,
            ScheduleKind::WarmupLinear { warmup_steps } => {
                LrSchedule::warmup_linear(base, min, warmup_steps.max(1), epochs.max(2))?
            }
            ScheduleKind::Plateau => LrSchedule::plateau(base, min)?,
            ScheduleKind::Constant => LrSchedule::constant(base)?,
        };
        Ok(schedule)
    }

    /// Inference forward pass through the trained stack: no dropout, empty
    /// neighbor sets substitute the node itself.
    pub fn forward(
        &self,
        node_embedding: &Tensor,
        neighbor_embeddings: &[Tensor],
        edge_weights: Option<&[f32]>,
    ) -> LearnResult<(Tensor, Vec<Vec<f32>>)> {
        Ok(self
            .stack
            .forward(node_embedding, neighbor_embeddings, edge_weights, false)?)
    }

    fn refine_in_graph(&self, embedding: &Tensor, graph: &SimilarityGraph) -> LearnResult<Tensor> {
        let (neighbors, weights) = graph.neighborhood_of_embedding(embedding)?;
        let edge_weights = (!weights.is_empty()).then_some(weights.as_slice());
        let (refined, _) = self.stack.forward(embedding, &neighbors, edge_weights, false)?;
        Ok(refined)
    }

    fn refine_node(&self, graph: &SimilarityGraph, index: usize) -> LearnResult<Tensor> {
        let (neighbors, weights) = graph.neighborhood(index);
        let edge_weights = (!weights.is_empty()).then_some(weights.as_slice());
        let node = &graph.nodes()[index].embedding;
        let (refined, _) = self.stack.forward(node, &neighbors, edge_weights, false)?;
        Ok(refined)
    }

    /// Refines a partner embedding in isolation (self as sole neighbor).
    fn refine_isolated(&self, embedding: &Tensor, training: bool) -> LearnResult<Tensor> {
        let (refined, _) = self.stack.forward(embedding, &[], None, training)?;
        Ok(refined)
    }

    fn fresh_batch(&mut self, graph: &SimilarityGraph) -> LearnResult<Vec<(Exemplar, Option<usize>)>> {
        let nodes = graph.nodes();
        let mut batch = Vec::with_capacity(self.config.batch_size);
        for _ in 0..self.config.batch_size {
            let anchor_index = self.rng.gen_range(0..nodes.len());
            let anchor = &nodes[anchor_index].embedding;
            let mut ranked: Vec<(usize, f32)> = Vec::with_capacity(nodes.len() - 1);
            for (index, node) in nodes.iter().enumerate() {
                if index == anchor_index {
                    continue;
                }
                ranked.push((index, anchor.cosine_similarity(&node.embedding)?));
            }
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
            let positives: Vec<Tensor> = if ranked.is_empty() {
                vec![anchor.clone()]
            } else {
                ranked
                    .iter()
                    .take(POSITIVES_PER_TRIPLE)
                    .map(|(index, _)| nodes[*index].embedding.clone())
                    .collect()
            };
            let negatives: Vec<Tensor> = ranked
                .iter()
                .rev()
                .take(NEGATIVES_PER_TRIPLE)
                .map(|(index, _)| nodes[*index].embedding.clone())
                .collect();
            let similarity = ranked.first().map(|(_, s)| *s).unwrap_or(1.0);
            batch.push((
                Exemplar::new(anchor.clone(), positives, negatives, similarity),
                Some(anchor_index),
            ));
        }
        Ok(batch)
    }

    /// Refines an exemplar's partners and anchor, leaving the anchor's
    /// forward cache in place for the backward pass.
    fn refine_triple(
        &self,
        exemplar: &Exemplar,
        graph: &SimilarityGraph,
        anchor_index: Option<usize>,
        training: bool,
    ) -> LearnResult<(Tensor, Vec<Tensor>, Vec<Tensor>)> {
        let mut positives = Vec::with_capacity(exemplar.positives.len().max(1));
        for positive in &exemplar.positives {
            positives.push(self.refine_isolated(positive, training)?);
        }
        let mut negatives = Vec::with_capacity(exemplar.negatives.len());
        for negative in &exemplar.negatives {
            negatives.push(self.refine_isolated(negative, training)?);
        }
        // Anchor refined last so its activations stay cached for backward.
        let anchor = match anchor_index {
            Some(index) => {
                let (neighbors, weights) = graph.neighborhood(index);
                let edge_weights = (!weights.is_empty()).then_some(weights.as_slice());
                let (refined, _) =
                    self.stack
                        .forward(&exemplar.anchor, &neighbors, edge_weights, training)?;
                refined
            }
            None => self.refine_isolated(&exemplar.anchor, training)?,
        };
        if positives.is_empty() {
            // Negative-only feedback exemplar: the anchor stands in as its
            // own positive, contributing no pull but keeping the push away
            // from the negatives well defined.
            positives.push(anchor.clone());
        }
        Ok((anchor, positives, negatives))
    }

    /// Runs the full training loop and returns the per-epoch curves.
    pub fn train(
        &mut self,
        training_set: &[CorpusItem],
        validation_set: &[ValidationExample],
        epochs: usize,
    ) -> LearnResult<TrainingMetrics> {
        if training_set.is_empty() {
            return Err(LearnError::EmptyCorpus);
        }
        self.phase = TrainerPhase::BuildingGraph;
        let pairs: Vec<(String, String)> = training_set
            .iter()
            .map(|item| (item.id.clone(), item.payload.clone()))
            .collect();
        let graph = SimilarityGraph::build(&self.embedder, &pairs)?;
        info!(
            nodes = graph.len(),
            edges = graph.edge_count(),
            "similarity graph built"
        );

        let mut schedule = self.build_schedule(epochs)?;
        let mut metrics = TrainingMetrics::default();

        for epoch in 0..epochs {
            self.phase = TrainerPhase::Training(epoch);
            let from_replay =
                !self.replay.is_empty() && self.rng.gen::<f32>() < self.config.replay_probability;
            let batch: Vec<(Exemplar, Option<usize>)> = if from_replay {
                self.replay
                    .sample(self.config.batch_size)
                    .into_iter()
                    .map(|exemplar| (exemplar, None))
                    .collect()
            } else {
                self.fresh_batch(&graph)?
            };

            self.stack.zero_accumulators()?;
            let batch_scale = 1.0 / batch.len() as f32;
            let mut contrastive_total = 0.0f32;
            for (exemplar, anchor_index) in &batch {
                let (anchor, positives, negatives) =
                    self.refine_triple(exemplar, &graph, *anchor_index, true)?;
                contrastive_total += self.loss.evaluate(&anchor, &positives, &negatives)?;
                let grad = self
                    .loss
                    .gradient_wrt_anchor(&anchor, &positives, &negatives)?
                    .scale(batch_scale);
                self.stack.backward(&grad)?;

                let mut positive_similarity = 0.0f32;
                for positive in &positives {
                    positive_similarity += anchor.cosine_similarity(positive)?;
                }
                let mut stored = exemplar.clone();
                stored.similarity = positive_similarity / positives.len() as f32;
                self.replay.add(stored);
            }
            self.ewc.penalty_gradient(&mut self.stack)?;
            self.optimizer.step(&mut self.stack)?;

            let penalty = self.ewc.penalty(&self.stack)?;
            let epoch_loss = contrastive_total * batch_scale + penalty;
            let learning_rate = schedule.step(epoch, Some(epoch_loss));
            self.optimizer.set_learning_rate(learning_rate)?;

            self.phase = TrainerPhase::Evaluating;
            let accuracy = self.evaluate(&graph, validation_set)?;
            let shift = self.replay.detect_distribution_shift(self.config.shift_window);
            debug!(
                epoch,
                loss = epoch_loss,
                accuracy,
                shift,
                learning_rate,
                from_replay,
                "epoch complete"
            );
            metrics.loss.push(epoch_loss);
            metrics.accuracy.push(accuracy);
            metrics.distribution_shift.push(shift);

            if (epoch + 1) % CONSOLIDATION_CHECK_INTERVAL == 0
                && shift > self.config.shift_threshold
            {
                self.phase = TrainerPhase::Consolidating;
                info!(epoch, shift, "distribution shift detected, consolidating");
                self.consolidate_from_batch(&graph, &batch)?;
            }
        }

        self.phase = TrainerPhase::Trained;
        Ok(metrics)
    }

    /// Estimates a diagonal Fisher from the batch (mean squared gradient per
    /// parameter, computed in eval mode) and hands it to the regularizer.
    fn consolidate_from_batch(
        &mut self,
        graph: &SimilarityGraph,
        batch: &[(Exemplar, Option<usize>)],
    ) -> LearnResult<()> {
        self.stack.zero_accumulators()?;
        for (exemplar, anchor_index) in batch {
            let (anchor, positives, negatives) =
                self.refine_triple(exemplar, graph, *anchor_index, false)?;
            let grad = self.loss.gradient_wrt_anchor(&anchor, &positives, &negatives)?;
            self.stack.backward(&grad)?;
        }
        let scale = 1.0 / batch.len().max(1) as f32;
        let mut squared = HashMap::new();
        self.stack.visit_parameters(&mut |param| {
            if let Some(gradient) = param.gradient() {
                let (rows, cols) = gradient.shape();
                let mut fisher = Tensor::zeros(rows, cols)?;
                for (f, g) in fisher.data_mut().iter_mut().zip(gradient.data().iter()) {
                    *f = g * g * scale;
                }
                squared.insert(param.name().to_string(), fisher);
            }
            Ok(())
        })?;
        self.ewc.consolidate(&self.stack, &squared)?;
        self.stack.zero_accumulators()?;
        Ok(())
    }

    /// Nearest-neighbor validation accuracy over the labelled hold-out set.
    /// Queries whose expected id is absent from the graph are skipped and
    /// excluded from the denominator.
    fn evaluate(
        &self,
        graph: &SimilarityGraph,
        validation_set: &[ValidationExample],
    ) -> LearnResult<f32> {
        if validation_set.is_empty() {
            return Ok(0.0);
        }
        let mut refined_corpus = Vec::with_capacity(graph.len());
        for index in 0..graph.len() {
            refined_corpus.push(self.refine_node(graph, index)?);
        }
        let mut considered = 0usize;
        let mut correct = 0usize;
        for example in validation_set {
            if graph.index_of(&example.expected_id).is_none() {
                warn!(expected = %example.expected_id, "validation label missing from corpus, skipping");
                continue;
            }
            considered += 1;
            let raw_query = self.embedder.embed(&example.payload)?;
            let refined_query = self.refine_in_graph(&raw_query, graph)?;
            let mut best: Option<(usize, f32)> = None;
            for (index, node) in graph.nodes().iter().enumerate() {
                let refined = self.config.blend_weight
                    * refined_query.cosine_similarity(&refined_corpus[index])?;
                let raw = (1.0 - self.config.blend_weight)
                    * raw_query.cosine_similarity(&node.embedding)?;
                let score = refined + raw;
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((index, score));
                }
            }
            if let Some((index, _)) = best {
                if graph.nodes()[index].id == example.expected_id {
                    correct += 1;
                }
            }
        }
        if considered == 0 {
            return Ok(0.0);
        }
        Ok(correct as f32 / considered as f32)
    }

    fn shared_motifs(&self, left: &str, right: &str) -> Vec<String> {
        self.motif_weights
            .keys()
            .filter(|motif| left.contains(motif.as_str()) && right.contains(motif.as_str()))
            .cloned()
            .collect()
    }

    /// Mean learned weight of motifs shared between the two payloads, 1.0
    /// when they share none.
    fn motif_affinity(&self, left: &str, right: &str) -> f32 {
        let shared = self.shared_motifs(left, right);
        if shared.is_empty() {
            return 1.0;
        }
        let total: f32 = shared
            .iter()
            .filter_map(|motif| self.motif_weights.get(motif))
            .sum();
        total / shared.len() as f32
    }

    fn scale_shared_motifs(&mut self, left: &str, right: &str, factor: f32) {
        for motif in self.shared_motifs(left, right) {
            if let Some(weight) = self.motif_weights.get_mut(&motif) {
                *weight = (*weight * factor).clamp(MOTIF_WEIGHT_MIN, MOTIF_WEIGHT_MAX);
            }
        }
    }

    /// Folds oracle judgements about retrieved results back into the model:
    /// motif weights move on misses and false positives, and every judged
    /// pair becomes a replay exemplar with the oracle deciding polarity.
    pub fn learn_from_feedback(
        &mut self,
        query_payload: &str,
        retrieved: &[CorpusItem],
        labels: &[OracleJudgement],
    ) -> LearnResult<()> {
        if retrieved.len() != labels.len() {
            return Err(LearnError::LengthMismatch {
                left: retrieved.len(),
                right: labels.len(),
            });
        }
        let query_embedding = self.embedder.embed(query_payload)?;
        for (item, label) in retrieved.iter().zip(labels.iter()) {
            let item_embedding = self.embedder.embed(&item.payload)?;
            let similarity = query_embedding.cosine_similarity(&item_embedding)?;
            if label.is_match && similarity < MISSED_MATCH_SIMILARITY {
                debug!(id = %item.id, similarity, "missed homolog, boosting shared motifs");
                self.scale_shared_motifs(query_payload, &item.payload, 1.1);
            } else if !label.is_match && similarity > FALSE_POSITIVE_SIMILARITY {
                debug!(id = %item.id, similarity, "false positive, damping shared motifs");
                self.scale_shared_motifs(query_payload, &item.payload, 0.9);
            }
            let (positives, negatives) = if label.is_match {
                (vec![item_embedding], Vec::new())
            } else {
                (Vec::new(), vec![item_embedding])
            };
            self.replay.add(Exemplar::new(
                query_embedding.clone(),
                positives,
                negatives,
                similarity,
            ));
        }
        Ok(())
    }

    /// Convenience wrapper that asks the oracle for each retrieved item.
    pub fn learn_from_feedback_with_oracle<O: ValidationOracle + ?Sized>(
        &mut self,
        query: &CorpusItem,
        retrieved: &[CorpusItem],
        oracle: &O,
    ) -> LearnResult<()> {
        let labels: Vec<OracleJudgement> = retrieved
            .iter()
            .map(|item| oracle.validate(&query.id, &item.id))
            .collect();
        self.learn_from_feedback(&query.payload, retrieved, &labels)
    }

    /// Scores every corpus item against the query and returns the `top_k`
    /// best. The score blends refined and raw cosine similarity and is then
    /// scaled by the motif affinity between the two payloads. A fresh graph
    /// snapshot is built from the corpus for each call.
    pub fn search(
        &self,
        query_payload: &str,
        corpus: &[CorpusItem],
        top_k: usize,
    ) -> LearnResult<Vec<SearchHit>> {
        if corpus.is_empty() {
            return Err(LearnError::EmptyCorpus);
        }
        let pairs: Vec<(String, String)> = corpus
            .iter()
            .map(|item| (item.id.clone(), item.payload.clone()))
            .collect();
        let graph = SimilarityGraph::build(&self.embedder, &pairs)?;
        let raw_query = self.embedder.embed(query_payload)?;
        let refined_query = self.refine_in_graph(&raw_query, &graph)?;

        let mut hits = Vec::with_capacity(graph.len());
        for (index, node) in graph.nodes().iter().enumerate() {
            let refined_node = self.refine_node(&graph, index)?;
            let blended = self.config.blend_weight
                * refined_query.cosine_similarity(&refined_node)?
                + (1.0 - self.config.blend_weight)
                    * raw_query.cosine_similarity(&node.embedding)?;
            let score = blended * self.motif_affinity(query_payload, &node.payload);
            hits.push(SearchHit {
                id: node.id.clone(),
                score,
            });
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Serializes the stack's parameters into a versioned byte blob.
    pub fn save_parameters(&self) -> LearnResult<Vec<u8>> {
        Ok(io::save_blob(&self.stack)?)
    }

    /// Restores the stack's parameters from [`RefinerTrainer::save_parameters`] output.
    pub fn load_parameters(&mut self, blob: &[u8]) -> LearnResult<()> {
        Ok(io::load_blob(&mut self.stack, blob)?)
    }
}
