// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of Strand — Licensed under AGPL-3.0-or-later.

//! Continual-learning refinement of sequence embeddings.
//!
//! The crate wires the building blocks from `strand-nn` into a trainer that
//! keeps improving entity embeddings as feedback arrives: a similarity graph
//! over the corpus, an attention-gated refiner stack trained with an InfoNCE
//! objective, elastic weight consolidation to protect earlier tasks, and an
//! experience-replay buffer whose distribution-shift signal decides when to
//! consolidate.

pub mod embed;
pub mod ewc;
pub mod graph;
pub mod replay;
pub mod trainer;

use thiserror::Error;

pub use embed::{EmbeddingProvider, KmerHashEmbedder, OracleJudgement, ValidationOracle};
pub use ewc::EwcRegularizer;
pub use graph::{SequenceRecord, SimilarityGraph};
pub use replay::{Exemplar, ReplayBuffer};
pub use trainer::{
    CorpusItem, RefinerTrainer, ScheduleKind, SearchHit, TrainerConfig, TrainerPhase,
    TrainingMetrics, ValidationExample,
};

/// Result alias for refiner operations.
pub type LearnResult<T> = Result<T, LearnError>;

/// Errors surfaced by the refiner.
#[derive(Debug, Error)]
pub enum LearnError {
    #[error("tensor operation failed: {0}")]
    Tensor(#[from] strand_tensor::TensorError),
    #[error("corpus is empty; nothing to train or search")]
    EmptyCorpus,
    #[error("mismatched input lengths: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("invalid trainer configuration: {reason}")]
    InvalidConfig { reason: &'static str },
}
