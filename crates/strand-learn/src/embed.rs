// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of Strand — Licensed under AGPL-3.0-or-later.

//! Collaborator interfaces: the embedding generator and the homology oracle.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use strand_tensor::{Tensor, TensorError, TensorResult};

/// Produces fixed-width embeddings for raw sequence payloads.
pub trait EmbeddingProvider {
    /// Output width; every embedding is `1 x dimension`.
    fn dimension(&self) -> usize;

    fn embed(&self, payload: &str) -> TensorResult<Tensor>;
}

/// Binary homology judgement from an external validator, such as an
/// alignment tool.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OracleJudgement {
    pub is_match: bool,
    pub confidence: f32,
}

/// External ground-truth source for feedback learning.
pub trait ValidationOracle {
    fn validate(&self, query_id: &str, candidate_id: &str) -> OracleJudgement;
}

/// Deterministic hashed k-mer bag embedder.
///
/// Each k-mer of the payload is hashed into one of `dimension` buckets and
/// counted; the bucket vector is L2-normalised. Not a learned embedding, but
/// similar sequences share k-mers and therefore land close in cosine space,
/// which is all the refiner needs from its provider.
#[derive(Clone, Debug)]
pub struct KmerHashEmbedder {
    k: usize,
    dimension: usize,
}

impl KmerHashEmbedder {
    pub fn new(k: usize, dimension: usize) -> TensorResult<Self> {
        if k == 0 {
            return Err(TensorError::InvalidValue {
                label: "kmer_length_must_be_positive",
            });
        }
        if dimension == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: 1,
                cols: dimension,
            });
        }
        Ok(Self { k, dimension })
    }

    fn bucket(&self, kmer: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        kmer.hash(&mut hasher);
        (hasher.finish() % self.dimension as u64) as usize
    }
}

impl EmbeddingProvider for KmerHashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, payload: &str) -> TensorResult<Tensor> {
        let mut buckets = vec![0.0f32; self.dimension];
        let chars: Vec<char> = payload.chars().collect();
        if chars.len() >= self.k {
            for window in chars.windows(self.k) {
                let kmer: String = window.iter().collect();
                buckets[self.bucket(&kmer)] += 1.0;
            }
        }
        let norm = buckets.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut buckets {
                *value /= norm;
            }
        }
        Tensor::from_vec(1, self.dimension, buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_deterministic_and_unit_length() {
        let embedder = KmerHashEmbedder::new(3, 32).unwrap();
        let a = embedder.embed("ATGCGTATGC").unwrap();
        let b = embedder.embed("ATGCGTATGC").unwrap();
        assert_eq!(a, b);
        assert!((a.l2_norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn similar_sequences_score_higher_than_dissimilar() {
        let embedder = KmerHashEmbedder::new(3, 64).unwrap();
        let base = embedder.embed("ATGCGTATGCATTTGACCAT").unwrap();
        let near = embedder.embed("ATGCGTATGCATTTGACCAG").unwrap();
        let far = embedder.embed("GGGGGGCCCCCCAAAATTTT").unwrap();
        let close = base.cosine_similarity(&near).unwrap();
        let distant = base.cosine_similarity(&far).unwrap();
        assert!(close > distant);
    }

    #[test]
    fn short_payload_embeds_to_zero_vector() {
        let embedder = KmerHashEmbedder::new(5, 16).unwrap();
        let t = embedder.embed("ATG").unwrap();
        assert_eq!(t.l2_norm(), 0.0);
    }
}
