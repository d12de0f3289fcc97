// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of Strand — Licensed under AGPL-3.0-or-later.

//! Similarity graph over a sequence corpus.
//!
//! Edges connect pairs whose raw-embedding cosine similarity reaches the
//! threshold; weights are those similarities, frozen at build time. The graph
//! built for one training invocation never changes during that invocation:
//! refinement reads it, it does not rewrite it.

use crate::embed::EmbeddingProvider;
use crate::{LearnError, LearnResult};
use strand_tensor::Tensor;

/// Cosine similarity at or above which two sequences become neighbors.
pub const EDGE_THRESHOLD: f32 = 0.3;

/// A corpus entry with its precomputed raw embedding.
#[derive(Clone, Debug)]
pub struct SequenceRecord {
    pub id: String,
    pub payload: String,
    pub embedding: Tensor,
}

/// Static similarity graph. Construction is quadratic in corpus size, which
/// is a deliberate small-corpus trade-off; callers with large corpora need a
/// different builder, not a silently sparser graph.
#[derive(Clone, Debug)]
pub struct SimilarityGraph {
    nodes: Vec<SequenceRecord>,
    adjacency: Vec<Vec<(usize, f32)>>,
}

impl SimilarityGraph {
    /// Embeds every item and connects pairs at or above [`EDGE_THRESHOLD`].
    pub fn build<E: EmbeddingProvider>(
        embedder: &E,
        items: &[(String, String)],
    ) -> LearnResult<Self> {
        if items.is_empty() {
            return Err(LearnError::EmptyCorpus);
        }
        let mut nodes = Vec::with_capacity(items.len());
        for (id, payload) in items {
            nodes.push(SequenceRecord {
                id: id.clone(),
                payload: payload.clone(),
                embedding: embedder.embed(payload)?,
            });
        }
        let mut adjacency = vec![Vec::new(); nodes.len()];
        for i in 0..nodes.len() {
            for j in (i + 1)..nodes.len() {
                let similarity = nodes[i]
                    .embedding
                    .cosine_similarity(&nodes[j].embedding)?;
                if similarity >= EDGE_THRESHOLD {
                    adjacency[i].push((j, similarity));
                    adjacency[j].push((i, similarity));
                }
            }
        }
        Ok(Self { nodes, adjacency })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[SequenceRecord] {
        &self.nodes
    }

    /// Index of the record with the given id, if present.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.id == id)
    }

    /// Number of undirected edges.
    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(|edges| edges.len()).sum::<usize>() / 2
    }

    /// Neighbor embeddings and edge weights for a node. Empty when the node
    /// is isolated; callers substitute the node itself downstream.
    pub fn neighborhood(&self, index: usize) -> (Vec<Tensor>, Vec<f32>) {
        match self.adjacency.get(index) {
            Some(edges) => {
                let mut embeddings = Vec::with_capacity(edges.len());
                let mut weights = Vec::with_capacity(edges.len());
                for (neighbor, weight) in edges {
                    embeddings.push(self.nodes[*neighbor].embedding.clone());
                    weights.push(*weight);
                }
                (embeddings, weights)
            }
            None => (Vec::new(), Vec::new()),
        }
    }

    /// Neighborhood for an embedding that is not part of the graph, using
    /// the same edge threshold against every stored node.
    pub fn neighborhood_of_embedding(
        &self,
        embedding: &Tensor,
    ) -> LearnResult<(Vec<Tensor>, Vec<f32>)> {
        let mut embeddings = Vec::new();
        let mut weights = Vec::new();
        for node in &self.nodes {
            let similarity = embedding.cosine_similarity(&node.embedding)?;
            if similarity >= EDGE_THRESHOLD {
                embeddings.push(node.embedding.clone());
                weights.push(similarity);
            }
        }
        Ok((embeddings, weights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::KmerHashEmbedder;

    fn corpus() -> Vec<(String, String)> {
        vec![
            ("a1".into(), "ATGCGTATGCATTTGACCAT".into()),
            ("a2".into(), "ATGCGTATGCATTTGACCAG".into()),
            ("b1".into(), "GGGGGGCCCCCCAAAATTTT".into()),
        ]
    }

    #[test]
    fn similar_pairs_become_edges() {
        let embedder = KmerHashEmbedder::new(3, 64).unwrap();
        let graph = SimilarityGraph::build(&embedder, &corpus()).unwrap();
        assert_eq!(graph.len(), 3);
        let a1 = graph.index_of("a1").unwrap();
        let (neighbors, weights) = graph.neighborhood(a1);
        assert!(!neighbors.is_empty());
        assert!(weights.iter().all(|w| *w >= EDGE_THRESHOLD));
    }

    #[test]
    fn empty_corpus_is_an_error() {
        let embedder = KmerHashEmbedder::new(3, 64).unwrap();
        assert!(matches!(
            SimilarityGraph::build(&embedder, &[]),
            Err(LearnError::EmptyCorpus)
        ));
    }

    #[test]
    fn external_embedding_neighborhood_uses_the_same_threshold() {
        let embedder = KmerHashEmbedder::new(3, 64).unwrap();
        let graph = SimilarityGraph::build(&embedder, &corpus()).unwrap();
        let probe = embedder.embed("ATGCGTATGCATTTGACCAT").unwrap();
        let (neighbors, weights) = graph.neighborhood_of_embedding(&probe).unwrap();
        assert_eq!(neighbors.len(), weights.len());
        // The probe is identical to a1 and must at least pick it up.
        assert!(weights.iter().any(|w| *w > 0.99));
    }
}
