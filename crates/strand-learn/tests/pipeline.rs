// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of Strand — Licensed under AGPL-3.0-or-later.

//! End-to-end refiner pipeline: train on a clustered corpus, search, fold
//! oracle feedback back in, and round-trip parameters.

use strand_learn::{
    CorpusItem, KmerHashEmbedder, OracleJudgement, RefinerTrainer, TrainerConfig, TrainerPhase,
    ValidationExample, ValidationOracle,
};

fn two_cluster_corpus() -> Vec<CorpusItem> {
    // Three TATA-rich sequences and two GC-rich sequences; within-cluster
    // edits are single-base, so raw k-mer similarity is high inside a
    // cluster and low across.
    vec![
        CorpusItem::new("tata1", "TATAAATATACGCGTATATATATACGTATATA"),
        CorpusItem::new("tata2", "TATAAATATACGCGTATATATATACGTATATT"),
        CorpusItem::new("tata3", "TATAAATATACGCGTATATATATACGTATAGA"),
        CorpusItem::new("gc1", "GGGCGGCCCGGGCCGGGCGGCCCGGGCCGGCC"),
        CorpusItem::new("gc2", "GGGCGGCCCGGGCCGGGCGGCCCGGGCCGGCG"),
    ]
}

fn trainer(seed: u64) -> RefinerTrainer<KmerHashEmbedder> {
    let embedder = KmerHashEmbedder::new(3, 48).unwrap();
    let config = TrainerConfig {
        hidden_dim: 24,
        num_layers: 2,
        batch_size: 3,
        seed: Some(seed),
        ..TrainerConfig::default()
    };
    RefinerTrainer::new(embedder, config).unwrap()
}

struct ClusterOracle;

impl ValidationOracle for ClusterOracle {
    fn validate(&self, query_id: &str, candidate_id: &str) -> OracleJudgement {
        let same = query_id.starts_with("tata") == candidate_id.starts_with("tata");
        OracleJudgement {
            is_match: same,
            confidence: 0.95,
        }
    }
}

#[test]
fn trained_search_keeps_clusters_together() {
    let mut trainer = trainer(7);
    let corpus = two_cluster_corpus();
    let validation = vec![
        ValidationExample {
            payload: "TATAAATATACGCGTATATATATACGTATATA".into(),
            expected_id: "tata1".into(),
        },
        ValidationExample {
            payload: "GGGCGGCCCGGGCCGGGCGGCCCGGGCCGGCC".into(),
            expected_id: "gc1".into(),
        },
    ];
    let metrics = trainer.train(&corpus, &validation, 12).unwrap();
    assert_eq!(trainer.phase(), TrainerPhase::Trained);
    assert_eq!(metrics.loss.len(), 12);
    assert!(metrics.loss.iter().all(|value| value.is_finite()));

    // Query identical to tata1: the other tata members must outrank every
    // gc member.
    let hits = trainer
        .search("TATAAATATACGCGTATATATATACGTATATA", &corpus, 5)
        .unwrap();
    assert_eq!(hits.len(), 5);
    let rank_of = |id: &str| hits.iter().position(|hit| hit.id == id).unwrap();
    assert!(rank_of("tata2") < rank_of("gc1"));
    assert!(rank_of("tata2") < rank_of("gc2"));
    assert!(rank_of("tata3") < rank_of("gc1"));
    assert!(rank_of("tata3") < rank_of("gc2"));
}

#[test]
fn search_respects_top_k_and_orders_by_score() {
    let trainer = trainer(11);
    let corpus = two_cluster_corpus();
    let hits = trainer
        .search("TATAAATATACGCGTATATATATACGTATATA", &corpus, 3)
        .unwrap();
    assert_eq!(hits.len(), 3);
    for window in hits.windows(2) {
        assert!(window[0].score >= window[1].score);
    }
}

#[test]
fn oracle_feedback_flows_into_motifs_and_replay() {
    let mut trainer = trainer(13);
    let corpus = two_cluster_corpus();
    trainer.train(&corpus, &[], 4).unwrap();

    let replay_before = trainer.replay().observed();
    let query = CorpusItem::new("tata1", "TATAAATATACGCGTATATATATACGTATATA");
    trainer
        .learn_from_feedback_with_oracle(&query, &corpus, &ClusterOracle)
        .unwrap();
    // One exemplar per judged corpus item.
    assert_eq!(trainer.replay().observed(), replay_before + 5);

    // Feedback-heavy boosting stays inside the clamp.
    for _ in 0..100 {
        trainer
            .learn_from_feedback_with_oracle(&query, &corpus, &ClusterOracle)
            .unwrap();
    }
    for motif in ["TATA", "CAAT", "GGGCGG", "AATAAA", "ATG"] {
        let weight = trainer.motif_weight(motif).unwrap();
        assert!((0.1..=5.0).contains(&weight), "{motif} weight {weight}");
    }
}

#[test]
fn saved_parameters_reproduce_search_results() {
    let mut trainer = trainer(17);
    let corpus = two_cluster_corpus();
    trainer.train(&corpus, &[], 6).unwrap();
    let blob = trainer.save_parameters().unwrap();
    let baseline = trainer
        .search("TATAAATATACGCGTATATATATACGTATATA", &corpus, 5)
        .unwrap();

    // A fresh trainer with different initial weights converges to the same
    // ranking once the saved parameters are loaded.
    let mut restored = trainer_with_seed_offset();
    restored.load_parameters(&blob).unwrap();
    let replayed = restored
        .search("TATAAATATACGCGTATATATATACGTATATA", &corpus, 5)
        .unwrap();
    let baseline_ids: Vec<&str> = baseline.iter().map(|hit| hit.id.as_str()).collect();
    let replayed_ids: Vec<&str> = replayed.iter().map(|hit| hit.id.as_str()).collect();
    assert_eq!(baseline_ids, replayed_ids);
    for (a, b) in baseline.iter().zip(replayed.iter()) {
        assert!((a.score - b.score).abs() < 1e-5);
    }
}

fn trainer_with_seed_offset() -> RefinerTrainer<KmerHashEmbedder> {
    trainer(99)
}
