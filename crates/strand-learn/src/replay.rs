// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of Strand — Licensed under AGPL-3.0-or-later.

//! Experience replay with distribution-shift detection.
//!
//! The buffer keeps a bounded sample of past training exemplars, tracks the
//! similarity stream with Welford's online statistics, and flags shifts by
//! comparing the two most recent similarity windows with a Gaussian KL
//! approximation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strand_tensor::Tensor;

/// One stored training example: an anchor with its contrastive partners and
/// the similarity observed when it was recorded.
#[derive(Clone, Debug)]
pub struct Exemplar {
    pub anchor: Tensor,
    pub positives: Vec<Tensor>,
    pub negatives: Vec<Tensor>,
    pub similarity: f32,
    /// Monotonic insertion sequence number, assigned by the buffer.
    pub timestamp: u64,
}

impl Exemplar {
    pub fn new(
        anchor: Tensor,
        positives: Vec<Tensor>,
        negatives: Vec<Tensor>,
        similarity: f32,
    ) -> Self {
        Self {
            anchor,
            positives,
            negatives,
            similarity,
            timestamp: 0,
        }
    }
}

/// Fixed-capacity reservoir of exemplars.
///
/// Replacement follows `idx = floor(random() * (p + 1))`, replacing only when
/// `idx` lands inside the buffer, with the position counter `p` advancing on
/// every add from the very first insertion. That admission curve is part of
/// the buffer's contract: downstream shift detection was tuned against it,
/// so it stays even though a textbook reservoir increments differently.
#[derive(Debug)]
pub struct ReplayBuffer {
    capacity: usize,
    items: Vec<Exemplar>,
    position: u64,
    sequence: u64,
    stats_count: u64,
    stats_mean: f64,
    stats_m2: f64,
    rng: StdRng,
}

impl ReplayBuffer {
    pub fn new(capacity: usize, seed: Option<u64>) -> Self {
        Self {
            capacity: capacity.max(1),
            items: Vec::new(),
            position: 0,
            sequence: 0,
            stats_count: 0,
            stats_mean: 0.0,
            stats_m2: 0.0,
            rng: match seed {
                Some(value) => StdRng::seed_from_u64(value),
                None => StdRng::from_entropy(),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of add calls observed, stored or not.
    pub fn observed(&self) -> u64 {
        self.position
    }

    /// Inserts an exemplar, stamping it with the next sequence number and
    /// folding its similarity into the running statistics.
    pub fn add(&mut self, mut exemplar: Exemplar) {
        exemplar.timestamp = self.sequence;
        self.sequence += 1;
        self.update_stats(exemplar.similarity);
        if self.items.len() < self.capacity {
            self.items.push(exemplar);
        } else {
            let slot = (self.rng.gen::<f64>() * (self.position + 1) as f64) as usize;
            if slot < self.capacity {
                self.items[slot] = exemplar;
            }
        }
        self.position += 1;
    }

    /// Uniform sample without replacement via a partial Fisher–Yates pass.
    pub fn sample(&mut self, n: usize) -> Vec<Exemplar> {
        let take = n.min(self.items.len());
        let mut indices: Vec<usize> = (0..self.items.len()).collect();
        for i in 0..take {
            let j = i + self.rng.gen_range(0..indices.len() - i);
            indices.swap(i, j);
        }
        indices
            .into_iter()
            .take(take)
            .map(|index| self.items[index].clone())
            .collect()
    }

    fn update_stats(&mut self, value: f32) {
        self.stats_count += 1;
        let delta = value as f64 - self.stats_mean;
        self.stats_mean += delta / self.stats_count as f64;
        let delta2 = value as f64 - self.stats_mean;
        self.stats_m2 += delta * delta2;
    }

    /// Running mean of the similarity stream.
    pub fn stream_mean(&self) -> f32 {
        self.stats_mean as f32
    }

    /// Running population variance of the similarity stream.
    pub fn stream_variance(&self) -> f32 {
        if self.stats_count == 0 {
            0.0
        } else {
            (self.stats_m2 / self.stats_count as f64) as f32
        }
    }

    fn window_stats(values: &[f32]) -> (f64, f64) {
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = values
            .iter()
            .map(|&v| {
                let centered = v as f64 - mean;
                centered * centered
            })
            .sum::<f64>()
            / n;
        (mean, variance)
    }

    /// Gaussian KL divergence between the similarities of the most recent
    /// `window_size` exemplars and the preceding window. Returns 0 when
    /// fewer than `2 * window_size` exemplars are stored or either window
    /// has zero variance.
    pub fn detect_distribution_shift(&self, window_size: usize) -> f32 {
        if window_size == 0 || self.items.len() < 2 * window_size {
            return 0.0;
        }
        let mut ordered: Vec<&Exemplar> = self.items.iter().collect();
        ordered.sort_by_key(|exemplar| exemplar.timestamp);
        let recent: Vec<f32> = ordered[ordered.len() - window_size..]
            .iter()
            .map(|e| e.similarity)
            .collect();
        let historic: Vec<f32> = ordered[ordered.len() - 2 * window_size..ordered.len() - window_size]
            .iter()
            .map(|e| e.similarity)
            .collect();
        let (mean_recent, var_recent) = Self::window_stats(&recent);
        let (mean_hist, var_hist) = Self::window_stats(&historic);
        if var_recent == 0.0 || var_hist == 0.0 {
            return 0.0;
        }
        let kl = (var_hist / var_recent).sqrt().ln()
            + (var_recent + (mean_recent - mean_hist).powi(2)) / (2.0 * var_hist)
            - 0.5;
        kl.abs() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_tensor::Tensor;

    fn exemplar(similarity: f32) -> Exemplar {
        let anchor = Tensor::from_vec(1, 2, vec![similarity, 1.0]).unwrap();
        Exemplar::new(anchor.clone(), vec![anchor.clone()], vec![anchor], similarity)
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut buffer = ReplayBuffer::new(8, Some(1));
        for i in 0..100 {
            buffer.add(exemplar(i as f32 / 100.0));
        }
        assert_eq!(buffer.len(), 8);
        assert_eq!(buffer.capacity(), 8);
        assert_eq!(buffer.observed(), 100);
    }

    #[test]
    fn timestamps_increase_monotonically() {
        let mut buffer = ReplayBuffer::new(4, Some(2));
        for i in 0..4 {
            buffer.add(exemplar(i as f32));
        }
        let mut stamps: Vec<u64> = buffer.items.iter().map(|e| e.timestamp).collect();
        stamps.sort_unstable();
        assert_eq!(stamps, vec![0, 1, 2, 3]);
    }

    #[test]
    fn sample_is_without_replacement() {
        let mut buffer = ReplayBuffer::new(16, Some(3));
        for i in 0..16 {
            buffer.add(exemplar(i as f32));
        }
        let sample = buffer.sample(10);
        assert_eq!(sample.len(), 10);
        let mut stamps: Vec<u64> = sample.iter().map(|e| e.timestamp).collect();
        stamps.sort_unstable();
        stamps.dedup();
        assert_eq!(stamps.len(), 10);

        // Asking for more than stored returns everything once.
        let all = buffer.sample(100);
        assert_eq!(all.len(), 16);
    }

    #[test]
    fn welford_tracks_the_similarity_stream() {
        let mut buffer = ReplayBuffer::new(8, Some(4));
        for value in [0.2f32, 0.4, 0.6, 0.8] {
            buffer.add(exemplar(value));
        }
        assert!((buffer.stream_mean() - 0.5).abs() < 1e-6);
        assert!((buffer.stream_variance() - 0.05).abs() < 1e-6);
    }

    #[test]
    fn shift_is_zero_without_two_full_windows() {
        let mut buffer = ReplayBuffer::new(32, Some(5));
        for i in 0..7 {
            buffer.add(exemplar(i as f32 / 10.0));
        }
        assert_eq!(buffer.detect_distribution_shift(4), 0.0);
    }

    #[test]
    fn shift_is_zero_for_constant_windows() {
        let mut buffer = ReplayBuffer::new(32, Some(6));
        for _ in 0..16 {
            buffer.add(exemplar(0.5));
        }
        assert_eq!(buffer.detect_distribution_shift(8), 0.0);
    }

    #[test]
    fn a_moved_distribution_registers_positive_shift() {
        let mut buffer = ReplayBuffer::new(64, Some(7));
        for i in 0..16 {
            buffer.add(exemplar(0.2 + 0.01 * (i % 3) as f32));
        }
        for i in 0..16 {
            buffer.add(exemplar(0.8 + 0.01 * (i % 3) as f32));
        }
        let shift = buffer.detect_distribution_shift(16);
        assert!(shift > 0.5, "shift={shift}");
    }
}
