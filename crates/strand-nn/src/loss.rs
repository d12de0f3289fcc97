// SPDX-License-Identifier: AGPL-3.0-or-later
// Part of Strand — Licensed under AGPL-3.0-or-later.

//! InfoNCE-style contrastive objective over cosine similarities.

use strand_tensor::{Tensor, TensorError, TensorResult};

const NORM_FLOOR: f32 = 1e-8;

/// Contrastive loss:
/// `-mean(pos_scaled) + logsumexp(concat(pos_scaled, neg_scaled))`
/// where each scaled similarity is `cos(anchor, x) / temperature`.
#[derive(Clone, Copy, Debug)]
pub struct InfoNceLoss {
    temperature: f32,
}

impl InfoNceLoss {
    pub fn new(temperature: f32) -> TensorResult<Self> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(TensorError::NonPositiveTemperature { temperature });
        }
        Ok(Self { temperature })
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    fn scaled_similarities(
        &self,
        anchor: &Tensor,
        positives: &[Tensor],
        negatives: &[Tensor],
    ) -> TensorResult<(Vec<f32>, Vec<f32>)> {
        if positives.is_empty() {
            return Err(TensorError::EmptyInput("contrastive_positives"));
        }
        let mut positive_scores = Vec::with_capacity(positives.len());
        for positive in positives {
            positive_scores.push(anchor.cosine_similarity(positive)? / self.temperature);
        }
        let mut negative_scores = Vec::with_capacity(negatives.len());
        for negative in negatives {
            negative_scores.push(anchor.cosine_similarity(negative)? / self.temperature);
        }
        Ok((positive_scores, negative_scores))
    }

    /// Scalar loss value; lower when positives outscore negatives.
    pub fn evaluate(
        &self,
        anchor: &Tensor,
        positives: &[Tensor],
        negatives: &[Tensor],
    ) -> TensorResult<f32> {
        let (positive_scores, negative_scores) =
            self.scaled_similarities(anchor, positives, negatives)?;
        let mean_positive =
            positive_scores.iter().sum::<f32>() / positive_scores.len() as f32;
        let max = positive_scores
            .iter()
            .chain(negative_scores.iter())
            .fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        let sum_exp: f32 = positive_scores
            .iter()
            .chain(negative_scores.iter())
            .map(|&v| (v - max).exp())
            .sum();
        Ok(-mean_positive + max + sum_exp.ln())
    }

    /// Gradient of [`InfoNceLoss::evaluate`] with respect to the anchor.
    ///
    /// With `p_i = softmax(scores)` over the concatenated candidates,
    /// `dL/ds_i = p_i - 1/P` for positives and `p_i` for negatives, chained
    /// through the cosine derivative.
    pub fn gradient_wrt_anchor(
        &self,
        anchor: &Tensor,
        positives: &[Tensor],
        negatives: &[Tensor],
    ) -> TensorResult<Tensor> {
        let (positive_scores, negative_scores) =
            self.scaled_similarities(anchor, positives, negatives)?;
        let all_scores: Vec<f32> = positive_scores
            .iter()
            .chain(negative_scores.iter())
            .copied()
            .collect();
        let max = all_scores
            .iter()
            .fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
        let exps: Vec<f32> = all_scores.iter().map(|&v| (v - max).exp()).collect();
        let sum_exp: f32 = exps.iter().sum();

        let anchor_norm = anchor.l2_norm().max(NORM_FLOOR);
        let inv_positive_count = 1.0 / positives.len() as f32;
        let mut grad = Tensor::zeros(anchor.rows(), anchor.cols())?;
        for (index, candidate) in positives.iter().chain(negatives.iter()).enumerate() {
            let softmax_weight = exps[index] / sum_exp;
            let grad_score = if index < positives.len() {
                softmax_weight - inv_positive_count
            } else {
                softmax_weight
            };
            let candidate_norm = candidate.l2_norm().max(NORM_FLOOR);
            let cosine = all_scores[index] * self.temperature;
            // d cos(a, x) / da = x / (|a||x|) - cos * a / |a|^2.
            let mut grad_cosine = candidate.scale(1.0 / (anchor_norm * candidate_norm));
            grad_cosine.add_scaled(anchor, -cosine / (anchor_norm * anchor_norm))?;
            grad.add_scaled(&grad_cosine, grad_score / self.temperature)?;
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(values: Vec<f32>) -> Tensor {
        let t = Tensor::from_vec(1, values.len(), values).unwrap();
        let norm = t.l2_norm();
        t.scale(1.0 / norm)
    }

    #[test]
    fn rejects_non_positive_temperature() {
        assert!(InfoNceLoss::new(0.0).is_err());
        assert!(InfoNceLoss::new(-0.5).is_err());
        assert!(InfoNceLoss::new(f32::NAN).is_err());
    }

    #[test]
    fn requires_positives() {
        let loss = InfoNceLoss::new(0.5).unwrap();
        let anchor = unit(vec![1.0, 0.0, 0.0]);
        assert!(matches!(
            loss.evaluate(&anchor, &[], &[anchor.clone()]),
            Err(TensorError::EmptyInput(_))
        ));
    }

    #[test]
    fn aligned_positives_score_lower_than_misaligned() {
        let loss = InfoNceLoss::new(0.5).unwrap();
        let anchor = unit(vec![1.0, 0.1, 0.0]);
        let aligned = vec![unit(vec![0.9, 0.2, 0.0])];
        let misaligned = vec![unit(vec![-1.0, 0.3, 0.2])];
        let negatives = vec![unit(vec![0.0, 0.0, 1.0])];
        let good = loss.evaluate(&anchor, &aligned, &negatives).unwrap();
        let bad = loss.evaluate(&anchor, &misaligned, &negatives).unwrap();
        assert!(good < bad);
    }

    #[test]
    fn anchor_gradient_matches_finite_differences() {
        let loss = InfoNceLoss::new(0.7).unwrap();
        let anchor = Tensor::from_vec(1, 4, vec![0.4, -0.3, 0.8, 0.1]).unwrap();
        let positives = vec![
            Tensor::from_vec(1, 4, vec![0.5, -0.2, 0.7, 0.0]).unwrap(),
            Tensor::from_vec(1, 4, vec![0.3, -0.4, 0.9, 0.2]).unwrap(),
        ];
        let negatives = vec![
            Tensor::from_vec(1, 4, vec![-0.6, 0.8, -0.1, 0.3]).unwrap(),
            Tensor::from_vec(1, 4, vec![0.0, 1.0, 0.0, -0.5]).unwrap(),
        ];
        let grad = loss
            .gradient_wrt_anchor(&anchor, &positives, &negatives)
            .unwrap();
        let h = 1e-3f32;
        for idx in 0..4 {
            let mut plus = anchor.clone();
            plus.data_mut()[idx] += h;
            let mut minus = anchor.clone();
            minus.data_mut()[idx] -= h;
            let numeric = (loss.evaluate(&plus, &positives, &negatives).unwrap()
                - loss.evaluate(&minus, &positives, &negatives).unwrap())
                / (2.0 * h);
            assert!(
                (numeric - grad.data()[idx]).abs() < 1e-2,
                "idx {idx}: numeric {numeric} vs analytic {}",
                grad.data()[idx]
            );
        }
    }

    #[test]
    fn gradient_pulls_anchor_toward_positive() {
        let loss = InfoNceLoss::new(0.5).unwrap();
        let anchor = unit(vec![1.0, 0.0]);
        let positives = vec![unit(vec![0.0, 1.0])];
        let negatives = vec![unit(vec![-1.0, 0.0])];
        let grad = loss
            .gradient_wrt_anchor(&anchor, &positives, &negatives)
            .unwrap();
        let mut nudged = anchor.clone();
        nudged.add_scaled(&grad, -0.1).unwrap();
        let before = loss.evaluate(&anchor, &positives, &negatives).unwrap();
        let after = loss.evaluate(&nudged, &positives, &negatives).unwrap();
        assert!(after < before);
    }
}
